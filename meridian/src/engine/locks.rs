//! Striped per-document write locks.
//!
//! Writes to one document id must be serialized while writes to different
//! ids proceed in parallel. Ids hash into a fixed stripe array, so memory is
//! bounded regardless of how many ids a shard sees.

use parking_lot::{Mutex, MutexGuard};

const DEFAULT_STRIPES: usize = 1024;

pub struct KeyedLocks {
    stripes: Vec<Mutex<()>>,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl KeyedLocks {
    pub fn new(stripes: usize) -> Self {
        assert!(stripes > 0);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquire the stripe lock for a key. Two different keys may share a
    /// stripe; that only costs parallelism, never correctness.
    pub fn acquire(&self, key: &str) -> MutexGuard<'_, ()> {
        let idx = (fnv1a(key.as_bytes()) as usize) % self.stripes.len();
        self.stripes[idx].lock()
    }
}

/// FNV-1a, 64-bit. Stable across platforms, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_stripe() {
        let locks = KeyedLocks::new(16);
        {
            let _a = locks.acquire("doc-1");
            // A second acquire of the same key from this thread would
            // deadlock; acquiring a key on another stripe must not.
            let other = (0..64)
                .map(|i| format!("k{}", i))
                .find(|k| {
                    (fnv1a(k.as_bytes()) as usize) % 16
                        != (fnv1a("doc-1".as_bytes()) as usize) % 16
                })
                .unwrap();
            let _b = locks.acquire(&other);
        }
        let _again = locks.acquire("doc-1");
    }

    #[test]
    fn test_fnv_is_stable() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), fnv1a(b"a"));
        assert_ne!(fnv1a(b"a"), fnv1a(b"b"));
    }
}
