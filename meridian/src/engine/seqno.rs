//! Per-shard sequence numbers.
//!
//! The primary assigns a monotonically increasing sequence number to every
//! accepted operation. The local checkpoint is the highest sequence number
//! below which every operation has been durably applied; it is what a commit
//! point may safely claim.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

/// Sentinel for "no operations yet".
const NO_OPS: i64 = -1;

pub struct SequenceNumbers {
    /// Highest assigned sequence number (NO_OPS before the first).
    max_assigned: AtomicI64,
    inner: Mutex<CheckpointState>,
}

struct CheckpointState {
    checkpoint: i64,
    /// Completed sequence numbers above the checkpoint, waiting for the gap
    /// below them to fill.
    pending: BTreeSet<u64>,
}

impl SequenceNumbers {
    /// Start fresh, or resume after recovery with everything up to
    /// `applied_up_to` considered applied.
    pub fn new(applied_up_to: Option<u64>) -> Self {
        let base = applied_up_to.map(|s| s as i64).unwrap_or(NO_OPS);
        Self {
            max_assigned: AtomicI64::new(base),
            inner: Mutex::new(CheckpointState {
                checkpoint: base,
                pending: BTreeSet::new(),
            }),
        }
    }

    /// Assign the next sequence number (primary only).
    pub fn generate(&self) -> u64 {
        (self.max_assigned.fetch_add(1, Ordering::SeqCst) + 1) as u64
    }

    /// Mark an assigned sequence number as applied.
    pub fn mark_completed(&self, seq_no: u64) {
        let mut state = self.inner.lock();
        if (seq_no as i64) <= state.checkpoint {
            return;
        }
        state.pending.insert(seq_no);
        while state
            .pending
            .first()
            .is_some_and(|&next| next as i64 == state.checkpoint + 1)
        {
            let next = *state.pending.first().unwrap();
            state.pending.remove(&next);
            state.checkpoint = next as i64;
        }
    }

    /// Replica path: account for a sequence number assigned elsewhere, so a
    /// later promotion continues above it.
    pub fn advance_to(&self, seq_no: u64) {
        self.max_assigned
            .fetch_max(seq_no as i64, Ordering::SeqCst);
        self.mark_completed(seq_no);
    }

    /// Highest contiguous applied sequence number.
    pub fn local_checkpoint(&self) -> Option<u64> {
        let checkpoint = self.inner.lock().checkpoint;
        (checkpoint >= 0).then_some(checkpoint as u64)
    }

    /// Highest assigned sequence number.
    pub fn max_seq_no(&self) -> Option<u64> {
        let max = self.max_assigned.load(Ordering::SeqCst);
        (max >= 0).then_some(max as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tracker() {
        let seq = SequenceNumbers::new(None);
        assert_eq!(seq.max_seq_no(), None);
        assert_eq!(seq.local_checkpoint(), None);
        assert_eq!(seq.generate(), 0);
        assert_eq!(seq.generate(), 1);
        assert_eq!(seq.max_seq_no(), Some(1));
    }

    #[test]
    fn test_checkpoint_waits_for_gaps() {
        let seq = SequenceNumbers::new(None);
        let a = seq.generate();
        let b = seq.generate();
        let c = seq.generate();

        seq.mark_completed(c);
        assert_eq!(seq.local_checkpoint(), None, "0 and 1 still pending");
        seq.mark_completed(a);
        assert_eq!(seq.local_checkpoint(), Some(0));
        seq.mark_completed(b);
        assert_eq!(seq.local_checkpoint(), Some(2));
    }

    #[test]
    fn test_resume_after_recovery() {
        let seq = SequenceNumbers::new(Some(9));
        assert_eq!(seq.local_checkpoint(), Some(9));
        assert_eq!(seq.generate(), 10);
    }

    #[test]
    fn test_replica_advance_then_promote() {
        let seq = SequenceNumbers::new(None);
        seq.advance_to(0);
        seq.advance_to(1);
        seq.advance_to(2);
        assert_eq!(seq.local_checkpoint(), Some(2));
        // Promoted to primary: assignments continue above the replica max.
        assert_eq!(seq.generate(), 3);
    }
}
