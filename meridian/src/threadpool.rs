//! Named executors with bounded queues.
//!
//! Each pool caps how many of its tasks run concurrently and how many may
//! wait; a submission beyond cap + queue fails synchronously with a
//! rejection, and the caller decides whether to retry. Tasks run on the
//! shared tokio runtime; the cap is enforced with a semaphore, so a slow
//! pool cannot starve the others.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Index,
    Search,
    Bulk,
    Get,
    Refresh,
    Flush,
    Snapshot,
    Management,
    Generic,
}

impl PoolKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Index => "index",
            PoolKind::Search => "search",
            PoolKind::Bulk => "bulk",
            PoolKind::Get => "get",
            PoolKind::Refresh => "refresh",
            PoolKind::Flush => "flush",
            PoolKind::Snapshot => "snapshot",
            PoolKind::Management => "management",
            PoolKind::Generic => "generic",
        }
    }

    const ALL: [PoolKind; 9] = [
        PoolKind::Index,
        PoolKind::Search,
        PoolKind::Bulk,
        PoolKind::Get,
        PoolKind::Refresh,
        PoolKind::Flush,
        PoolKind::Snapshot,
        PoolKind::Management,
        PoolKind::Generic,
    ];
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub size: usize,
    pub queue: usize,
}

impl PoolConfig {
    /// Sizing per pool for a node with `cpus` cores.
    fn for_kind(kind: PoolKind, cpus: usize) -> PoolConfig {
        match kind {
            PoolKind::Index => PoolConfig {
                size: cpus,
                queue: 200,
            },
            PoolKind::Search => PoolConfig {
                size: (3 * cpus + 1) / 2,
                queue: 1000,
            },
            PoolKind::Bulk => PoolConfig {
                size: cpus,
                queue: 50,
            },
            PoolKind::Get => PoolConfig {
                size: cpus,
                queue: 1000,
            },
            PoolKind::Refresh => PoolConfig {
                size: (cpus / 2).max(1).min(10),
                queue: 100,
            },
            PoolKind::Flush => PoolConfig {
                size: (cpus / 2).max(1).min(5),
                queue: 100,
            },
            PoolKind::Snapshot => PoolConfig {
                size: (cpus / 2).max(1).min(5),
                queue: 100,
            },
            // Scaling pools get generous caps; the queue still bounds them.
            PoolKind::Management => PoolConfig {
                size: 5,
                queue: 500,
            },
            PoolKind::Generic => PoolConfig {
                size: cpus.max(4),
                queue: 1000,
            },
        }
    }
}

struct Pool {
    kind: PoolKind,
    permits: Arc<Semaphore>,
    /// Running + queued submissions.
    in_flight: AtomicUsize,
    capacity: usize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

/// The node's named executors.
pub struct ThreadPools {
    pools: Vec<Pool>,
}

impl ThreadPools {
    pub fn new() -> Arc<ThreadPools> {
        Self::with_cpus(std::thread::available_parallelism().map_or(4, |n| n.get()))
    }

    pub fn with_cpus(cpus: usize) -> Arc<ThreadPools> {
        let pools = PoolKind::ALL
            .iter()
            .map(|&kind| {
                let config = PoolConfig::for_kind(kind, cpus);
                Pool {
                    kind,
                    permits: Arc::new(Semaphore::new(config.size)),
                    in_flight: AtomicUsize::new(0),
                    capacity: config.size + config.queue,
                    completed: AtomicU64::new(0),
                    rejected: AtomicU64::new(0),
                }
            })
            .collect();
        Arc::new(ThreadPools { pools })
    }

    /// Submit a future to a pool. Fails synchronously with
    /// `RejectedExecution` when the pool's queue is full.
    pub fn execute<F, T>(self: &Arc<Self>, kind: PoolKind, fut: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool(kind);
        let mut in_flight = pool.in_flight.load(Ordering::SeqCst);
        loop {
            if in_flight >= pool.capacity {
                pool.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(Error::RejectedExecution { pool: kind.name() });
            }
            match pool.in_flight.compare_exchange(
                in_flight,
                in_flight + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => in_flight = actual,
            }
        }

        let permits = Arc::clone(&pool.permits);
        let pools = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _permit = permits
                .acquire()
                .await
                .expect("pool semaphore is never closed");
            let result = fut.await;
            let pool = pools.pool(kind);
            pool.in_flight.fetch_sub(1, Ordering::SeqCst);
            pool.completed.fetch_add(1, Ordering::Relaxed);
            result
        }))
    }

    /// Run blocking work on a pool: counted against the pool's cap, executed
    /// on the blocking-thread runtime so it cannot stall the scheduler.
    pub fn execute_blocking<F, T>(self: &Arc<Self>, kind: PoolKind, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.execute(kind, async move {
            tokio::task::spawn_blocking(f)
                .await
                .expect("blocking task does not panic")
        })
    }

    pub fn in_flight(&self, kind: PoolKind) -> usize {
        self.pool(kind).in_flight.load(Ordering::SeqCst)
    }

    pub fn rejected(&self, kind: PoolKind) -> u64 {
        self.pool(kind).rejected.load(Ordering::Relaxed)
    }

    pub fn completed(&self, kind: PoolKind) -> u64 {
        self.pool(kind).completed.load(Ordering::Relaxed)
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        self.pools
            .iter()
            .find(|p| p.kind == kind)
            .expect("all pool kinds are registered")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_runs_to_completion() {
        let pools = ThreadPools::with_cpus(2);
        let handle = pools.execute(PoolKind::Generic, async { 21 * 2 }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(pools.completed(PoolKind::Generic), 1);
    }

    #[tokio::test]
    async fn test_rejection_when_saturated() {
        let pools = ThreadPools::with_cpus(1);
        let pool = pools.pool(PoolKind::Flush);
        let capacity = pool.capacity;

        // Saturate the flush pool with tasks that wait on a oneshot.
        let (tx, rx) = tokio::sync::broadcast::channel::<()>(1);
        let mut handles = Vec::new();
        for _ in 0..capacity {
            let mut rx = tx.subscribe();
            handles.push(
                pools
                    .execute(PoolKind::Flush, async move {
                        let _ = rx.recv().await;
                    })
                    .unwrap(),
            );
        }
        drop(rx);

        let err = pools
            .execute(PoolKind::Flush, async {})
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RejectedExecution { pool: "flush" }
        ));
        assert_eq!(pools.rejected(PoolKind::Flush), 1);

        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        // Capacity is available again.
        pools.execute(PoolKind::Flush, async {}).unwrap();
    }

    #[tokio::test]
    async fn test_cap_limits_concurrency() {
        let pools = ThreadPools::with_cpus(1);
        // Flush pool size is 1 for a single-cpu node: the second task can
        // only start after the first finishes.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<u32>();

        let tx1 = tx.clone();
        pools
            .execute(PoolKind::Flush, async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tx1.send(1).unwrap();
            })
            .unwrap();
        let tx2 = tx.clone();
        let second = pools
            .execute(PoolKind::Flush, async move {
                tx2.send(2).unwrap();
            })
            .unwrap();
        second.await.unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_execute_blocking() {
        let pools = ThreadPools::with_cpus(2);
        let handle = pools
            .execute_blocking(PoolKind::Snapshot, || "done".to_string())
            .unwrap();
        assert_eq!(handle.await.unwrap(), "done");
    }
}
