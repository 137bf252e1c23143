//! The cluster-state service: snapshot access, the single-threaded update
//! executor, and the follower apply path.
//!
//! Update tasks execute strictly in submission order on one consumer task,
//! so the sequence of produced versions is deterministic. On the master a
//! new state goes through the publisher (two-phase publication) before it is
//! committed locally; followers only ever apply committed states, in
//! strictly increasing version order.

use crate::error::{ClusterError, Result};
use crate::state::{ClusterBlock, ClusterBlockLevel, ClusterState};
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// An update task: compute the next state from the current one, or `None`
/// for "no change".
pub type UpdateFn = Box<dyn FnOnce(&ClusterState) -> Result<Option<ClusterState>> + Send>;

/// Publishes (new, previous) to the cluster; resolves once the publication
/// is committed by a quorum.
pub type Publisher = Arc<
    dyn Fn(Arc<ClusterState>, Arc<ClusterState>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

struct UpdateTask {
    source: String,
    update: UpdateFn,
    ack: oneshot::Sender<Result<Arc<ClusterState>>>,
}

pub struct ClusterService {
    local_node_id: String,
    state: RwLock<Arc<ClusterState>>,
    tx: mpsc::UnboundedSender<UpdateTask>,
    rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<UpdateTask>>>,
    applied_tx: broadcast::Sender<Arc<ClusterState>>,
    publisher: RwLock<Option<Publisher>>,
    /// Local no-master overlay; not part of the published state.
    local_block: RwLock<Option<ClusterBlock>>,
}

impl ClusterService {
    pub fn new(cluster_name: &str, local_node_id: &str) -> Arc<ClusterService> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (applied_tx, _) = broadcast::channel(256);
        Arc::new(ClusterService {
            local_node_id: local_node_id.to_string(),
            state: RwLock::new(Arc::new(ClusterState::initial(cluster_name))),
            tx,
            rx: parking_lot::Mutex::new(Some(rx)),
            applied_tx,
            publisher: RwLock::new(None),
            local_block: RwLock::new(None),
        })
    }

    /// Start the single-threaded update executor.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .expect("cluster service started twice");
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                service.run_task(task).await;
            }
        })
    }

    /// Install the publication path (set while this node is master).
    pub fn set_publisher(&self, publisher: Option<Publisher>) {
        *self.publisher.write() = publisher;
    }

    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.state.read())
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn is_master(&self) -> bool {
        self.state.read().master_node_id() == Some(self.local_node_id.as_str())
    }

    /// Set or clear the local "no master" block overlay.
    pub fn set_no_master_block(&self, block: Option<ClusterBlock>) {
        *self.local_block.write() = block;
    }

    pub fn has_no_master_block(&self) -> bool {
        self.local_block.read().is_some()
    }

    /// Check a block level against the published blocks plus the local
    /// overlay.
    pub fn check_block(&self, level: ClusterBlockLevel) -> Result<()> {
        if let Some(block) = self.local_block.read().as_ref() {
            if block.levels.contains(&level) {
                return Err(ClusterError::ClusterBlock(format!(
                    "blocked by [{}/{}]",
                    block.id, block.description
                )));
            }
        }
        self.state.read().blocks.check(level)
    }

    /// Submit an update task and await the state it produced.
    pub async fn update(
        &self,
        source: impl Into<String>,
        update: UpdateFn,
    ) -> Result<Arc<ClusterState>> {
        let (ack, ack_rx) = oneshot::channel();
        let task = UpdateTask {
            source: source.into(),
            update,
            ack,
        };
        self.tx
            .send(task)
            .map_err(|_| ClusterError::Internal("cluster service stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| ClusterError::Internal("cluster service dropped task".to_string()))?
    }

    /// Follower path: apply a committed state from the master. Only
    /// strictly-newer versions from the current (or newly announced) master
    /// are accepted.
    pub fn apply_committed(&self, new_state: Arc<ClusterState>) -> Result<()> {
        let mut guard = self.state.write();
        let current = Arc::clone(&guard);
        if new_state.version <= current.version {
            return Err(ClusterError::Validation(format!(
                "rejecting state version [{}], already at [{}]",
                new_state.version, current.version
            )));
        }
        debug!(
            from = current.version,
            to = new_state.version,
            "applying committed cluster state"
        );
        *guard = Arc::clone(&new_state);
        drop(guard);
        let _ = self.applied_tx.send(new_state);
        Ok(())
    }

    /// Subscribe to applied states.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ClusterState>> {
        self.applied_tx.subscribe()
    }

    /// Wait until the applied state satisfies a predicate (checked against
    /// the current state first).
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&ClusterState) -> bool,
    ) -> Result<Arc<ClusterState>> {
        let mut rx = self.subscribe();
        let current = self.state();
        if predicate(&current) {
            return Ok(current);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = tokio::select! {
                received = rx.recv() => match received {
                    Ok(state) => state,
                    Err(broadcast::error::RecvError::Lagged(_)) => self.state(),
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClusterError::Internal("cluster service stopped".to_string()))
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ClusterError::Timeout(
                        "cluster state predicate not satisfied in time".to_string(),
                    ))
                }
            };
            if predicate(&state) {
                return Ok(state);
            }
        }
    }

    /// Wait for a state with version >= the given one.
    pub async fn wait_for_version(
        &self,
        version: u64,
        timeout: Duration,
    ) -> Result<Arc<ClusterState>> {
        self.wait_for(timeout, move |state| state.version >= version)
            .await
    }

    async fn run_task(self: &Arc<Self>, task: UpdateTask) {
        let current = self.state();
        let result = (task.update)(&current);
        let outcome = match result {
            Ok(None) => Ok(current),
            Ok(Some(new_state)) => {
                if new_state.version != current.version + 1 {
                    Err(ClusterError::Internal(format!(
                        "update [{}] produced version [{}], expected [{}]",
                        task.source,
                        new_state.version,
                        current.version + 1
                    )))
                } else {
                    let new_state = Arc::new(new_state);
                    self.publish_and_commit(&task.source, current, Arc::clone(&new_state))
                        .await
                        .map(|_| new_state)
                }
            }
            Err(err) => {
                warn!(source = %task.source, error = %err, "cluster state update failed");
                Err(err)
            }
        };
        let _ = task.ack.send(outcome);
    }

    async fn publish_and_commit(
        self: &Arc<Self>,
        source: &str,
        previous: Arc<ClusterState>,
        new_state: Arc<ClusterState>,
    ) -> Result<()> {
        let publisher = self.publisher.read().clone();
        if let Some(publisher) = publisher {
            if let Err(err) = publisher(Arc::clone(&new_state), previous).await {
                warn!(
                    source,
                    version = new_state.version,
                    error = %err,
                    "publication failed, discarding state"
                );
                return Err(err);
            }
        }
        info!(
            source,
            version = new_state.version,
            "cluster state updated"
        );
        *self.state.write() = Arc::clone(&new_state);
        let _ = self.applied_tx.send(new_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn service() -> Arc<ClusterService> {
        let service = ClusterService::new("test", "node-1");
        service.start();
        service
    }

    #[tokio::test]
    async fn test_updates_run_in_submission_order() {
        let service = service();
        let mut acks = Vec::new();
        for _ in 0..10 {
            let fut = service.update(
                "bump",
                Box::new(|current| Ok(Some(current.builder().build()))),
            );
            acks.push(fut);
        }
        let mut last = 0;
        for ack in acks {
            let state = ack.await.unwrap();
            assert!(state.version > last);
            last = state.version;
        }
        assert_eq!(service.state().version, 10);
    }

    #[tokio::test]
    async fn test_no_change_update_keeps_version() {
        let service = service();
        let state = service.update("noop", Box::new(|_| Ok(None))).await.unwrap();
        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_state_untouched() {
        let service = service();
        let err = service
            .update(
                "broken",
                Box::new(|_| Err(ClusterError::Validation("nope".to_string()))),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "validation");
        assert_eq!(service.state().version, 0);
    }

    #[tokio::test]
    async fn test_apply_committed_enforces_monotonic_versions() {
        let service = service();
        let v1 = Arc::new(service.state().builder().build());
        service.apply_committed(Arc::clone(&v1)).unwrap();
        assert_eq!(service.state().version, 1);

        // Re-applying the same version is rejected.
        assert!(service.apply_committed(v1).is_err());

        let v2 = Arc::new(service.state().builder().build());
        service.apply_committed(v2).unwrap();
        assert_eq!(service.state().version, 2);
    }

    #[tokio::test]
    async fn test_publication_failure_discards_state() {
        let service = service();
        let calls = Arc::new(AtomicU64::new(0));
        let calls_in = Arc::clone(&calls);
        service.set_publisher(Some(Arc::new(move |_new, _prev| {
            calls_in.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ClusterError::Timeout("no quorum ack".to_string())) })
        })));

        let err = service
            .update("bump", Box::new(|c| Ok(Some(c.builder().build()))))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "timeout");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.state().version, 0, "abandoned version never applies");
    }

    #[tokio::test]
    async fn test_wait_for_version() {
        let service = service();
        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .wait_for_version(1, Duration::from_secs(5))
                    .await
                    .unwrap()
                    .version
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        service
            .update("bump", Box::new(|c| Ok(Some(c.builder().build()))))
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_local_no_master_block_overlay() {
        let service = service();
        // The initial published state already blocks writes (no master).
        assert!(service.check_block(ClusterBlockLevel::Write).is_err());

        // Clear published blocks, then exercise the local overlay.
        let unblocked = service
            .update(
                "clear-blocks",
                Box::new(|current| {
                    Ok(Some(
                        current
                            .builder()
                            .blocks(crate::state::ClusterBlocks::default())
                            .build(),
                    ))
                }),
            )
            .await
            .unwrap();
        assert_eq!(unblocked.version, 1);
        assert!(service.check_block(ClusterBlockLevel::Write).is_ok());

        service.set_no_master_block(Some(ClusterBlock::no_master_all()));
        assert!(service.check_block(ClusterBlockLevel::Read).is_err());
        service.set_no_master_block(None);
        assert!(service.check_block(ClusterBlockLevel::Read).is_ok());
    }
}
