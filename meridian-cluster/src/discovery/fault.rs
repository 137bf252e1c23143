//! Fault detection: the master pings its followers, every follower pings
//! the master. Three consecutive missed pings declare the peer failed and
//! trigger a node-removal update (on the master) or a re-election (on a
//! follower).

use crate::error::Result;
use crate::state::service::ClusterService;
use crate::transport::{send_typed, Transport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const FAULT_PING_ACTION: &str = "internal:fault/ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultPing {
    pub from_node_id: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultPingAck {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultDetectionConfig {
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Consecutive misses before a peer is declared failed.
    pub failure_threshold: u32,
}

impl Default for FaultDetectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            ping_timeout_ms: 1000,
            failure_threshold: 3,
        }
    }
}

/// Something fault detection decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEvent {
    /// A follower stopped answering the master.
    NodeFailed { node_id: String },
    /// The master stopped answering this follower.
    MasterFailed { node_id: String },
}

/// Consecutive-miss bookkeeping, shared by both directions.
pub struct PingRecorder {
    threshold: u32,
    misses: Mutex<HashMap<String, u32>>,
}

impl PingRecorder {
    pub fn new(threshold: u32) -> PingRecorder {
        PingRecorder {
            threshold,
            misses: Mutex::new(HashMap::new()),
        }
    }

    pub fn success(&self, node_id: &str) {
        self.misses.lock().remove(node_id);
    }

    /// Record a miss; true once the threshold is reached.
    pub fn failure(&self, node_id: &str) -> bool {
        let mut misses = self.misses.lock();
        let count = misses.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            misses.remove(node_id);
            true
        } else {
            false
        }
    }

    pub fn forget(&self, node_id: &str) {
        self.misses.lock().remove(node_id);
    }
}

/// Both fault-detection directions in one service; which loop acts on a
/// given tick depends on whether this node is currently master.
pub struct FaultDetection {
    config: FaultDetectionConfig,
    cluster: Arc<ClusterService>,
    transport: Arc<dyn Transport>,
    recorder: PingRecorder,
    events: mpsc::UnboundedSender<FaultEvent>,
    running: AtomicBool,
    /// Master id this follower is currently watching.
    watched_master: RwLock<Option<String>>,
}

impl FaultDetection {
    pub fn new(
        config: FaultDetectionConfig,
        cluster: Arc<ClusterService>,
        transport: Arc<dyn Transport>,
    ) -> (Arc<FaultDetection>, mpsc::UnboundedReceiver<FaultEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let recorder = PingRecorder::new(config.failure_threshold);
        let detection = Arc::new(FaultDetection {
            config,
            cluster,
            transport,
            recorder,
            events,
            running: AtomicBool::new(false),
            watched_master: RwLock::new(None),
        });
        (detection, events_rx)
    }

    /// Register the ping handler; every node answers fault pings.
    pub fn register_handler(transport: &dyn Transport, local_node_id: String) {
        transport.register_handler(
            FAULT_PING_ACTION,
            crate::transport::typed_handler(move |_ping: FaultPing| {
                let node_id = local_node_id.clone();
                async move { Ok(FaultPingAck { node_id }) }
            }),
        );
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let detection = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(detection.config.ping_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while detection.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                detection.tick().await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn tick(&self) {
        let state = self.cluster.state();
        let local_id = self.cluster.local_node_id().to_string();
        let master_id = state.master_node_id().map(|s| s.to_string());

        match master_id {
            Some(master) if master == local_id => {
                // Master direction: ping every other node.
                *self.watched_master.write() = None;
                let targets: Vec<(String, String)> = state
                    .nodes
                    .nodes
                    .values()
                    .filter(|n| n.id != local_id)
                    .map(|n| (n.id.clone(), n.address.clone()))
                    .collect();
                for (node_id, address) in targets {
                    self.ping(&state.cluster_name, &local_id, &node_id, &address, false)
                        .await;
                }
            }
            Some(master) => {
                // Follower direction: ping the master only.
                {
                    let mut watched = self.watched_master.write();
                    if watched.as_deref() != Some(master.as_str()) {
                        // New master: stale miss counts do not carry over.
                        if let Some(old) = watched.take() {
                            self.recorder.forget(&old);
                        }
                        *watched = Some(master.clone());
                    }
                }
                if let Some(node) = state.nodes.get(&master) {
                    let address = node.address.clone();
                    self.ping(&state.cluster_name, &local_id, &master, &address, true)
                        .await;
                }
            }
            None => {}
        }
    }

    async fn ping(
        &self,
        cluster_name: &str,
        local_id: &str,
        node_id: &str,
        address: &str,
        is_master: bool,
    ) {
        let result: Result<FaultPingAck> = send_typed(
            self.transport.as_ref(),
            address,
            FAULT_PING_ACTION,
            &FaultPing {
                from_node_id: local_id.to_string(),
                cluster_name: cluster_name.to_string(),
            },
            Duration::from_millis(self.config.ping_timeout_ms),
        )
        .await;

        match result {
            Ok(ack) if ack.node_id == node_id => {
                self.recorder.success(node_id);
            }
            Ok(ack) => {
                // A different node answered on that address: the one we
                // knew is gone.
                debug!(expected = node_id, got = %ack.node_id, "fault ping answered by wrong node");
                self.fail(node_id, is_master);
            }
            Err(err) => {
                debug!(node = node_id, error = %err, "fault ping missed");
                if self.recorder.failure(node_id) {
                    self.declare_failed(node_id, is_master);
                }
            }
        }
    }

    fn fail(&self, node_id: &str, is_master: bool) {
        if self.recorder.failure(node_id) {
            self.declare_failed(node_id, is_master);
        }
    }

    fn declare_failed(&self, node_id: &str, is_master: bool) {
        let event = if is_master {
            warn!(master = node_id, "master failed fault detection");
            FaultEvent::MasterFailed {
                node_id: node_id.to_string(),
            }
        } else {
            info!(node = node_id, "node failed fault detection");
            FaultEvent::NodeFailed {
                node_id: node_id.to_string(),
            }
        };
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_threshold() {
        let recorder = PingRecorder::new(3);
        assert!(!recorder.failure("n1"));
        assert!(!recorder.failure("n1"));
        assert!(recorder.failure("n1"), "third consecutive miss declares failure");
        // Counter reset after the declaration.
        assert!(!recorder.failure("n1"));
    }

    #[test]
    fn test_success_resets_counter() {
        let recorder = PingRecorder::new(3);
        recorder.failure("n1");
        recorder.failure("n1");
        recorder.success("n1");
        assert!(!recorder.failure("n1"));
        assert!(!recorder.failure("n1"));
        assert!(recorder.failure("n1"));
    }

    #[test]
    fn test_counters_are_per_node() {
        let recorder = PingRecorder::new(2);
        assert!(!recorder.failure("a"));
        assert!(!recorder.failure("b"));
        assert!(recorder.failure("a"));
        assert!(recorder.failure("b"));
    }
}
