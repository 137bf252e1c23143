//! Node discovery and master election.
//!
//! Each node pings the seed list (plus everything in its current state),
//! runs the election rule over the answers, and either becomes master,
//! joins the elected master, or enters the no-master state. Fault detection
//! feeds node-failed / master-failed events back in; a master that cannot
//! publish to a quorum steps down and rejoins as a candidate.

pub mod election;
pub mod fault;
pub mod publish;

use crate::error::{ClusterError, Result};
use crate::state::service::ClusterService;
use crate::state::{ClusterBlock, ClusterState, DiscoveryNode};
use crate::transport::{send_typed, Transport};
use election::{elect, ElectionOutcome, PingResponse};
use fault::{FaultDetection, FaultDetectionConfig, FaultEvent};
use publish::{PublicationConfig, PublicationService};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const PING_ACTION: &str = "internal:discovery/ping";
pub const JOIN_ACTION: &str = "internal:discovery/join";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub from: DiscoveryNode,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node: DiscoveryNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub master_node_id: String,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub cluster_name: String,
    pub seed_addresses: Vec<String>,
    /// Quorum of master-eligible nodes for elections and publication. Must
    /// be at least floor(N/2)+1 for the expected cluster size.
    pub minimum_master_nodes: usize,
    pub ping_timeout_ms: u64,
    pub join_timeout_ms: u64,
    /// Pause between election rounds while no master is known.
    pub election_interval_ms: u64,
    /// `true`: no-master blocks reads and writes; `false`: writes only.
    pub no_master_block_all: bool,
    pub publish_timeout_ms: u64,
    pub fault: FaultDetectionConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cluster_name: "meridian".to_string(),
            seed_addresses: Vec::new(),
            minimum_master_nodes: 1,
            ping_timeout_ms: 1000,
            join_timeout_ms: 10_000,
            election_interval_ms: 500,
            no_master_block_all: false,
            publish_timeout_ms: 10_000,
            fault: FaultDetectionConfig::default(),
        }
    }
}

/// Invoked on the master when membership changes so allocation reacts
/// (remove the node's shards, reroute).
pub type MembershipHandler =
    Arc<dyn Fn(&ClusterState, MembershipChange) -> Result<Option<ClusterState>> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum MembershipChange {
    Joined(DiscoveryNode),
    Left(String),
}

pub struct Discovery {
    config: DiscoveryConfig,
    local_node: DiscoveryNode,
    cluster: Arc<ClusterService>,
    transport: Arc<dyn Transport>,
    publication: Arc<PublicationService>,
    fault: Arc<FaultDetection>,
    fault_events: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<FaultEvent>>>,
    membership: MembershipHandler,
    running: AtomicBool,
}

impl Discovery {
    pub fn new(
        config: DiscoveryConfig,
        local_node: DiscoveryNode,
        cluster: Arc<ClusterService>,
        transport: Arc<dyn Transport>,
        membership: MembershipHandler,
    ) -> Arc<Discovery> {
        let publication = PublicationService::new(
            Arc::clone(&transport),
            local_node.id.clone(),
            PublicationConfig {
                publish_timeout_ms: config.publish_timeout_ms,
                minimum_master_nodes: config.minimum_master_nodes,
            },
        );
        let (fault, fault_events) =
            FaultDetection::new(config.fault.clone(), Arc::clone(&cluster), Arc::clone(&transport));
        Arc::new(Discovery {
            config,
            local_node,
            cluster,
            transport,
            publication,
            fault,
            fault_events: parking_lot::Mutex::new(Some(fault_events)),
            membership,
            running: AtomicBool::new(false),
        })
    }

    /// Register transport handlers and start the election and fault loops.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.register_handlers();
        self.apply_no_master_block();
        self.fault.start();

        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            discovery.election_loop().await;
        });

        // A committed state that names a master and includes us clears the
        // local no-master block (covers followers seeded into the state by
        // a takeover publication, who never send an explicit join).
        let cluster = Arc::clone(&self.cluster);
        let local_id = self.local_node.id.clone();
        let mut applied = self.cluster.subscribe();
        tokio::spawn(async move {
            loop {
                match applied.recv().await {
                    Ok(state) => {
                        if state.master_node_id().is_some() && state.nodes.contains(&local_id) {
                            cluster.set_no_master_block(None);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let discovery = Arc::clone(self);
        let mut events = discovery
            .fault_events
            .lock()
            .take()
            .expect("discovery started twice");
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                discovery.on_fault_event(event).await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.fault.stop();
    }

    fn register_handlers(&self) {
        // Ping: answer with who we are and who we follow.
        let cluster = Arc::clone(&self.cluster);
        let local_node = self.local_node.clone();
        let cluster_name = self.config.cluster_name.clone();
        self.transport.register_handler(
            PING_ACTION,
            crate::transport::typed_handler(move |request: PingRequest| {
                let cluster = Arc::clone(&cluster);
                let local_node = local_node.clone();
                let cluster_name = cluster_name.clone();
                async move {
                    if request.cluster_name != cluster_name {
                        return Err(ClusterError::Validation(format!(
                            "cluster name mismatch: [{}] vs [{}]",
                            request.cluster_name, cluster_name
                        )));
                    }
                    let state = cluster.state();
                    Ok(PingResponse {
                        node: local_node,
                        cluster_name,
                        master_node_id: state.nodes.master_node_id.clone(),
                        cluster_state_version: state.version,
                    })
                }
            }),
        );

        // Join: only the master accepts; adds the node and publishes.
        let cluster = Arc::clone(&self.cluster);
        let membership = Arc::clone(&self.membership);
        self.transport.register_handler(
            JOIN_ACTION,
            crate::transport::typed_handler(move |request: JoinRequest| {
                let cluster = Arc::clone(&cluster);
                let membership = Arc::clone(&membership);
                async move {
                    if !cluster.is_master() {
                        return Err(ClusterError::NotMaster(format!(
                            "this node is not the master, cannot accept join from [{}]",
                            request.node.id
                        )));
                    }
                    let joining = request.node.clone();
                    let master_id = cluster.local_node_id().to_string();
                    cluster
                        .update(
                            format!("node-join[{}]", joining.id),
                            Box::new(move |current| {
                                membership(current, MembershipChange::Joined(joining))
                            }),
                        )
                        .await?;
                    Ok(JoinResponse {
                        master_node_id: master_id,
                    })
                }
            }),
        );

        PublicationService::register_receiver(Arc::clone(&self.cluster), self.transport.as_ref());
        FaultDetection::register_handler(self.transport.as_ref(), self.local_node.id.clone());
    }

    async fn election_loop(self: &Arc<Self>) {
        let interval = Duration::from_millis(self.config.election_interval_ms);
        while self.running.load(Ordering::SeqCst) {
            let state = self.cluster.state();
            let have_master = state.master_node_id().is_some()
                && state.nodes.contains(&self.local_node.id)
                && !self.cluster.has_no_master_block();
            if have_master {
                tokio::time::sleep(interval).await;
                continue;
            }
            if let Err(err) = self.find_master().await {
                debug!(error = %err, "election round failed");
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One election round: ping, elect, then become or join the master.
    async fn find_master(self: &Arc<Self>) -> Result<()> {
        let responses = self.ping_peers().await;
        match elect(&responses, self.config.minimum_master_nodes) {
            ElectionOutcome::NoQuorum { found, required } => {
                debug!(found, required, "not enough master-eligible nodes");
                self.apply_no_master_block();
                Ok(())
            }
            ElectionOutcome::Elected(winner) if winner == self.local_node.id => {
                self.become_master(&responses).await
            }
            ElectionOutcome::Elected(winner) => {
                let address = responses
                    .iter()
                    .find(|r| r.node.id == winner)
                    .map(|r| r.node.address.clone())
                    .ok_or_else(|| {
                        ClusterError::MasterNotDiscovered(format!(
                            "elected [{}] but no address known",
                            winner
                        ))
                    })?;
                self.join_master(&winner, &address).await
            }
        }
    }

    /// Ping the seed list plus everyone in the current state.
    async fn ping_peers(&self) -> Vec<PingResponse> {
        let state = self.cluster.state();
        let mut addresses: BTreeSet<String> =
            self.config.seed_addresses.iter().cloned().collect();
        for node in state.nodes.nodes.values() {
            addresses.insert(node.address.clone());
        }
        addresses.remove(&self.local_node.address);

        let request = PingRequest {
            from: self.local_node.clone(),
            cluster_name: self.config.cluster_name.clone(),
        };
        let timeout = Duration::from_millis(self.config.ping_timeout_ms);
        let pings = addresses.iter().map(|address| {
            let request = request.clone();
            async move {
                let result: Result<PingResponse> = send_typed(
                    self.transport.as_ref(),
                    address,
                    PING_ACTION,
                    &request,
                    timeout,
                )
                .await;
                result.ok()
            }
        });
        let mut responses: Vec<PingResponse> = futures::future::join_all(pings)
            .await
            .into_iter()
            .flatten()
            .collect();

        // The local node always participates in its own election.
        responses.push(PingResponse {
            node: self.local_node.clone(),
            cluster_name: self.config.cluster_name.clone(),
            master_node_id: state
                .master_node_id()
                .filter(|_| !self.cluster.has_no_master_block())
                .map(|s| s.to_string()),
            cluster_state_version: state.version,
        });
        responses
    }

    async fn become_master(self: &Arc<Self>, responses: &[PingResponse]) -> Result<()> {
        info!(node = %self.local_node.id, "elected as master");
        self.install_publisher();

        // Seed the member list with everyone who answered this round, so
        // the takeover publication can reach its quorum.
        let mut members: Vec<DiscoveryNode> =
            responses.iter().map(|r| r.node.clone()).collect();
        members.push(self.local_node.clone());

        let local_id = self.local_node.id.clone();
        let result = self
            .cluster
            .update(
                "become-master",
                Box::new(move |current| {
                    let mut nodes = current.nodes.clone();
                    for member in members {
                        nodes.nodes.insert(member.id.clone(), member);
                    }
                    nodes.master_node_id = Some(local_id);
                    let blocks = current
                        .blocks
                        .without_block(crate::state::NO_MASTER_BLOCK_ID);
                    Ok(Some(
                        current.builder().nodes(nodes).blocks(blocks).build(),
                    ))
                }),
            )
            .await;
        match result {
            Ok(_) => {
                self.cluster.set_no_master_block(None);
                Ok(())
            }
            Err(err) => {
                // Could not publish the takeover: step back down.
                warn!(error = %err, "failed to establish mastership");
                self.step_down();
                Err(err)
            }
        }
    }

    async fn join_master(&self, master_id: &str, address: &str) -> Result<()> {
        debug!(master = master_id, "joining master");
        let response: JoinResponse = send_typed(
            self.transport.as_ref(),
            address,
            JOIN_ACTION,
            &JoinRequest {
                node: self.local_node.clone(),
            },
            Duration::from_millis(self.config.join_timeout_ms),
        )
        .await?;

        // Wait until a published state shows us as a member.
        let local_id = self.local_node.id.clone();
        self.cluster
            .wait_for(
                Duration::from_millis(self.config.join_timeout_ms),
                move |state| {
                    state.nodes.contains(&local_id) && state.master_node_id().is_some()
                },
            )
            .await?;
        self.cluster.set_no_master_block(None);
        info!(master = %response.master_node_id, "joined cluster");
        Ok(())
    }

    async fn on_fault_event(self: &Arc<Self>, event: FaultEvent) {
        match event {
            FaultEvent::NodeFailed { node_id } => {
                if !self.cluster.is_master() {
                    return;
                }
                let membership = Arc::clone(&self.membership);
                let failed = node_id.clone();
                let result = self
                    .cluster
                    .update(
                        format!("node-left[{}]", node_id),
                        Box::new(move |current| {
                            membership(current, MembershipChange::Left(failed))
                        }),
                    )
                    .await;
                if let Err(err) = result {
                    // Likely lost quorum: abdicate and rejoin as candidate.
                    warn!(error = %err, "failed to publish node removal, stepping down");
                    self.step_down();
                }
            }
            FaultEvent::MasterFailed { node_id } => {
                warn!(master = %node_id, "master unreachable, triggering re-election");
                self.apply_no_master_block();
            }
        }
    }

    fn install_publisher(&self) {
        let publication = Arc::clone(&self.publication);
        self.cluster.set_publisher(Some(Arc::new(move |new, prev| {
            let publication = Arc::clone(&publication);
            Box::pin(async move { publication.publish(new, prev).await })
        })));
    }

    fn step_down(&self) {
        self.cluster.set_publisher(None);
        self.apply_no_master_block();
    }

    fn apply_no_master_block(&self) {
        let block = if self.config.no_master_block_all {
            ClusterBlock::no_master_all()
        } else {
            ClusterBlock::no_master_writes()
        };
        self.cluster.set_no_master_block(Some(block));
    }
}
