//! In-process transport for multi-node tests.
//!
//! Nodes register their handler registries against a shared `LocalNetwork`;
//! requests dispatch directly to the target's handlers. Links can be cut and
//! nodes removed to simulate partitions and crashes, which is how the
//! election, replication and recovery scenarios are exercised without
//! sockets.

use crate::error::{ClusterError, Result};
use crate::transport::{HandlerRegistry, RequestHandler, Transport};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, Arc<HandlerRegistry>>>,
    /// Directed broken links (from, to).
    broken: RwLock<HashSet<(String, String)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<LocalNetwork> {
        Arc::new(LocalNetwork::default())
    }

    fn register(&self, address: &str, handlers: Arc<HandlerRegistry>) {
        self.nodes.write().insert(address.to_string(), handlers);
    }

    /// Simulate a node crash: requests to it fail from now on.
    pub fn remove_node(&self, address: &str) {
        self.nodes.write().remove(address);
    }

    /// Cut the link in both directions.
    pub fn disconnect(&self, a: &str, b: &str) {
        let mut broken = self.broken.write();
        broken.insert((a.to_string(), b.to_string()));
        broken.insert((b.to_string(), a.to_string()));
    }

    pub fn reconnect(&self, a: &str, b: &str) {
        let mut broken = self.broken.write();
        broken.remove(&(a.to_string(), b.to_string()));
        broken.remove(&(b.to_string(), a.to_string()));
    }

    fn lookup(&self, from: &str, to: &str) -> Result<Arc<HandlerRegistry>> {
        if self
            .broken
            .read()
            .contains(&(from.to_string(), to.to_string()))
        {
            return Err(ClusterError::Transport(format!(
                "link {} -> {} is down",
                from, to
            )));
        }
        self.nodes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| ClusterError::NodeUnavailable(to.to_string()))
    }
}

pub struct LocalTransport {
    address: String,
    network: Arc<LocalNetwork>,
    handlers: Arc<HandlerRegistry>,
}

impl LocalTransport {
    pub fn new(network: &Arc<LocalNetwork>, address: impl Into<String>) -> Arc<LocalTransport> {
        let address = address.into();
        let handlers = Arc::new(HandlerRegistry::default());
        network.register(&address, Arc::clone(&handlers));
        Arc::new(LocalTransport {
            address,
            network: Arc::clone(network),
            handlers,
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    fn register_handler(&self, action: &str, handler: RequestHandler) {
        self.handlers.register(action, handler);
    }

    async fn send_request(
        &self,
        address: &str,
        action: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let target = self.network.lookup(&self.address, address)?;
        let future = target.dispatch(action, payload);
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(format!(
                "[{}] to {} did not answer within {:?}",
                action, address, timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{send_typed, typed_handler};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping {
        from: String,
    }

    #[tokio::test]
    async fn test_local_roundtrip() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(&network, "a");
        let b = LocalTransport::new(&network, "b");
        b.register_handler(
            "ping",
            typed_handler(|request: Ping| async move {
                Ok(Ping {
                    from: format!("pong to {}", request.from),
                })
            }),
        );

        let response: Ping = send_typed(
            a.as_ref(),
            "b",
            "ping",
            &Ping { from: "a".into() },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(response.from, "pong to a");
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(&network, "a");
        let b = LocalTransport::new(&network, "b");
        b.register_handler("ping", typed_handler(|p: Ping| async move { Ok(p) }));

        network.disconnect("a", "b");
        let err = a
            .send_request("b", "ping", vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "transport");

        network.reconnect("a", "b");
        assert!(a
            .send_request(
                "b",
                "ping",
                crate::transport::frames::encode_payload(&Ping { from: "a".into() }).unwrap(),
                Duration::from_secs(1)
            )
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_removed_node_is_unavailable() {
        let network = LocalNetwork::new();
        let a = LocalTransport::new(&network, "a");
        let _b = LocalTransport::new(&network, "b");
        network.remove_node("b");
        let err = a
            .send_request("b", "ping", vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "node_unavailable");
    }
}
