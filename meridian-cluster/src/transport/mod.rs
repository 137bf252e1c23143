//! Connection-oriented, framed request/response messaging between nodes.
//!
//! Requests are matched to responses by id; a response arriving after its
//! deadline finds no waiter and is dropped. The layer never retries — a
//! transport error is delivered to the caller's handler, which decides.
//!
//! Two implementations share the trait and the handler registry: the real
//! TCP transport, and an in-process loopback used by multi-node tests.

pub mod frames;
pub mod local;
pub mod tcp;

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use frames::{decode_payload, encode_payload};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub const HANDSHAKE_ACTION: &str = "internal:transport/handshake";

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;
pub type RequestHandler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Action-name → handler table, shared by every transport implementation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RequestHandler>>,
}

impl HandlerRegistry {
    pub fn register(&self, action: &str, handler: RequestHandler) {
        self.handlers.write().insert(action.to_string(), handler);
    }

    /// Dispatch a request payload. An unknown action is a validation error
    /// and executes nothing.
    pub fn dispatch(&self, action: &str, payload: Vec<u8>) -> HandlerFuture {
        let handler = self.handlers.read().get(action).cloned();
        match handler {
            Some(handler) => handler(payload),
            None => {
                let action = action.to_string();
                Box::pin(async move {
                    Err(ClusterError::Validation(format!(
                        "unknown action [{}]",
                        action
                    )))
                })
            }
        }
    }

    pub fn registered_actions(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The address peers can reach this node at.
    fn local_address(&self) -> String;

    fn register_handler(&self, action: &str, handler: RequestHandler);

    /// Send a request and await the matched response within `timeout`.
    async fn send_request(
        &self,
        address: &str,
        action: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>>;
}

/// Typed request/response on top of the byte-level transport.
pub async fn send_typed<Req, Resp>(
    transport: &dyn Transport,
    address: &str,
    action: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    let payload = encode_payload(request)?;
    let response = transport
        .send_request(address, action, payload, timeout)
        .await?;
    decode_payload(&response)
}

/// Wrap a typed async function as a byte-level request handler.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> RequestHandler
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |payload: Vec<u8>| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let request: Req = decode_payload(&payload)?;
            let response = f(request).await?;
            encode_payload(&response)
        }) as HandlerFuture
    })
}

/// Handshake exchanged when a connection opens; both sides refuse peers they
/// cannot speak a common protocol version with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_id: String,
    pub protocol_version: u32,
    pub min_compatible_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_id: String,
    pub protocol_version: u32,
    pub min_compatible_version: u32,
}

/// Negotiate the common version with a peer, or refuse.
pub fn negotiate_version(
    remote_version: u32,
    remote_min_compatible: u32,
) -> Result<u32> {
    let negotiated = frames::PROTOCOL_VERSION.min(remote_version);
    if negotiated < frames::MIN_COMPATIBLE_VERSION || negotiated < remote_min_compatible {
        return Err(ClusterError::IncompatibleVersion(format!(
            "local [{} >= {}], remote [{} >= {}]",
            frames::PROTOCOL_VERSION,
            frames::MIN_COMPATIBLE_VERSION,
            remote_version,
            remote_min_compatible
        )));
    }
    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_action_is_validation_error() {
        let registry = HandlerRegistry::default();
        let err = registry.dispatch("no/such/action", vec![]).await.unwrap_err();
        assert_eq!(err.error_type(), "validation");
    }

    #[tokio::test]
    async fn test_typed_handler_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Echo {
            text: String,
        }
        let registry = HandlerRegistry::default();
        registry.register(
            "echo",
            typed_handler(|request: Echo| async move {
                Ok(Echo {
                    text: format!("{}!", request.text),
                })
            }),
        );
        let payload = encode_payload(&Echo { text: "hi".into() }).unwrap();
        let response = registry.dispatch("echo", payload).await.unwrap();
        let echoed: Echo = decode_payload(&response).unwrap();
        assert_eq!(echoed.text, "hi!");
    }

    #[test]
    fn test_version_negotiation() {
        // Peer speaks the same version.
        assert_eq!(
            negotiate_version(frames::PROTOCOL_VERSION, frames::MIN_COMPATIBLE_VERSION).unwrap(),
            frames::PROTOCOL_VERSION
        );
        // Peer is older but still compatible.
        assert_eq!(
            negotiate_version(frames::MIN_COMPATIBLE_VERSION, 0).unwrap(),
            frames::MIN_COMPATIBLE_VERSION
        );
        // Peer requires something newer than we speak.
        assert!(negotiate_version(
            frames::PROTOCOL_VERSION + 5,
            frames::PROTOCOL_VERSION + 5
        )
        .is_err());
        // Peer is older than our floor.
        assert!(negotiate_version(0, 0).is_err());
    }
}
