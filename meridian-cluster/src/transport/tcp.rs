//! TCP transport: framed streams, one dialed connection per peer, request
//! multiplexing by id, protocol handshake on connect.

use crate::error::{ClusterError, Result};
use crate::transport::frames::{
    decode_error, Frame, FrameCodec, FrameKind, MIN_COMPATIBLE_VERSION, PROTOCOL_VERSION,
};
use crate::transport::{
    negotiate_version, HandlerRegistry, HandshakeRequest, HandshakeResponse, RequestHandler,
    Transport, HANDSHAKE_ACTION,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>>>>>>;

#[derive(Clone)]
struct Connection {
    tx: mpsc::UnboundedSender<Frame>,
    pending: Pending,
}

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub bind_addr: String,
    pub node_id: String,
    pub compress_threshold: usize,
}

pub struct TcpTransport {
    config: TcpTransportConfig,
    local_addr: Mutex<String>,
    handlers: Arc<HandlerRegistry>,
    connections: tokio::sync::Mutex<HashMap<String, Connection>>,
    next_request_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Arc<TcpTransport> {
        let transport = Arc::new(TcpTransport {
            local_addr: Mutex::new(config.bind_addr.clone()),
            config,
            handlers: Arc::new(HandlerRegistry::default()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        });
        // Answer handshakes like any other action.
        let node_id = transport.config.node_id.clone();
        transport.handlers.register(
            HANDSHAKE_ACTION,
            crate::transport::typed_handler(move |request: HandshakeRequest| {
                let node_id = node_id.clone();
                async move {
                    negotiate_version(request.protocol_version, request.min_compatible_version)?;
                    Ok(HandshakeResponse {
                        node_id,
                        protocol_version: PROTOCOL_VERSION,
                        min_compatible_version: MIN_COMPATIBLE_VERSION,
                    })
                }
            }),
        );
        transport
    }

    /// Bind and start accepting peer connections.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        *self.local_addr.lock() = listener.local_addr()?.to_string();
        debug!(addr = %self.local_addr.lock(), "transport listening");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "accepted connection");
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            transport.serve_connection(socket).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, socket: TcpStream) {
        let framed = Framed::new(
            socket,
            FrameCodec {
                compress_threshold: self.config.compress_threshold,
            },
        );
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(error = %err, "connection closed");
                    break;
                }
            };
            let FrameKind::Request { action } = frame.kind else {
                // Servers never send requests on an inbound socket, so any
                // response here has no waiter.
                continue;
            };
            let request_id = frame.request_id;
            let handlers = Arc::clone(&self.handlers);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = handlers.dispatch(&action, frame.payload.to_vec()).await;
                let response = match result {
                    Ok(payload) => Frame::response(request_id, payload),
                    Err(err) => Frame::error(request_id, &err),
                };
                let _ = tx.send(response);
            });
        }
    }

    /// Get the live connection to a peer, dialing and handshaking if needed.
    async fn connection(&self, address: &str) -> Result<Connection> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(address) {
            if !connection.tx.is_closed() {
                return Ok(connection.clone());
            }
            connections.remove(address);
        }

        let socket = TcpStream::connect(address)
            .await
            .map_err(|e| ClusterError::NodeUnavailable(format!("{}: {}", address, e)))?;
        let framed = Framed::new(
            socket,
            FrameCodec {
                compress_threshold: self.config.compress_threshold,
            },
        );
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let peer = address.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let waiter = reader_pending.lock().remove(&frame.request_id);
                match waiter {
                    Some(waiter) => {
                        let result = match frame.kind {
                            FrameKind::Error => Err(decode_error(&frame.payload)),
                            _ => Ok(frame.payload.to_vec()),
                        };
                        let _ = waiter.send(result);
                    }
                    None => {
                        // Response past its deadline: the waiter is gone.
                        debug!(request_id = frame.request_id, "dropping unmatched response");
                    }
                }
            }
            // Connection died: fail everything still in flight.
            let mut pending = reader_pending.lock();
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err(ClusterError::Transport(format!(
                    "connection to {} closed",
                    peer
                ))));
            }
        });

        let connection = Connection { tx, pending };

        // Handshake before the connection is handed to anyone.
        let response = self
            .request_on(&connection, HANDSHAKE_ACTION, crate::transport::frames::encode_payload(
                &HandshakeRequest {
                    node_id: self.config.node_id.clone(),
                    protocol_version: PROTOCOL_VERSION,
                    min_compatible_version: MIN_COMPATIBLE_VERSION,
                },
            )?, HANDSHAKE_TIMEOUT)
            .await?;
        let handshake: HandshakeResponse =
            crate::transport::frames::decode_payload(&response)?;
        negotiate_version(handshake.protocol_version, handshake.min_compatible_version)?;
        debug!(peer = %address, remote_node = %handshake.node_id, "handshake complete");

        connections.insert(address.to_string(), connection.clone());
        Ok(connection)
    }

    async fn request_on(
        &self,
        connection: &Connection,
        action: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();
        connection.pending.lock().insert(request_id, response_tx);

        if connection
            .tx
            .send(Frame::request(request_id, action, payload))
            .is_err()
        {
            connection.pending.lock().remove(&request_id);
            return Err(ClusterError::Transport("connection closed".to_string()));
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Transport(
                "connection dropped while waiting".to_string(),
            )),
            Err(_) => {
                // Deadline passed: drop the waiter so a late response is
                // discarded by the reader.
                connection.pending.lock().remove(&request_id);
                Err(ClusterError::Timeout(format!(
                    "[{}] did not answer within {:?}",
                    action, timeout
                )))
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_address(&self) -> String {
        self.local_addr.lock().clone()
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
        let connection = self.connection(address).await?;
        self.request_on(&connection, action, payload, timeout).await
    }
}
