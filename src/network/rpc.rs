//! RPC Binding
//!
//! Call-and-return over WebSocket text frames carrying JSON. A client sends
//! `Call` frames; the server answers each with a `Return` carrying the reply
//! or the rejection, and interleaves `Push` frames for session events. Calls
//! on one connection are executed in arrival order.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::client::{ClientAction, ClientConfig, ClientError, Link, SharedListener};
use super::dispatch::{ConnectionContext, Dispatcher};
use super::listener::{ConnectionId, PushHandle, TransportKind};
use super::liveness::spawn_heartbeat;
use super::protocol::{ClientRequest, ErrorCode, Rejection, Reply, ServerEvent};

type PendingCalls = Arc<Mutex<BTreeMap<u64, oneshot::Sender<Result<Reply, Rejection>>>>>;

/// One WebSocket text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcFrame {
    /// Client → server: invoke a request.
    Call { id: u64, request: ClientRequest },
    /// Server → client: outcome of the call with the same id.
    Return { id: u64, outcome: Result<Reply, Rejection> },
    /// Server → client: session event.
    Push { event: ServerEvent },
}

impl RpcFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Drive one accepted RPC connection until it closes.
pub async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    outbound_queue: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(outbound_queue);
    let (return_tx, mut return_rx) = mpsc::channel::<RpcFrame>(outbound_queue);

    let mut ctx = ConnectionContext::new(PushHandle::new(ConnectionId::new(), TransportKind::Rpc, event_tx));
    info!(connection = %ctx.id, %addr, "rpc connection");

    // Single writer: returns and pushes share one ordered socket.
    let mut writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = return_rx.recv() => frame,
                Some(event) = event_rx.recv() => RpcFrame::Push { event },
                else => break,
            };
            let text = match frame.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let (id, request) = match RpcFrame::from_json(&text) {
                            Ok(RpcFrame::Call { id, request }) => (id, request),
                            Ok(_) | Err(_) => {
                                debug!(connection = %ctx.id, "malformed frame");
                                let _ = ctx.handle.push(ServerEvent::InvalidAction(Rejection::new(
                                    ErrorCode::InvalidInput,
                                    "Invalid message format",
                                )));
                                continue;
                            }
                        };

                        let outcome = dispatcher.handle(&mut ctx, request).await;
                        if return_tx.send(RpcFrame::Return { id, outcome }).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %ctx.id, "client closed");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(connection = %ctx.id, "WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown_rx.recv() => {
                if ctx.binding.is_none() {
                    let _ = ctx.handle.push(ServerEvent::Shutdown { reason: "server shutting down".into() });
                }
                break;
            }
        }
    }

    dispatcher.connection_lost(&mut ctx).await;
    let connection = ctx.id;
    drop(ctx);
    drop(return_tx);

    if timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    info!(%connection, "rpc connection closed");
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Client speaking the RPC binding. Every call blocks until the server has
/// executed it.
pub struct RpcClient {
    outbound: mpsc::Sender<RpcFrame>,
    pending: PendingCalls,
    next_id: AtomicU64,
    link: Arc<Link>,
    call_timeout: Duration,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    /// Connect to `addr`, applying pushed events to `listener`.
    pub async fn connect(addr: SocketAddr, listener: SharedListener, config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let (ws_stream, _) = connect_async(format!("ws://{addr}"))
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let link = Link::new(listener);
        let pending: PendingCalls = Arc::new(Mutex::new(BTreeMap::new()));
        let (outbound, mut outbound_rx) = mpsc::channel::<RpcFrame>(config.outbound_queue);

        let writer_link = link.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to serialize call: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    writer_link.mark_lost();
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_link = link.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => match RpcFrame::from_json(&text) {
                        Ok(RpcFrame::Return { id, outcome }) => {
                            if let Some(tx) = reader_pending.lock().await.remove(&id) {
                                let _ = tx.send(outcome);
                            }
                        }
                        Ok(RpcFrame::Push { event }) => reader_link.deliver(&event),
                        Ok(RpcFrame::Call { .. }) => debug!("ignoring call frame from server"),
                        Err(e) => warn!("Undecodable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            // outstanding callers see their sender dropped
            reader_pending.lock().await.clear();
            reader_link.mark_lost();
        });

        let client = Arc::new(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            link: link.clone(),
            call_timeout: config.call_timeout,
            tasks: StdMutex::new(vec![writer, reader]),
        });

        if let Some(period) = config.heartbeat_interval {
            let as_action: Arc<dyn ClientAction> = client.clone();
            let weak: Weak<dyn ClientAction> = Arc::downgrade(&as_action);
            let heartbeat = spawn_heartbeat(weak, link, period);
            if let Ok(mut tasks) = client.tasks.lock() {
                tasks.push(heartbeat);
            }
        }

        Ok(client)
    }
}

#[async_trait]
impl ClientAction for RpcClient {
    async fn submit(&self, request: ClientRequest) -> Result<Reply, ClientError> {
        if self.link.is_lost() {
            return Err(ClientError::ConnectionLost);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(RpcFrame::Call { id, request }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::ConnectionLost);
        }

        match timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(rejection))) => {
                self.link.reject(&rejection);
                Err(ClientError::Rejected(rejection))
            }
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Rpc
    }

    fn is_connected(&self) -> bool {
        !self.link.is_lost()
    }

    fn close(&self) {
        self.link.close();
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.abort();
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// TESTS
// =============================================================================
