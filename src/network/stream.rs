//! Stream Binding
//!
//! Long-lived TCP connection carrying length-delimited bincode messages: a
//! 4-byte big-endian length, then the payload. Requests are fire-and-forget;
//! outcomes come back as events, rejections as `InvalidAction` to the
//! originating connection only.
//!
//! Each connection has one reader task and one writer task. The writer is the
//! only path to the socket, so messages never interleave, and every message
//! is flushed as it is written.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::client::{ClientAction, ClientConfig, ClientError, Link, SharedListener};
use super::dispatch::{ConnectionContext, Dispatcher};
use super::listener::{ConnectionId, PushHandle, TransportKind};
use super::liveness::spawn_heartbeat;
use super::protocol::{ClientRequest, ErrorCode, Rejection, Reply, ServerEvent};

/// Largest accepted message. Snapshots are the biggest payloads by far.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Stream codec failures.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("message too large: {0} bytes (max {MAX_FRAME_LEN})")]
    TooLarge(usize),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}

// =============================================================================
// FRAMING
// =============================================================================

/// Write one length-delimited frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    let len = payload.len();
    if len > MAX_FRAME_LEN as usize {
        return Err(FramingError::TooLarge(len));
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-delimited frame. `None` when the peer closed the stream
/// before a length prefix was complete.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, FramingError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FramingError::TooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Encode and write one message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(message)?;
    #[cfg(feature = "debug-tracing")]
    tracing::trace!(len = bytes.len(), "frame out");
    write_frame(writer, &bytes).await
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Drive one accepted stream connection until it closes.
pub async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    outbound_queue: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(outbound_queue);

    let mut ctx = ConnectionContext::new(PushHandle::new(ConnectionId::new(), TransportKind::Stream, event_tx));
    info!(connection = %ctx.id, %addr, "stream connection");

    let mut writer = tokio::spawn(async move {
        let mut sink = BufWriter::new(write_half);
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = write_message(&mut sink, &event).await {
                debug!("stream write failed: {}", e);
                break;
            }
        }
        let _ = sink.shutdown().await;
    });

    let mut source = BufReader::new(read_half);
    loop {
        tokio::select! {
            frame = read_frame(&mut source) => {
                let payload = match frame {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        debug!(connection = %ctx.id, "client closed");
                        break;
                    }
                    Err(e) => {
                        debug!(connection = %ctx.id, "stream read failed: {}", e);
                        break;
                    }
                };

                let outcome = match ClientRequest::from_bytes(&payload) {
                    Ok(request) => dispatcher.handle(&mut ctx, request).await,
                    Err(e) => Err(Rejection::new(ErrorCode::InvalidInput, format!("undecodable message: {e}"))),
                };
                if let Err(rejection) = outcome {
                    let _ = ctx.handle.push(ServerEvent::InvalidAction(rejection));
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

    if timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    info!(%connection, "stream connection closed");
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Client speaking the stream binding. Calls return [`Reply::Queued`] once
/// the request is handed to the writer.
pub struct StreamClient {
    outbound: mpsc::Sender<ClientRequest>,
    link: Arc<Link>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StreamClient {
    /// Connect to `addr`, applying received events to `listener`.
    pub async fn connect(addr: SocketAddr, listener: SharedListener, config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let link = Link::new(listener);
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientRequest>(config.outbound_queue);

        let writer_link = link.clone();
        let writer = tokio::spawn(async move {
            let mut sink = BufWriter::new(write_half);
            while let Some(request) = outbound_rx.recv().await {
                if let Err(e) = write_message(&mut sink, &request).await {
                    warn!("stream write failed: {}", e);
                    writer_link.mark_lost();
                    break;
                }
            }
            let _ = sink.shutdown().await;
        });

        let reader_link = link.clone();
        let reader = tokio::spawn(async move {
            let mut source = BufReader::new(read_half);
            loop {
                match read_frame(&mut source).await {
                    Ok(Some(payload)) => match ServerEvent::from_bytes(&payload) {
                        Ok(event) => reader_link.deliver(&event),
                        Err(e) => warn!("Undecodable event: {}", e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        debug!("stream read failed: {}", e);
                        break;
                    }
                }
            }
            reader_link.mark_lost();
        });

        let client = Arc::new(Self {
            outbound,
            link: link.clone(),
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
impl ClientAction for StreamClient {
    async fn submit(&self, request: ClientRequest) -> Result<Reply, ClientError> {
        if self.link.is_lost() {
            return Err(ClientError::ConnectionLost);
        }
        self.outbound
            .send(request)
            .await
            .map_err(|_| ClientError::ConnectionLost)?;
        Ok(Reply::Queued)
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Stream
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

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// TESTS
// =============================================================================
