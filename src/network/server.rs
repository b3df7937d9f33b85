//! Game Server
//!
//! Accepts connections on both bindings, hands each one to its binding's
//! connection driver, and runs the liveness watchdog. All connections share
//! one [`Dispatcher`] over one [`SessionRegistry`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::Dispatcher;
use super::listener::TransportKind;
use super::liveness::Watchdog;
use super::protocol::{ErrorCode, Rejection, ServerEvent};
use super::registry::SessionRegistry;
use super::rpc::{self, RpcFrame};
use super::stream;
use crate::game::rules::{RuleEvaluator, StandardRules};
use crate::HEARTBEAT_INTERVAL;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address of the RPC (WebSocket) binding.
    pub rpc_addr: SocketAddr,
    /// Bind address of the stream binding.
    pub stream_addr: SocketAddr,
    /// Maximum concurrent connections over both bindings.
    pub max_connections: usize,
    /// Interval clients are expected to ping at.
    pub heartbeat_interval: Duration,
    /// Silence after which a player counts as disconnected.
    pub heartbeat_timeout: Duration,
    /// How often the watchdog sweeps.
    pub watchdog_period: Duration,
    /// How long an ACTIVE session with nobody connected is kept.
    pub abandoned_grace: Duration,
    /// How long an ENDED session stays addressable.
    pub ended_linger: Duration,
    /// Per-connection outbound queue depth; a full queue is a disconnect.
    pub outbound_queue: usize,
    /// Fixed base seed for deck shuffles. Random per session when unset.
    pub seed: Option<u64>,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_addr: SocketAddr::from(([0, 0, 0, 0], 1099)),
            stream_addr: SocketAddr::from(([0, 0, 0, 0], 49160)),
            max_connections: 1000,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_INTERVAL * 3,
            watchdog_period: HEARTBEAT_INTERVAL / 2,
            abandoned_grace: Duration::from_secs(60),
            ended_linger: Duration::from_secs(30),
            outbound_queue: 256,
            seed: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

impl ServerConfig {
    /// A timeout must leave room for at least one missed ping.
    pub fn heartbeat_timeout_is_sane(&self) -> bool {
        self.heartbeat_timeout > self.heartbeat_interval
    }

    /// Defaults overridden by `CODEX_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str| env_parse::<u64>(key).map(Duration::from_millis);
        let secs = |key: &str| env_parse::<u64>(key).map(Duration::from_secs);

        let heartbeat_interval = millis("CODEX_HEARTBEAT_INTERVAL_MS").unwrap_or(defaults.heartbeat_interval);
        Self {
            rpc_addr: env_parse("CODEX_RPC_ADDR").unwrap_or(defaults.rpc_addr),
            stream_addr: env_parse("CODEX_STREAM_ADDR").unwrap_or(defaults.stream_addr),
            max_connections: env_parse("CODEX_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            heartbeat_interval,
            heartbeat_timeout: millis("CODEX_HEARTBEAT_TIMEOUT_MS").unwrap_or(heartbeat_interval * 3),
            watchdog_period: millis("CODEX_WATCHDOG_PERIOD_MS").unwrap_or(heartbeat_interval / 2),
            abandoned_grace: secs("CODEX_ABANDONED_GRACE_SECS").unwrap_or(defaults.abandoned_grace),
            ended_linger: secs("CODEX_ENDED_LINGER_SECS").unwrap_or(defaults.ended_linger),
            outbound_queue: env_parse("CODEX_OUTBOUND_QUEUE").unwrap_or(defaults.outbound_queue),
            seed: env_parse("CODEX_SEED"),
            version: defaults.version,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind a listener.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// Both bound listeners, ready to serve.
pub struct BoundListeners {
    rpc: TcpListener,
    stream: TcpListener,
}

impl BoundListeners {
    pub fn rpc_addr(&self) -> std::io::Result<SocketAddr> {
        self.rpc.local_addr()
    }

    pub fn stream_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

/// Releases its connection slot when the connection task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server using the standard placement rules.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_rules(config, Arc::new(StandardRules))
    }

    /// Create a server with a custom rule evaluator.
    pub fn with_rules(config: ServerConfig, rules: Arc<dyn RuleEvaluator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(SessionRegistry::new(rules, config.seed));

        Self {
            dispatcher: Arc::new(Dispatcher::new(registry.clone())),
            registry,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Bind both listeners.
    pub async fn bind(&self) -> Result<BoundListeners, GameServerError> {
        let rpc = TcpListener::bind(self.config.rpc_addr).await?;
        let stream = TcpListener::bind(self.config.stream_addr).await?;
        Ok(BoundListeners { rpc, stream })
    }

    /// Bind and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve already bound listeners until shutdown.
    #[instrument(skip(self, listeners))]
    pub async fn serve(&self, listeners: BoundListeners) -> Result<(), GameServerError> {
        info!(
            "Game server v{} listening: rpc on {}, stream on {}, heartbeat every {:?}",
            self.config.version,
            listeners.rpc_addr()?,
            listeners.stream_addr()?,
            self.config.heartbeat_interval
        );
        if !self.config.heartbeat_timeout_is_sane() {
            warn!(
                interval = ?self.config.heartbeat_interval,
                timeout = ?self.config.heartbeat_timeout,
                "heartbeat timeout does not exceed the interval; healthy clients will be dropped"
            );
        }

        let watchdog = Watchdog::new(
            self.registry.clone(),
            self.config.heartbeat_timeout,
            self.config.abandoned_grace,
            self.config.ended_linger,
        );
        let watchdog_handle = tokio::spawn(watchdog.run(self.config.watchdog_period, self.shutdown_tx.subscribe()));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listeners.rpc.accept() => match result {
                    Ok((socket, addr)) => self.handle_connection(socket, addr, TransportKind::Rpc),
                    Err(e) => error!("Accept error: {}", e),
                },
                result = listeners.stream.accept() => match result {
                    Ok((socket, addr)) => self.handle_connection(socket, addr, TransportKind::Stream),
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        if tokio::time::timeout(Duration::from_secs(1), watchdog_handle).await.is_err() {
            warn!("watchdog did not stop in time");
        }
        Ok(())
    }

    /// Hand a new socket to its binding.
    fn handle_connection(&self, socket: TcpStream, addr: SocketAddr, transport: TransportKind) {
        let previous = self.connections.fetch_add(1, Ordering::AcqRel);
        let slot = ConnectionSlot(self.connections.clone());

        if previous >= self.config.max_connections {
            warn!("Connection limit reached, rejecting {}", addr);
            tokio::spawn(async move {
                reject_overloaded(socket, transport).await;
                drop(slot);
            });
            return;
        }

        debug!(%addr, ?transport, "New connection");
        let dispatcher = self.dispatcher.clone();
        let queue = self.config.outbound_queue;
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            match transport {
                TransportKind::Rpc => rpc::serve_connection(socket, addr, dispatcher, queue, shutdown_rx).await,
                TransportKind::Stream => stream::serve_connection(socket, addr, dispatcher, queue, shutdown_rx).await,
            }
            drop(slot);
        });
    }

    /// Tell every attached player the server is going away, then stop.
    pub async fn shutdown(&self) {
        self.registry.announce_shutdown("server shutting down").await;
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Get live session count.
    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Tell an over-limit peer why it is being dropped.
async fn reject_overloaded(socket: TcpStream, transport: TransportKind) {
    let event = ServerEvent::InvalidAction(Rejection::new(ErrorCode::ServerOverloaded, "connection limit reached"));

    match transport {
        TransportKind::Stream => {
            let mut socket = socket;
            let _ = stream::write_message(&mut socket, &event).await;
        }
        TransportKind::Rpc => {
            let Ok(mut ws) = accept_async(socket).await else {
                return;
            };
            if let Ok(text) = (RpcFrame::Push { event }).to_json() {
                let _ = ws.send(Message::Text(text)).await;
            }
            let _ = ws.close(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            rpc_addr: "127.0.0.1:0".parse().unwrap(),
            stream_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.rpc_addr.port(), 1099);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(6));
        assert_eq!(config.watchdog_period, Duration::from_secs(1));
        assert!(config.heartbeat_timeout_is_sane());

        let tight = ServerConfig {
            heartbeat_timeout: config.heartbeat_interval,
            ..config
        };
        assert!(!tight.heartbeat_timeout_is_sane());
        assert_eq!(config.max_connections, 1000);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(local_config());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(GameServer::new(local_config()));
        let listeners = server.bind().await.unwrap();
        assert_ne!(listeners.rpc_addr().unwrap().port(), 0);

        let runner = server.clone();
        let task = tokio::spawn(async move { runner.serve(listeners).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown().await;
        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
