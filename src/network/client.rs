//! Client Side
//!
//! The capability set a presentation layer drives, independent of transport.
//! [`ClientAction`] is implemented by both the RPC and the stream client;
//! everything received from the server is applied to a shared
//! [`GameListener`], usually a [`ClientView`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::listener::TransportKind;
use super::protocol::{ClientRequest, GameListener, GameSnapshot, Rejection, Reply, ServerEvent};
use crate::game::codex::Position;
use crate::game::desk::DeckType;
use crate::game::state::{ChatMessage, SessionId};
use crate::HEARTBEAT_INTERVAL;

/// Listener shared between a client's reader and heartbeat tasks.
pub type SharedListener = Arc<Mutex<dyn GameListener>>;

// =============================================================================
// ERRORS & CONFIG
// =============================================================================

/// Client-side failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("cannot reach server: {0}")]
    ConnectFailed(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("call timed out")]
    Timeout,

    /// The server refused the request; state is unchanged.
    #[error("rejected: {0}")]
    Rejected(Rejection),
}

impl ClientError {
    /// Whether the link itself failed, as opposed to the request.
    pub fn is_transport(&self) -> bool {
        !matches!(self, ClientError::Rejected(_))
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// How long an RPC call may wait for its return.
    pub call_timeout: Duration,
    /// Outbound queue depth.
    pub outbound_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Some(HEARTBEAT_INTERVAL),
            call_timeout: Duration::from_secs(10),
            outbound_queue: 64,
        }
    }
}

// =============================================================================
// LINK
// =============================================================================

/// Delivery side of a client connection: applies events and reports the
/// loss of the link exactly once.
pub struct Link {
    listener: SharedListener,
    lost: AtomicBool,
}

impl Link {
    pub fn new(listener: SharedListener) -> Arc<Self> {
        Arc::new(Self {
            listener,
            lost: AtomicBool::new(false),
        })
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Apply one server event to the listener.
    pub fn deliver(&self, event: &ServerEvent) {
        match self.listener.lock() {
            Ok(mut listener) => event.apply(&mut *listener),
            Err(_) => warn!("listener poisoned, dropping event"),
        }
    }

    /// Surface a refused request to the listener.
    pub fn reject(&self, rejection: &Rejection) {
        if let Ok(mut listener) = self.listener.lock() {
            listener.invalid_action(rejection);
        }
    }

    /// Closed on purpose; the listener is not told.
    pub fn close(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Mark the link lost. Only the first call reaches the listener.
    pub fn mark_lost(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("link lost");
        if let Ok(mut listener) = self.listener.lock() {
            listener.no_connection();
        }
    }
}

// =============================================================================
// CAPABILITY SET
// =============================================================================

/// Every operation a client can issue. Implementors provide `submit`; the
/// rest are conveniences over it.
///
/// Over RPC a call resolves once the server has executed the request. Over
/// the stream binding it resolves as soon as the request is written and
/// yields [`Reply::Queued`]; the outcome arrives as events.
#[async_trait]
pub trait ClientAction: Send + Sync {
    /// Send one request.
    async fn submit(&self, request: ClientRequest) -> Result<Reply, ClientError>;

    /// The binding this client speaks.
    fn transport(&self) -> TransportKind;

    /// Whether the link is still believed alive.
    fn is_connected(&self) -> bool;

    /// Tear the connection down.
    fn close(&self);

    async fn create_game(&self, nickname: &str) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::CreateGame { nickname: nickname.to_string() }).await
    }

    async fn join_first_available(&self, nickname: &str) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::JoinFirstAvailable { nickname: nickname.to_string() })
            .await
    }

    async fn join_specific(&self, nickname: &str, session_id: SessionId) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::JoinSpecific {
            nickname: nickname.to_string(),
            session_id,
        })
        .await
    }

    async fn leave(&self) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::Leave).await
    }

    async fn reconnect(&self, nickname: &str) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::Reconnect { nickname: nickname.to_string() }).await
    }

    async fn place_starter(&self, face_up: bool) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::PlaceStarter { face_up }).await
    }

    async fn place_card(&self, hand_index: usize, face_up: bool, position: Position) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::PlaceCard { hand_index, face_up, position }).await
    }

    async fn select_objective(&self, index: usize) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::SelectObjective { index }).await
    }

    async fn draw_from_deck(&self, deck: DeckType) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::DrawFromDeck { deck }).await
    }

    async fn draw_displayed(&self, deck: DeckType, index: usize) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::DrawDisplayed { deck, index }).await
    }

    async fn send_chat(&self, text: &str) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::Chat { text: text.to_string() }).await
    }

    async fn set_size(&self, size: u8) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::SetSize { size }).await
    }

    /// Heartbeat.
    async fn ping(&self) -> Result<Reply, ClientError> {
        self.submit(ClientRequest::Ping).await
    }
}

// =============================================================================
// CLIENT VIEW
// =============================================================================

/// Read-only mirror of the session as last reported by the server.
#[derive(Debug, Default)]
pub struct ClientView {
    snapshot: Option<GameSnapshot>,
    /// Snapshots dropped because their hash did not match
    pub corrupt_snapshots: u32,
    pub rejections: Vec<Rejection>,
    pub chat: Vec<ChatMessage>,
    /// Human-readable notices, oldest first
    pub notices: Vec<String>,
    pub winners: Option<Vec<String>>,
    pub shutdown_reason: Option<String>,
    pub connection_lost: bool,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh view for sharing with a client.
    pub fn shared() -> Arc<Mutex<ClientView>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Latest verified snapshot.
    pub fn snapshot(&self) -> Option<&GameSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.revision).unwrap_or(0)
    }

    pub fn last_rejection(&self) -> Option<&Rejection> {
        self.rejections.last()
    }
}

impl GameListener for ClientView {
    fn snapshot(&mut self, snapshot: &GameSnapshot) {
        if !snapshot.verify() {
            warn!(revision = snapshot.revision, "snapshot hash mismatch");
            self.corrupt_snapshots += 1;
            return;
        }
        // pushes arrive in mutation order; an older revision is a replay
        if snapshot.revision < self.revision() {
            return;
        }
        self.snapshot = Some(snapshot.clone());
    }

    fn player_joined(&mut self, nickname: &str) {
        self.notices.push(format!("{nickname} joined"));
    }

    fn player_left(&mut self, nickname: &str) {
        self.notices.push(format!("{nickname} left"));
    }

    fn player_disconnected(&mut self, nickname: &str) {
        self.notices.push(format!("{nickname} disconnected"));
    }

    fn player_rejoined(&mut self, nickname: &str) {
        self.notices.push(format!("{nickname} rejoined"));
    }

    fn turn_advanced(&mut self, nickname: &str, round: u32) {
        self.notices.push(format!("round {round}: {nickname} to play"));
    }

    fn invalid_action(&mut self, rejection: &Rejection) {
        self.rejections.push(rejection.clone());
    }

    fn game_ended(&mut self, winners: &[String]) {
        self.winners = Some(winners.to_vec());
    }

    fn chat_message(&mut self, message: &ChatMessage) {
        self.chat.push(message.clone());
    }

    fn shutdown(&mut self, reason: &str) {
        self.shutdown_reason = Some(reason.to_string());
    }

    fn no_connection(&mut self) {
        self.connection_lost = true;
    }
}

// =============================================================================
// TESTS
// =============================================================================
