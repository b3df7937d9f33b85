//! Protocol Messages
//!
//! The capability contract shared by both transport bindings: the closed set
//! of client requests, the closed set of server-pushed events, and the typed
//! rejection every refused request turns into. JSON is used on the RPC
//! binding, bincode on the stream binding; all enums use serde's default
//! external tagging so they survive both encoders.

use serde::{Deserialize, Serialize};

use crate::core::hash::StateHash;
use crate::game::codex::Position;
use crate::game::desk::DeckType;
use crate::game::events::GameEvent;
use crate::game::rules::PlacementError;
use crate::game::state::{ChatMessage, GameModel, SessionId};
use crate::game::turn::ActionError;
use crate::PROTOCOL_VERSION;

// =============================================================================
// CLIENT -> SERVER REQUESTS
// =============================================================================

/// Requests a client sends to the server.
///
/// In-game requests carry no nickname: the connection's session binding
/// identifies the player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRequest {
    /// Create a new session and take its first seat.
    CreateGame { nickname: String },

    /// Join the first IDLE session with a free seat.
    JoinFirstAvailable { nickname: String },

    /// Join a session by id.
    JoinSpecific { nickname: String, session_id: SessionId },

    /// Leave the bound session.
    Leave,

    /// Reattach to the session holding a disconnected player of this name.
    Reconnect { nickname: String },

    /// Place the dealt starter card.
    PlaceStarter { face_up: bool },

    /// Place a card from the hand.
    PlaceCard {
        hand_index: usize,
        face_up: bool,
        position: Position,
    },

    /// Keep one of the dealt objective options.
    SelectObjective { index: usize },

    /// Draw the top card of a deck.
    DrawFromDeck { deck: DeckType },

    /// Take a displayed card.
    DrawDisplayed { deck: DeckType, index: usize },

    /// Public chat line.
    Chat { text: String },

    /// Choose the number of players (creator only).
    SetSize { size: u8 },

    /// Liveness heartbeat.
    Ping,
}

impl ClientRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::CreateGame { .. } => "create_game",
            ClientRequest::JoinFirstAvailable { .. } => "join_first_available",
            ClientRequest::JoinSpecific { .. } => "join_specific",
            ClientRequest::Leave => "leave",
            ClientRequest::Reconnect { .. } => "reconnect",
            ClientRequest::PlaceStarter { .. } => "place_starter",
            ClientRequest::PlaceCard { .. } => "place_card",
            ClientRequest::SelectObjective { .. } => "select_objective",
            ClientRequest::DrawFromDeck { .. } => "draw_from_deck",
            ClientRequest::DrawDisplayed { .. } => "draw_displayed",
            ClientRequest::Chat { .. } => "chat",
            ClientRequest::SetSize { .. } => "set_size",
            ClientRequest::Ping => "ping",
        }
    }
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// The connection is now bound to a session.
    Session { session_id: SessionId, nickname: String },
    /// Executed.
    Done,
    /// Handed to the stream writer; the outcome arrives as events.
    Queued,
}

// =============================================================================
// SERVER -> CLIENT EVENTS
// =============================================================================

/// Full session state after a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSnapshot {
    /// Protocol version of the server that took the snapshot.
    pub protocol_version: u16,
    /// Mutation counter of the session, strictly increasing.
    pub revision: u64,
    /// The authoritative model.
    pub model: GameModel,
    /// Hash of `model`.
    pub state_hash: StateHash,
}

impl GameSnapshot {
    /// Snapshot a model.
    pub fn capture(model: &GameModel, revision: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            revision,
            model: model.clone(),
            state_hash: model.compute_hash(),
        }
    }

    /// Whether the carried hash matches the carried model.
    pub fn verify(&self) -> bool {
        self.model.compute_hash() == self.state_hash
    }
}

/// Events the server pushes to attached clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session state changed.
    Snapshot(Box<GameSnapshot>),

    /// A player took a seat.
    PlayerJoined { nickname: String },

    /// A player left the session.
    PlayerLeft { nickname: String },

    /// A player's connection was lost.
    PlayerDisconnected { nickname: String },

    /// A disconnected player came back.
    PlayerRejoined { nickname: String },

    /// The named player now has the turn.
    TurnAdvanced { nickname: String, round: u32 },

    /// A request from this connection was refused.
    InvalidAction(Rejection),

    /// The session ended.
    GameEnded { winners: Vec<String> },

    /// Public chat line.
    ChatMessage(ChatMessage),

    /// The server is going away.
    Shutdown { reason: String },
}

impl From<GameEvent> for ServerEvent {
    fn from(event: GameEvent) -> Self {
        match event {
            GameEvent::PlayerJoined { nickname } => ServerEvent::PlayerJoined { nickname },
            GameEvent::PlayerLeft { nickname } => ServerEvent::PlayerLeft { nickname },
            GameEvent::PlayerDisconnected { nickname } => ServerEvent::PlayerDisconnected { nickname },
            GameEvent::PlayerRejoined { nickname } => ServerEvent::PlayerRejoined { nickname },
            GameEvent::TurnAdvanced { nickname, round } => ServerEvent::TurnAdvanced { nickname, round },
            GameEvent::ChatPosted(message) => ServerEvent::ChatMessage(message),
            GameEvent::GameEnded { winners } => ServerEvent::GameEnded { winners },
        }
    }
}

// =============================================================================
// CLIENT-SIDE HANDLER
// =============================================================================

/// What the presentation layer implements to follow a session.
///
/// Every received event is applied with [`ServerEvent::apply`], which calls
/// exactly one method. Adding an event means adding a variant and a method.
pub trait GameListener: Send {
    /// New authoritative state.
    fn snapshot(&mut self, snapshot: &GameSnapshot);

    fn player_joined(&mut self, _nickname: &str) {}

    fn player_left(&mut self, _nickname: &str) {}

    fn player_disconnected(&mut self, _nickname: &str) {}

    fn player_rejoined(&mut self, _nickname: &str) {}

    fn turn_advanced(&mut self, _nickname: &str, _round: u32) {}

    /// A request of ours was refused.
    fn invalid_action(&mut self, rejection: &Rejection);

    fn game_ended(&mut self, _winners: &[String]) {}

    fn chat_message(&mut self, _message: &ChatMessage) {}

    fn shutdown(&mut self, _reason: &str) {}

    /// The link to the server is gone. Called at most once per connection.
    fn no_connection(&mut self);
}

impl ServerEvent {
    /// Dispatch this event to the matching listener method.
    pub fn apply(&self, listener: &mut dyn GameListener) {
        match self {
            ServerEvent::Snapshot(snapshot) => listener.snapshot(snapshot),
            ServerEvent::PlayerJoined { nickname } => listener.player_joined(nickname),
            ServerEvent::PlayerLeft { nickname } => listener.player_left(nickname),
            ServerEvent::PlayerDisconnected { nickname } => listener.player_disconnected(nickname),
            ServerEvent::PlayerRejoined { nickname } => listener.player_rejoined(nickname),
            ServerEvent::TurnAdvanced { nickname, round } => listener.turn_advanced(nickname, *round),
            ServerEvent::InvalidAction(rejection) => listener.invalid_action(rejection),
            ServerEvent::GameEnded { winners } => listener.game_ended(winners),
            ServerEvent::ChatMessage(message) => listener.chat_message(message),
            ServerEvent::Shutdown { reason } => listener.shutdown(reason),
        }
    }
}

// =============================================================================
// REJECTIONS
// =============================================================================

/// A refused request, delivered to its originator only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Machine-readable reason.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Session has no free seat.
    GameFull,
    /// No IDLE session with a free seat.
    NoJoinableSession,
    /// Unknown session id.
    SessionNotFound,
    /// No session holds a disconnected player with that nickname.
    NothingToReconnect,
    /// Session is in the wrong lifecycle state.
    WrongStatus,
    /// Nickname already used in the session.
    NicknameTaken,
    /// Nickname empty or too long.
    InvalidNickname,
    /// Creator has not chosen the size yet.
    SizeNotSet,
    /// Size already chosen.
    SizeAlreadySet,
    /// Size outside 2..=4.
    InvalidSize,
    /// Only the creator may do this.
    NotCreator,
    /// Player not in the session.
    UnknownPlayer,
    /// Player is not in the required action state.
    NotYourTurn,
    /// Player is connected.
    NotDisconnected,
    /// First move already made.
    AlreadyDone,
    /// Hand, objective or display index out of range.
    InvalidIndex,
    /// Deck has no cards left.
    EmptyDeck,
    /// Chat text empty or too long.
    InvalidChat,
    /// Placement breaks the board rules.
    IllegalPlacement,
    /// Gold card requirement not met.
    RequirementsNotRespected,
    /// Connection already bound to a session.
    AlreadyInSession,
    /// Connection is not bound to a session.
    NotInSession,
    /// Connection limit reached.
    ServerOverloaded,
    /// Malformed request.
    InvalidInput,
    /// Unexpected server failure.
    InternalError,
}

impl From<&ActionError> for ErrorCode {
    fn from(error: &ActionError) -> Self {
        match error {
            ActionError::WrongStatus { .. } => ErrorCode::WrongStatus,
            ActionError::GameFull => ErrorCode::GameFull,
            ActionError::NicknameTaken(_) => ErrorCode::NicknameTaken,
            ActionError::InvalidNickname => ErrorCode::InvalidNickname,
            ActionError::SizeNotSet => ErrorCode::SizeNotSet,
            ActionError::SizeAlreadySet => ErrorCode::SizeAlreadySet,
            ActionError::InvalidSize(_) => ErrorCode::InvalidSize,
            ActionError::NotCreator => ErrorCode::NotCreator,
            ActionError::UnknownPlayer(_) => ErrorCode::UnknownPlayer,
            ActionError::WrongAction { .. } => ErrorCode::NotYourTurn,
            ActionError::NotDisconnected(_) => ErrorCode::NotDisconnected,
            ActionError::StarterAlreadyPlaced | ActionError::ObjectiveAlreadyChosen => ErrorCode::AlreadyDone,
            ActionError::InvalidHandIndex(_)
            | ActionError::InvalidObjectiveIndex(_)
            | ActionError::EmptyDisplaySlot { .. } => ErrorCode::InvalidIndex,
            ActionError::EmptyDeck(_) => ErrorCode::EmptyDeck,
            ActionError::InvalidChat => ErrorCode::InvalidChat,
            ActionError::Placement(PlacementError::RequirementsNotRespected) => {
                ErrorCode::RequirementsNotRespected
            }
            ActionError::Placement(_) => ErrorCode::IllegalPlacement,
        }
    }
}

impl From<ActionError> for Rejection {
    fn from(error: ActionError) -> Self {
        Rejection::new(ErrorCode::from(&error), error.to_string())
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientRequest {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl ServerEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

// =============================================================================
// TESTS
// =============================================================================
