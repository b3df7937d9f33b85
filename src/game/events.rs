//! Game events
//!
//! Deltas produced by the state machine. The session turns each of them
//! into a pushed server event, followed by one snapshot per mutation.

use serde::{Deserialize, Serialize};

use super::state::ChatMessage;

/// Something observers should hear about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameEvent {
    PlayerJoined { nickname: String },
    PlayerLeft { nickname: String },
    PlayerDisconnected { nickname: String },
    PlayerRejoined { nickname: String },
    /// The named player now has the turn.
    TurnAdvanced { nickname: String, round: u32 },
    ChatPosted(ChatMessage),
    GameEnded { winners: Vec<String> },
}

impl GameEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            GameEvent::PlayerJoined { .. } => "player_joined",
            GameEvent::PlayerLeft { .. } => "player_left",
            GameEvent::PlayerDisconnected { .. } => "player_disconnected",
            GameEvent::PlayerRejoined { .. } => "player_rejoined",
            GameEvent::TurnAdvanced { .. } => "turn_advanced",
            GameEvent::ChatPosted(_) => "chat",
            GameEvent::GameEnded { .. } => "game_ended",
        }
    }
}
