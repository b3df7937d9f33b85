//! Game state
//!
//! The authoritative model of one session: status, players in join order,
//! chat log and desk. All mutation goes through the operations in
//! [`super::turn`]; this module only holds data and read-side helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::card::{Card, ObjectiveCard};
use super::codex::Codex;
use super::desk::Desk;
use super::events::GameEvent;
use crate::core::hash::{StateHash, StateHasher};

/// Server-assigned session identifier.
pub type SessionId = u32;

// =============================================================================
// STATUS & ACTION STATES
// =============================================================================

/// Lifecycle of a session. Only ever moves forward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameStatus {
    /// Waiting for players
    #[default]
    Idle,
    /// Target size reached, game in progress
    Active,
    /// Finished or abandoned
    Ended,
}

/// What a player may do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerAction {
    /// Must place the starter and pick a secret objective.
    FirstMoves,
    /// Waiting for their turn.
    Wait,
    /// Their turn: must place a card.
    Place,
    /// Their turn: must draw a card.
    Draw,
    /// Connection lost; the previous state is kept aside.
    Disconnected,
    /// Done for this game.
    Ended,
}

impl PlayerAction {
    /// Holds the turn.
    pub fn is_turn(self) -> bool {
        matches!(self, PlayerAction::Place | PlayerAction::Draw)
    }

    /// Still takes part in the rotation.
    pub fn is_in_play(self) -> bool {
        matches!(self, PlayerAction::Wait | PlayerAction::Place | PlayerAction::Draw)
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// A seat in a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Unique within the session, case-sensitive
    pub nickname: String,

    pub action: PlayerAction,

    /// State to restore on reconnect, set while `Disconnected`
    pub resume_action: Option<PlayerAction>,

    pub connected: bool,

    pub hand: Vec<Card>,

    /// Dealt starter card, until it is placed
    pub starter: Option<Card>,

    /// Secret objectives to choose from, until one is chosen
    pub objective_options: Vec<ObjectiveCard>,

    pub objective: Option<ObjectiveCard>,

    pub codex: Codex,

    pub points: u32,
}

impl Player {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            action: PlayerAction::Wait,
            resume_action: None,
            connected: true,
            hand: Vec::new(),
            starter: None,
            objective_options: Vec::new(),
            objective: None,
            codex: Codex::new(),
            points: 0,
        }
    }

    /// Starter placed and objective chosen.
    pub fn first_moves_done(&self) -> bool {
        self.starter.is_none() && self.objective.is_some()
    }

    /// Hash this player's state for verification.
    pub fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_str(&self.nickname);
        hasher.update_u8(self.action as u8);
        hasher.update_u8(self.resume_action.map(|a| a as u8 + 1).unwrap_or(0));
        hasher.update_bool(self.connected);
        hasher.update_u32(self.points);

        hasher.update_u32(self.hand.len() as u32);
        for card in &self.hand {
            hasher.update_u32(card.id);
        }
        hasher.update_u32(self.starter.as_ref().map(|c| c.id).unwrap_or(0));
        for objective in &self.objective_options {
            hasher.update_u32(objective.id);
        }
        hasher.update_u32(self.objective.as_ref().map(|o| o.id).unwrap_or(0));

        hasher.update_u32(self.codex.len() as u32);
        for placed in self.codex.cards() {
            hasher.update_u32(placed.card.id);
            hasher.update_bool(placed.face_up);
            hasher.update_i32(placed.position.row);
            hasher.update_i32(placed.position.col);
        }
    }
}

// =============================================================================
// CHAT
// =============================================================================

/// One public chat line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

// =============================================================================
// GAME MODEL
// =============================================================================

/// Complete state of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameModel {
    pub id: SessionId,

    pub status: GameStatus,

    /// Chosen by the creator, 2..=4
    pub target_size: Option<u8>,

    /// Join order, which is also turn order
    pub players: Vec<Player>,

    /// Append-only
    pub chat: Vec<ChatMessage>,

    pub desk: Desk,

    /// Desk shuffle seed
    pub seed: u64,

    /// Everyone finished their first moves
    pub turns_started: bool,

    /// Index of the player who last held the turn
    pub turn_cursor: Option<usize>,

    /// Completed rotations
    pub round: u32,

    /// Last round to be played, once the end game is armed
    pub final_round: Option<u32>,

    /// Set when the session ends
    pub winners: Vec<String>,

    /// Events generated by the last operation
    #[serde(skip)]
    pub pending_events: Vec<GameEvent>,
}

impl GameModel {
    /// Create an empty IDLE session.
    pub fn new(id: SessionId, seed: u64) -> Self {
        Self {
            id,
            status: GameStatus::Idle,
            target_size: None,
            players: Vec::new(),
            chat: Vec::new(),
            desk: Desk::default(),
            seed,
            turns_started: false,
            turn_cursor: None,
            round: 0,
            final_round: None,
            winners: Vec::new(),
            pending_events: Vec::new(),
        }
    }

    /// The creator, who alone may set the size.
    pub fn creator(&self) -> Option<&Player> {
        self.players.first()
    }

    pub fn player(&self, nickname: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.nickname == nickname)
    }

    pub fn player_mut(&mut self, nickname: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.nickname == nickname)
    }

    pub fn player_index(&self, nickname: &str) -> Option<usize> {
        self.players.iter().position(|p| p.nickname == nickname)
    }

    /// Nickname of the player holding the turn.
    pub fn current_player(&self) -> Option<&Player> {
        self.players.iter().find(|p| p.action.is_turn())
    }

    pub fn connected_count(&self) -> usize {
        self.players.iter().filter(|p| p.connected).count()
    }

    /// IDLE with a chosen size and a free seat.
    pub fn is_joinable(&self) -> bool {
        self.status == GameStatus::Idle
            && self
                .target_size
                .map(|size| self.players.len() < size as usize)
                .unwrap_or(false)
    }

    pub fn is_ended(&self) -> bool {
        self.status == GameStatus::Ended
    }

    /// Compute the hash carried by snapshots of this model.
    pub fn compute_hash(&self) -> StateHash {
        let mut hasher = StateHasher::for_snapshot();

        hasher.update_u32(self.id);
        hasher.update_u8(self.status as u8);
        hasher.update_u8(self.target_size.unwrap_or(0));
        hasher.update_u64(self.seed);
        hasher.update_bool(self.turns_started);
        hasher.update_u32(self.turn_cursor.map(|c| c as u32 + 1).unwrap_or(0));
        hasher.update_u32(self.round);
        hasher.update_u32(self.final_round.map(|r| r + 1).unwrap_or(0));

        hasher.update_u32(self.players.len() as u32);
        for player in &self.players {
            player.hash_into(&mut hasher);
        }

        hasher.update_u32(self.chat.len() as u32);
        for message in &self.chat {
            hasher.update_str(&message.sender);
            hasher.update_str(&message.text);
            hasher.update_i64(message.sent_at.timestamp());
            hasher.update_u32(message.sent_at.timestamp_subsec_nanos());
        }

        let desk = &self.desk;
        for pile in [
            &desk.resource_deck,
            &desk.gold_deck,
            &desk.displayed_resource,
            &desk.displayed_gold,
            &desk.starter_deck,
        ] {
            hasher.update_u32(pile.len() as u32);
            for card in pile {
                hasher.update_u32(card.id);
            }
        }
        for pile in [&desk.objective_deck, &desk.common_objectives] {
            hasher.update_u32(pile.len() as u32);
            for objective in pile {
                hasher.update_u32(objective.id);
            }
        }

        hasher.update_u32(self.winners.len() as u32);
        for winner in &self.winners {
            hasher.update_str(winner);
        }

        hasher.finalize()
    }

    /// Take pending events (consumes them).
    pub fn take_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub(crate) fn push_event(&mut self, event: GameEvent) {
        self.pending_events.push(event);
    }
}

// =============================================================================
// TESTS
// =============================================================================
