//! Game model and turn validation.
//!
//! Everything in here is synchronous and transport-agnostic. The network
//! layer wraps a [`GameModel`] in a session lock and calls the operations in
//! [`turn`] from inside the critical section.

pub mod card;
pub mod codex;
pub mod desk;
pub mod events;
pub mod rules;
pub mod state;
pub mod turn;

pub use card::{Card, CardSet, Kingdom, ObjectiveCard};
pub use codex::{Codex, Position};
pub use desk::{DeckType, Desk};
pub use events::GameEvent;
pub use rules::{RuleEvaluator, StandardRules};
pub use state::{ChatMessage, GameModel, GameStatus, Player, PlayerAction, SessionId};
pub use turn::ActionError;
