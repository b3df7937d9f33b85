//! # Codex Table Server
//!
//! Session and protocol server for a 2–4 player turn-based card game. Clients
//! reach the same capability set over either of two bindings; the server owns
//! the authoritative game state and pushes every change to all seated players.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CODEX TABLE SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded Xorshift128+ for deck shuffles     │
//! │  └── hash.rs     - Snapshot state hashing                    │
//! │                                                              │
//! │  game/           - Game model (sync, transport-agnostic)     │
//! │  ├── card.rs     - Cards, corners, kingdoms, card set        │
//! │  ├── codex.rs    - A player's private board                  │
//! │  ├── desk.rs     - Shared decks and displayed cards          │
//! │  ├── rules.rs    - Placement rule evaluator                  │
//! │  ├── state.rs    - Session model and players                 │
//! │  ├── turn.rs     - Validated state machine operations        │
//! │  └── events.rs   - Deltas produced by operations             │
//! │                                                              │
//! │  network/        - Sessions and transports                   │
//! │  ├── protocol.rs - Requests, events, rejections, snapshots   │
//! │  ├── listener.rs - Connection bindings and fan-out           │
//! │  ├── session.rs  - Per-session critical section              │
//! │  ├── registry.rs - Session lookup, create/join/reconnect     │
//! │  ├── dispatch.rs - Request core shared by both bindings      │
//! │  ├── liveness.rs - Heartbeats and watchdog                   │
//! │  ├── rpc.rs      - WebSocket JSON call/return binding        │
//! │  ├── stream.rs   - Length-prefixed bincode stream binding    │
//! │  ├── client.rs   - Client capability set and view            │
//! │  └── server.rs   - Listeners and lifecycle                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Each session is one critical section: validation, mutation, snapshot and
//! fan-out happen under the same lock, so every observer of a session sees
//! its mutations in the same order. Sessions are independent of each other.

#![warn(clippy::all)]
#![deny(unsafe_code)]

use std::time::Duration;

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::state::{GameModel, GameStatus, PlayerAction, SessionId};
pub use network::client::{ClientAction, ClientView};
pub use network::protocol::{ClientRequest, GameSnapshot, ServerEvent};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version, stamped on every snapshot
pub const PROTOCOL_VERSION: u16 = 1;

/// Smallest table
pub const MIN_PLAYERS: u8 = 2;

/// Largest table
pub const MAX_PLAYERS: u8 = 4;

/// Client heartbeat period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
