//! Game Session
//!
//! One per game: the authoritative model, the connection bindings of its
//! players, and the mutation counter stamped on every snapshot. The registry
//! keeps each session behind its own async mutex, which is the unit of
//! mutual exclusion: validation, mutation, snapshot capture and fan-out all
//! happen while the lock is held, so every observer sees mutations in the
//! same order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::listener::{ConnectionId, ListenerTable, PushHandle};
use super::protocol::{GameSnapshot, ServerEvent};
use crate::core::hash::short_hex;
use crate::game::codex::Position;
use crate::game::desk::DeckType;
use crate::game::rules::RuleEvaluator;
use crate::game::state::{GameModel, GameStatus, PlayerAction, SessionId};
use crate::game::turn::ActionError;

/// An in-game operation of a bound player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameAction {
    PlaceStarter { face_up: bool },
    PlaceCard { hand_index: usize, face_up: bool, position: Position },
    SelectObjective { index: usize },
    DrawFromDeck { deck: DeckType },
    DrawDisplayed { deck: DeckType, index: usize },
    Chat { text: String },
    SetSize { size: u8 },
}

/// State of one game session.
pub struct GameSession {
    model: GameModel,
    listeners: ListenerTable,
    rules: Arc<dyn RuleEvaluator>,
    /// Number of committed mutations
    revision: u64,
    /// Since when nobody has been connected to the ACTIVE session
    abandoned_since: Option<Instant>,
    /// When the session reached ENDED
    ended_at: Option<Instant>,
    /// Removed from the registry; joins must look elsewhere
    closed: bool,
}

impl GameSession {
    /// Create an empty IDLE session.
    pub fn new(id: SessionId, seed: u64, rules: Arc<dyn RuleEvaluator>) -> Self {
        Self {
            model: GameModel::new(id, seed),
            listeners: ListenerTable::new(),
            rules,
            revision: 0,
            abandoned_since: None,
            ended_at: None,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.model.id
    }

    /// Read-only view of the model.
    pub fn model(&self) -> &GameModel {
        &self.model
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Snapshot of the current state, as the last commit broadcast it.
    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot::capture(&self.model, self.revision)
    }

    // =========================================================================
    // Seating
    // =========================================================================

    /// Seat a player and bind its connection.
    pub fn join(&mut self, nickname: &str, handle: PushHandle, now: Instant) -> Result<(), ActionError> {
        self.model.add_player(nickname)?;
        self.listeners.attach(nickname, handle, now);
        self.commit();
        Ok(())
    }

    /// Restore a disconnected player and bind its new connection, replacing
    /// any stale binding.
    pub fn reconnect(&mut self, nickname: &str, handle: PushHandle, now: Instant) -> Result<(), ActionError> {
        self.model.reconnect(nickname, self.rules.as_ref())?;
        if let Some(stale) = self.listeners.attach(nickname, handle, now) {
            debug!(session = self.id(), nickname, stale = %stale.handle.connection, "replaced stale binding");
        }
        self.commit();
        Ok(())
    }

    /// The player leaves on purpose.
    pub fn leave(&mut self, nickname: &str) -> Result<(), ActionError> {
        self.model.leave(nickname, self.rules.as_ref())?;
        self.listeners.detach(nickname);
        self.commit();
        Ok(())
    }

    /// Whether `connection` is the live binding of `nickname`.
    pub fn is_bound(&self, nickname: &str, connection: ConnectionId) -> bool {
        self.listeners.is_bound_to(nickname, connection)
    }

    // =========================================================================
    // Play
    // =========================================================================

    /// Validate and apply one in-game action of a bound player.
    pub fn act(&mut self, nickname: &str, action: GameAction, now: DateTime<Utc>) -> Result<(), ActionError> {
        let rules = Arc::clone(&self.rules);
        let rules = rules.as_ref();
        let model = &mut self.model;

        let result = match action {
            GameAction::PlaceStarter { face_up } => model.place_starter(nickname, face_up, rules),
            GameAction::PlaceCard { hand_index, face_up, position } => {
                model.place_card(nickname, hand_index, face_up, position, rules)
            }
            GameAction::SelectObjective { index } => model.select_objective(nickname, index, rules),
            GameAction::DrawFromDeck { deck } => model.draw_from_deck(nickname, deck, rules),
            GameAction::DrawDisplayed { deck, index } => model.draw_displayed(nickname, deck, index, rules),
            GameAction::Chat { text } => model.post_chat(nickname, &text, now),
            GameAction::SetSize { size } => model.set_size(nickname, size),
        };
        result?;

        self.commit();
        Ok(())
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Record a heartbeat. Touches nothing but the liveness timestamp.
    pub fn heartbeat(&mut self, nickname: &str, connection: ConnectionId, now: Instant) -> bool {
        self.listeners.refresh(nickname, connection, now)
    }

    /// A transport connection ended. Ignored if the binding already moved to
    /// another connection.
    pub fn connection_lost(&mut self, nickname: &str, connection: ConnectionId) -> bool {
        if !self.listeners.detach_connection(nickname, connection) {
            return false;
        }
        self.model.disconnect(nickname, self.rules.as_ref());
        self.commit();
        true
    }

    /// Disconnect every binding whose heartbeat is older than `timeout`.
    pub fn expire_heartbeats(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let expired = self.listeners.expired(now, timeout);
        if expired.is_empty() {
            return expired;
        }

        for nickname in &expired {
            warn!(session = self.id(), %nickname, "heartbeat timeout");
            self.listeners.detach(nickname);
            self.model.disconnect(nickname, self.rules.as_ref());
        }
        self.commit();
        expired
    }

    /// End an ACTIVE session nobody has been connected to for `grace`.
    pub fn check_abandoned(&mut self, now: Instant, grace: Duration) -> bool {
        let deserted = self.model.status == GameStatus::Active && self.model.connected_count() == 0;
        if !deserted {
            self.abandoned_since = None;
            return false;
        }

        let since = *self.abandoned_since.get_or_insert(now);
        if now.saturating_duration_since(since) < grace {
            return false;
        }

        self.model.abandon();
        self.commit();
        true
    }

    /// IDLE with nobody seated.
    pub fn is_empty_idle(&self) -> bool {
        self.model.status == GameStatus::Idle && self.model.players.is_empty()
    }

    /// Ready to be dropped from the registry.
    pub fn is_evictable(&self, now: Instant, linger: Duration) -> bool {
        if self.is_empty_idle() {
            return true;
        }
        match self.ended_at {
            Some(ended) => now.saturating_duration_since(ended) >= linger,
            None => false,
        }
    }

    /// Mark as removed from the registry.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether `nickname` is seated here and waiting to reconnect.
    pub fn awaits_reconnect(&self, nickname: &str) -> bool {
        !self.closed
            && self.model.status == GameStatus::Active
            && self
                .model
                .player(nickname)
                .map(|p| p.action == PlayerAction::Disconnected)
                .unwrap_or(false)
    }

    /// Tell every attached connection the server is going away.
    pub fn announce_shutdown(&mut self, reason: &str) {
        self.listeners.broadcast(&ServerEvent::Shutdown { reason: reason.to_string() });
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Push the pending events and one snapshot to every binding. Bindings
    /// that cannot be reached are disconnected, which is itself a mutation
    /// and is pushed in turn.
    fn commit(&mut self) {
        loop {
            let events = self.model.take_events();
            self.revision += 1;

            let mut unreachable = Vec::new();
            for event in events {
                debug!(session = self.id(), event = event.name(), "event");
                unreachable.extend(self.listeners.broadcast(&ServerEvent::from(event)));
            }
            let snapshot = GameSnapshot::capture(&self.model, self.revision);
            debug!(
                session = self.id(),
                revision = self.revision,
                hash = %short_hex(&snapshot.state_hash),
                "snapshot"
            );
            unreachable.extend(self.listeners.broadcast(&ServerEvent::Snapshot(Box::new(snapshot))));

            if unreachable.is_empty() {
                break;
            }
            for nickname in &unreachable {
                self.model.disconnect(nickname, self.rules.as_ref());
            }
            if self.model.pending_events.is_empty() {
                break;
            }
        }

        if self.model.status == GameStatus::Ended && self.ended_at.is_none() {
            info!(session = self.id(), winners = ?self.model.winners, "session finished");
            self.ended_at = Some(Instant::now());
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::StandardRules;
    use crate::network::listener::TransportKind;
    use crate::network::protocol::ServerEvent;
    use tokio::sync::mpsc;

    fn session() -> GameSession {
        GameSession::new(1, 42, Arc::new(StandardRules))
    }

    fn handle(depth: usize) -> (PushHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(depth);
        (PushHandle::new(ConnectionId::new(), TransportKind::Rpc, tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn last_snapshot(events: &[ServerEvent]) -> GameSnapshot {
        events
            .iter()
            .rev()
            .find_map(|e| match e {
                ServerEvent::Snapshot(s) => Some((**s).clone()),
                _ => None,
            })
            .expect("no snapshot")
    }

    fn two_player(s: &mut GameSession) -> (PushHandle, mpsc::Receiver<ServerEvent>, PushHandle, mpsc::Receiver<ServerEvent>) {
        let now = Instant::now();
        let (a, rx_a) = handle(64);
        let (b, rx_b) = handle(64);
        s.join("alice", a.clone(), now).unwrap();
        s.act("alice", GameAction::SetSize { size: 2 }, Utc::now()).unwrap();
        s.join("bob", b.clone(), now).unwrap();
        (a, rx_a, b, rx_b)
    }

    #[test]
    fn test_join_pushes_events_then_snapshot() {
        let mut s = session();
        let (_a, mut rx_a, _b, mut rx_b) = two_player(&mut s);

        let events = drain(&mut rx_b);
        assert_eq!(events[0], ServerEvent::PlayerJoined { nickname: "bob".into() });
        let snapshot = last_snapshot(&events);
        assert_eq!(snapshot.model.status, GameStatus::Active);
        assert!(snapshot.verify());

        let alice_events = drain(&mut rx_a);
        assert_eq!(last_snapshot(&alice_events).revision, s.revision());
    }

    #[test]
    fn test_rejection_changes_nothing() {
        let mut s = session();
        let (_a, _rx_a, _b, mut rx_b) = two_player(&mut s);
        drain(&mut rx_b);
        let revision = s.revision();
        let before = s.model().clone();

        let result = s.act("bob", GameAction::DrawFromDeck { deck: DeckType::Gold }, Utc::now());
        assert!(matches!(result, Err(ActionError::WrongAction { .. })));
        assert_eq!(s.revision(), revision);
        assert_eq!(s.model(), &before);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_heartbeat_touches_nothing_else() {
        let mut s = session();
        let (a, _rx_a, _b, _rx_b) = two_player(&mut s);
        let revision = s.revision();
        let hash = s.model().compute_hash();

        for _ in 0..3 {
            assert!(s.heartbeat("alice", a.connection, Instant::now()));
        }
        assert_eq!(s.revision(), revision);
        assert_eq!(s.model().compute_hash(), hash);
    }

    #[test]
    fn test_dead_listener_becomes_disconnect() {
        let mut s = session();
        let (_a, rx_a, _b, mut rx_b) = two_player(&mut s);
        drop(rx_a);

        s.act("bob", GameAction::Chat { text: "anyone?".into() }, Utc::now()).unwrap();

        assert_eq!(s.model().player("alice").unwrap().action, PlayerAction::Disconnected);
        let events = drain(&mut rx_b);
        assert!(events.contains(&ServerEvent::PlayerDisconnected { nickname: "alice".into() }));
        assert!(last_snapshot(&events).model.player("alice").map(|p| !p.connected).unwrap());
    }

    #[test]
    fn test_stale_connection_loss_is_ignored() {
        let mut s = session();
        let (a, _rx_a, _b, _rx_b) = two_player(&mut s);

        assert!(!s.connection_lost("alice", ConnectionId::new()));
        assert!(s.model().player("alice").unwrap().connected);

        assert!(s.connection_lost("alice", a.connection));
        assert!(!s.model().player("alice").unwrap().connected);

        let (fresh, _rx) = handle(64);
        s.reconnect("alice", fresh.clone(), Instant::now()).unwrap();
        assert!(s.is_bound("alice", fresh.connection));
        assert!(!s.connection_lost("alice", a.connection));
    }

    #[test]
    fn test_heartbeat_timeout_disconnects() {
        let mut s = session();
        let (_a, _rx_a, b, mut rx_b) = two_player(&mut s);
        drain(&mut rx_b);

        let later = Instant::now() + Duration::from_secs(7);
        s.heartbeat("bob", b.connection, later);
        let expired = s.expire_heartbeats(later, Duration::from_secs(6));

        assert_eq!(expired, vec!["alice".to_string()]);
        assert!(drain(&mut rx_b).contains(&ServerEvent::PlayerDisconnected { nickname: "alice".into() }));
    }

    #[test]
    fn test_abandoned_session_ends_after_grace() {
        let mut s = session();
        let (a, _rx_a, b, _rx_b) = two_player(&mut s);
        s.connection_lost("alice", a.connection);
        s.connection_lost("bob", b.connection);

        let start = Instant::now();
        let grace = Duration::from_secs(60);
        assert!(!s.check_abandoned(start, grace));
        assert!(!s.check_abandoned(start + Duration::from_secs(30), grace));
        assert!(s.check_abandoned(start + Duration::from_secs(61), grace));
        assert_eq!(s.model().status, GameStatus::Ended);
        assert!(s.is_evictable(Instant::now() + Duration::from_secs(1), Duration::ZERO));
    }

    #[test]
    fn test_idle_leave_empties_session() {
        let mut s = session();
        let (a, _rx) = handle(8);
        s.join("alice", a, Instant::now()).unwrap();
        assert!(!s.is_empty_idle());

        s.leave("alice").unwrap();
        assert!(s.is_empty_idle());
        assert!(s.is_evictable(Instant::now(), Duration::from_secs(300)));
    }
}
