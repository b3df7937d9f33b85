//! Session Registry
//!
//! Process-wide table of sessions keyed by id, and the only place sessions
//! are born. Every routing operation takes the target session's lock before
//! checking capacity and seating the player, so two joins racing for the
//! last seat are serialized and exactly one of them wins.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::listener::PushHandle;
use super::protocol::{ErrorCode, Rejection};
use super::session::GameSession;
use crate::core::rng::derive_session_seed;
use crate::game::rules::RuleEvaluator;
use crate::game::state::SessionId;
use crate::game::turn::ActionError;

/// A session as the registry hands it out.
pub type SharedSession = Arc<Mutex<GameSession>>;

/// Routing failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no joinable session")]
    NoJoinableSession,

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("no session has a disconnected player named '{0}'")]
    NothingToReconnect(String),

    #[error(transparent)]
    Action(#[from] ActionError),
}

impl From<RegistryError> for Rejection {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Action(action) => Rejection::from(action),
            other => {
                let code = match &other {
                    RegistryError::NoJoinableSession => ErrorCode::NoJoinableSession,
                    RegistryError::SessionNotFound(_) => ErrorCode::SessionNotFound,
                    _ => ErrorCode::NothingToReconnect,
                };
                Rejection::new(code, other.to_string())
            }
        }
    }
}

/// Where a joined connection ended up.
#[derive(Clone)]
pub struct Seat {
    pub session_id: SessionId,
    pub session: SharedSession,
}

impl fmt::Debug for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seat").field("session_id", &self.session_id).finish_non_exhaustive()
    }
}

/// All live sessions.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, SharedSession>>,
    next_id: AtomicU32,
    rules: Arc<dyn RuleEvaluator>,
    /// Fixed seed for reproducible deals, or fresh entropy per session
    base_seed: Option<u64>,
}

impl SessionRegistry {
    pub fn new(rules: Arc<dyn RuleEvaluator>, base_seed: Option<u64>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            rules,
            base_seed,
        }
    }

    fn session_seed(&self, id: SessionId) -> u64 {
        match self.base_seed {
            Some(seed) => derive_session_seed(id, &seed.to_le_bytes()),
            None => derive_session_seed(id, Uuid::new_v4().as_bytes()),
        }
    }

    /// Create a session with the caller in the first seat.
    pub async fn create(&self, nickname: &str, handle: PushHandle) -> Result<Seat, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = GameSession::new(id, self.session_seed(id), Arc::clone(&self.rules));
        session.join(nickname, handle, Instant::now())?;

        let session = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        info!(session = id, nickname, "session created");

        Ok(Seat { session_id: id, session })
    }

    /// Join the lowest-id IDLE session with a free seat.
    pub async fn join_first_available(&self, nickname: &str, handle: PushHandle) -> Result<Seat, RegistryError> {
        for (id, shared) in self.sessions().await {
            let mut session = shared.lock().await;
            if session.is_closed() || !session.model().is_joinable() {
                continue;
            }
            match session.join(nickname, handle.clone(), Instant::now()) {
                Ok(()) => {
                    drop(session);
                    info!(session = id, nickname, "joined first available");
                    return Ok(Seat { session_id: id, session: shared });
                }
                Err(ActionError::GameFull | ActionError::NicknameTaken(_) | ActionError::WrongStatus { .. }) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Err(RegistryError::NoJoinableSession)
    }

    /// Join a session by id.
    pub async fn join_specific(
        &self,
        nickname: &str,
        id: SessionId,
        handle: PushHandle,
    ) -> Result<Seat, RegistryError> {
        let shared = self.get(id).await.ok_or(RegistryError::SessionNotFound(id))?;
        let mut session = shared.lock().await;
        if session.is_closed() {
            return Err(RegistryError::SessionNotFound(id));
        }
        session.join(nickname, handle, Instant::now())?;
        drop(session);

        info!(session = id, nickname, "joined session");
        Ok(Seat { session_id: id, session: shared })
    }

    /// Reattach to the session holding a DISCONNECTED player of this name.
    /// Nicknames are only unique per session; the lowest id wins.
    pub async fn reconnect(&self, nickname: &str, handle: PushHandle) -> Result<Seat, RegistryError> {
        for (id, shared) in self.sessions().await {
            let mut session = shared.lock().await;
            if !session.awaits_reconnect(nickname) {
                continue;
            }
            session.reconnect(nickname, handle, Instant::now())?;
            drop(session);
            info!(session = id, nickname, "player reattached");
            return Ok(Seat { session_id: id, session: shared });
        }
        Err(RegistryError::NothingToReconnect(nickname.to_string()))
    }

    pub async fn get(&self, id: SessionId) -> Option<SharedSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// All sessions in id order. The map lock is released on return.
    pub async fn sessions(&self) -> Vec<(SessionId, SharedSession)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop a session if it has nobody left in it. Returns whether it went.
    pub async fn evict_if_empty(&self, id: SessionId) -> bool {
        let Some(shared) = self.get(id).await else {
            return false;
        };
        {
            let mut session = shared.lock().await;
            if !session.is_empty_idle() {
                return false;
            }
            session.close();
        }
        self.sessions.write().await.remove(&id);
        debug!(session = id, "empty session evicted");
        true
    }

    /// Remove ENDED sessions older than `linger` and empty IDLE sessions.
    pub async fn cleanup(&self, now: Instant, linger: Duration) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        for (id, shared) in self.sessions().await {
            let mut session = shared.lock().await;
            if session.is_evictable(now, linger) {
                session.close();
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &evicted {
                sessions.remove(id);
            }
            info!(count = evicted.len(), "sessions evicted");
        }
        evicted
    }

    /// Push a shutdown notice to every attached connection.
    pub async fn announce_shutdown(&self, reason: &str) {
        for (_, shared) in self.sessions().await {
            shared.lock().await.announce_shutdown(reason);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
