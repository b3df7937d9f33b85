//! Request Dispatch
//!
//! The one request/validation/broadcast core both bindings call into. Each
//! connection carries an explicit [`ConnectionContext`]; there is no ambient
//! notion of a current game or controller. A request either returns a
//! [`Reply`] or a [`Rejection`] naming the violated precondition.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use super::listener::{ConnectionId, PushHandle, TransportKind};
use super::protocol::{ClientRequest, ErrorCode, Rejection, Reply};
use super::registry::{Seat, SessionRegistry, SharedSession};
use super::session::GameAction;
use crate::game::state::SessionId;

/// The session a connection is attached to.
#[derive(Clone)]
pub struct SessionBinding {
    pub session_id: SessionId,
    pub nickname: String,
    pub session: SharedSession,
}

/// Per-connection state owned by the connection's reader task.
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub transport: TransportKind,
    pub handle: PushHandle,
    pub binding: Option<SessionBinding>,
}

impl ConnectionContext {
    pub fn new(handle: PushHandle) -> Self {
        Self {
            id: handle.connection,
            transport: handle.transport,
            handle,
            binding: None,
        }
    }

    fn bind(&mut self, seat: Seat, nickname: String) -> Reply {
        let reply = Reply::Session {
            session_id: seat.session_id,
            nickname: nickname.clone(),
        };
        self.binding = Some(SessionBinding {
            session_id: seat.session_id,
            nickname,
            session: seat.session,
        });
        reply
    }
}

fn not_in_session() -> Rejection {
    Rejection::new(ErrorCode::NotInSession, "connection is not attached to a session")
}

impl TryFrom<ClientRequest> for GameAction {
    type Error = ClientRequest;

    fn try_from(request: ClientRequest) -> Result<Self, Self::Error> {
        Ok(match request {
            ClientRequest::PlaceStarter { face_up } => GameAction::PlaceStarter { face_up },
            ClientRequest::PlaceCard { hand_index, face_up, position } => {
                GameAction::PlaceCard { hand_index, face_up, position }
            }
            ClientRequest::SelectObjective { index } => GameAction::SelectObjective { index },
            ClientRequest::DrawFromDeck { deck } => GameAction::DrawFromDeck { deck },
            ClientRequest::DrawDisplayed { deck, index } => GameAction::DrawDisplayed { deck, index },
            ClientRequest::Chat { text } => GameAction::Chat { text },
            ClientRequest::SetSize { size } => GameAction::SetSize { size },
            other => return Err(other),
        })
    }
}

/// Routes requests to the registry or the bound session.
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Execute one request on behalf of a connection.
    pub async fn handle(&self, ctx: &mut ConnectionContext, request: ClientRequest) -> Result<Reply, Rejection> {
        debug!(connection = %ctx.id, kind = request.kind(), "request");

        match request {
            ClientRequest::CreateGame { nickname } => {
                Self::ensure_unbound(ctx).await?;
                let seat = self.registry.create(&nickname, ctx.handle.clone()).await?;
                Ok(ctx.bind(seat, nickname))
            }
            ClientRequest::JoinFirstAvailable { nickname } => {
                Self::ensure_unbound(ctx).await?;
                let seat = self.registry.join_first_available(&nickname, ctx.handle.clone()).await?;
                Ok(ctx.bind(seat, nickname))
            }
            ClientRequest::JoinSpecific { nickname, session_id } => {
                Self::ensure_unbound(ctx).await?;
                let seat = self
                    .registry
                    .join_specific(&nickname, session_id, ctx.handle.clone())
                    .await?;
                Ok(ctx.bind(seat, nickname))
            }
            ClientRequest::Reconnect { nickname } => {
                Self::ensure_unbound(ctx).await?;
                let seat = self.registry.reconnect(&nickname, ctx.handle.clone()).await?;
                Ok(ctx.bind(seat, nickname))
            }
            ClientRequest::Leave => self.leave(ctx).await,
            ClientRequest::Ping => {
                let Some(binding) = &ctx.binding else {
                    return Ok(Reply::Done);
                };
                let alive = binding
                    .session
                    .lock()
                    .await
                    .heartbeat(&binding.nickname, ctx.id, Instant::now());
                if !alive {
                    // timed out or taken over; the client has to reconnect
                    ctx.binding = None;
                    return Err(not_in_session());
                }
                Ok(Reply::Done)
            }
            other => match GameAction::try_from(other) {
                Ok(action) => self.act(ctx, action).await,
                Err(request) => Err(Rejection::new(
                    ErrorCode::InvalidInput,
                    format!("unroutable request {}", request.kind()),
                )),
            },
        }
    }

    /// A binding the session no longer honours (heartbeat lapse, reconnect
    /// from elsewhere) does not count.
    async fn ensure_unbound(ctx: &mut ConnectionContext) -> Result<(), Rejection> {
        let Some(binding) = &ctx.binding else {
            return Ok(());
        };
        if binding.session.lock().await.is_bound(&binding.nickname, ctx.id) {
            return Err(Rejection::new(
                ErrorCode::AlreadyInSession,
                format!("already playing in session {}", binding.session_id),
            ));
        }
        ctx.binding = None;
        Ok(())
    }

    async fn act(&self, ctx: &mut ConnectionContext, action: GameAction) -> Result<Reply, Rejection> {
        let binding = ctx.binding.clone().ok_or_else(not_in_session)?;
        let mut session = binding.session.lock().await;

        if !session.is_bound(&binding.nickname, ctx.id) {
            // replaced by a reconnect elsewhere, or disconnected meanwhile
            drop(session);
            ctx.binding = None;
            return Err(not_in_session());
        }

        session.act(&binding.nickname, action, Utc::now())?;
        Ok(Reply::Done)
    }

    async fn leave(&self, ctx: &mut ConnectionContext) -> Result<Reply, Rejection> {
        let binding = ctx.binding.clone().ok_or_else(not_in_session)?;
        {
            let mut session = binding.session.lock().await;
            if session.is_bound(&binding.nickname, ctx.id) {
                session.leave(&binding.nickname)?;
            }
        }
        ctx.binding = None;
        self.registry.evict_if_empty(binding.session_id).await;

        info!(session = binding.session_id, nickname = %binding.nickname, "player left");
        Ok(Reply::Done)
    }

    /// The transport under `ctx` is gone.
    pub async fn connection_lost(&self, ctx: &mut ConnectionContext) {
        let Some(binding) = ctx.binding.take() else {
            return;
        };

        let lost = binding.session.lock().await.connection_lost(&binding.nickname, ctx.id);
        if lost {
            info!(session = binding.session_id, nickname = %binding.nickname, connection = %ctx.id, "connection lost");
        }
        self.registry.evict_if_empty(binding.session_id).await;
    }
}

// =============================================================================
// TESTS
// =============================================================================
