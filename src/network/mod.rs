//! Network Layer
//!
//! Sessions, the registry, and the two transport bindings over one shared
//! request core. Nothing here decides game rules; every mutation goes
//! through `game/`.

pub mod client;
pub mod dispatch;
pub mod listener;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod session;
pub mod stream;

pub use client::{ClientAction, ClientConfig, ClientError, ClientView, SharedListener};
pub use dispatch::{ConnectionContext, Dispatcher};
pub use listener::{ConnectionId, PushHandle, TransportKind};
pub use protocol::{ClientRequest, ErrorCode, GameListener, GameSnapshot, Rejection, Reply, ServerEvent};
pub use registry::{RegistryError, SessionRegistry};
pub use rpc::RpcClient;
pub use server::{BoundListeners, GameServer, GameServerError, ServerConfig};
pub use session::{GameAction, GameSession};
pub use stream::StreamClient;
