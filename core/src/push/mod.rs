/// Push connection: wire protocol, lifecycle and event fan-out
pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod websocket;

pub use connection::{
    Backoff, ConnectionManager, ConnectionState, PushSession, PushTransport, ReconnectPolicy,
    RecoveryHandle, StaticToken, TokenProvider,
};
pub use dispatcher::{ChatEvent, ChatEventKind, EventDispatcher, ListenerScope, PushEvent, Subscription};
pub use protocol::{HubMessage, PROTOCOL_VERSION};
pub use websocket::WebSocketTransport;
