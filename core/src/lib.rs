/// ChatSync - real-time chat synchronization core
///
/// A live, bidirectionally paginated, deduplicated view of one conversation,
/// fed by cursor-paginated history and a shared auto-reconnecting push
/// connection, with optimistic sends reconciled against server echoes.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod push;
pub mod message_store;
pub mod send_pipeline;
pub mod conversation;
pub mod context;
pub mod utils;
pub mod api;

pub use api::{ChatApi, HttpChatApi, OutgoingFile, PageFetcher, SendRequest};
pub use config::Config;
pub use context::ChatContext;
pub use conversation::ConversationView;
pub use error::{ChatError, Result};
pub use message_store::{FetchKind, FetchOutcome, FetchState, MessageStore};
pub use messenger_types::{DeliveryState, Message, MessagePage, SortDirection};
pub use push::{ConnectionManager, ConnectionState, EventDispatcher};
pub use send_pipeline::{Draft, OptimisticSendPipeline};
