/// Process-wide chat context
///
/// Owns the one push connection and the REST collaborators; conversation
/// views borrow the connection from here instead of from a global.
use crate::api::{ChatApi, HttpChatApi, PageFetcher};
use crate::config::Config;
use crate::conversation::ConversationView;
use crate::error::{ChatError, Result};
use crate::push::connection::{ConnectionManager, PushTransport, ReconnectPolicy, TokenProvider};
use crate::push::websocket::WebSocketTransport;
use std::sync::{Arc, OnceLock};
use tracing::info;

pub struct ChatContext {
    config: Config,
    transport: Arc<dyn PushTransport>,
    tokens: Arc<dyn TokenProvider>,
    fetcher: Arc<dyn PageFetcher>,
    api: Arc<dyn ChatApi>,
    connection: OnceLock<ConnectionManager>,
}

impl ChatContext {
    /// Production wiring: WebSocket push plus the HTTP API
    pub fn new(config: Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        config.validate()?;
        let http = Arc::new(HttpChatApi::new(&config, tokens.clone())?);
        let transport = Arc::new(WebSocketTransport::new(&config));
        Ok(Self::with_parts(config, transport, tokens, http.clone(), http))
    }

    /// Wiring with caller-supplied collaborators
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn PushTransport>,
        tokens: Arc<dyn TokenProvider>,
        fetcher: Arc<dyn PageFetcher>,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        Self {
            config,
            transport,
            tokens,
            fetcher,
            api,
            connection: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared connection, created on first use (not yet started)
    pub fn connection(&self) -> &ConnectionManager {
        self.connection.get_or_init(|| {
            ConnectionManager::new(
                self.transport.clone(),
                self.tokens.clone(),
                ReconnectPolicy::from_config(&self.config),
            )
        })
    }

    /// Mount a view of one conversation on the shared connection
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<ConversationView> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::InvalidInput("conversation id is empty".to_string()));
        }
        let sender_id = self.config.sender_id.clone().unwrap_or_default();
        ConversationView::mount(
            self.connection(),
            self.fetcher.clone(),
            self.api.clone(),
            conversation_id,
            &sender_id,
            self.config.page_size,
        )
        .await
    }

    /// Logout: tear the shared connection down
    pub async fn shutdown(&self) {
        if let Some(connection) = self.connection.get() {
            connection.stop().await;
            info!("Chat context shut down");
        }
    }
}
