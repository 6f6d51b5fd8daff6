/// One mounted conversation: store, send pipeline and the push handlers feeding them
use crate::api::{ChatApi, PageFetcher};
use crate::error::Result;
use crate::message_store::{FetchOutcome, MessageStore};
use crate::messenger_types::SortDirection;
use crate::push::connection::{ConnectionManager, RecoveryHandle};
use crate::push::dispatcher::{ChatEventKind, ListenerScope};
use crate::send_pipeline::OptimisticSendPipeline;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ConversationView {
    conversation_id: String,
    connection: ConnectionManager,
    store: MessageStore,
    pipeline: OptimisticSendPipeline,
    listeners: ListenerScope,
    recovery: Option<RecoveryHandle>,
}

impl ConversationView {
    /// Wire a fresh store to the shared connection and load the newest page.
    ///
    /// Handlers are registered before the initial fetch so nothing that
    /// arrives while it is in flight is lost. A connection that cannot be
    /// established is not fatal: history still loads and the reconnect
    /// catch-up runs once it comes back.
    pub async fn mount(
        connection: &ConnectionManager,
        fetcher: Arc<dyn PageFetcher>,
        api: Arc<dyn ChatApi>,
        conversation_id: &str,
        sender_id: &str,
        page_size: usize,
    ) -> Result<Self> {
        let store = MessageStore::with_options(fetcher, SortDirection::NewestFirst, page_size);

        let mut listeners = ListenerScope::new(connection.dispatcher());
        for kind in ChatEventKind::ALL {
            let store = store.clone();
            listeners.on_chat_event(kind, move |event| {
                store.apply_event(event);
            });
        }

        let catch_up = store.clone();
        let recovery = connection.on_reconnected(move || {
            let store = catch_up.clone();
            tokio::spawn(async move {
                match store.load_newer().await {
                    Ok(outcome) => debug!("Reconnect catch-up: {:?}", outcome),
                    Err(e) => warn!("Reconnect catch-up failed: {}", e),
                }
            });
        });

        if let Err(e) = connection.start().await {
            warn!("Push connection unavailable, showing history only: {}", e);
        }

        let pipeline =
            OptimisticSendPipeline::new(store.clone(), api, conversation_id, sender_id);
        let view = Self {
            conversation_id: conversation_id.to_string(),
            connection: connection.clone(),
            store,
            pipeline,
            listeners,
            recovery: Some(recovery),
        };

        let outcome = view.store.load_initial(conversation_id).await?;
        info!("Mounted conversation {}: {:?}", conversation_id, outcome);
        Ok(view)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn pipeline(&self) -> &OptimisticSendPipeline {
        &self.pipeline
    }

    /// Pull-to-refresh
    pub async fn refresh(&self) -> Result<FetchOutcome> {
        self.store.load_newer().await
    }

    /// Remove this view's handlers and stop applying late results.
    /// The shared connection stays up.
    pub fn unmount(&mut self) {
        self.listeners.dispose();
        if let Some(handle) = self.recovery.take() {
            self.connection.remove_recovery(handle);
        }
        self.store.close();
        debug!("Unmounted conversation {}", self.conversation_id);
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.unmount();
    }
}
