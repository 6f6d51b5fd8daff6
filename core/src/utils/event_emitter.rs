/// Change notifications from a message store to the screen rendering it
use crate::message_store::FetchKind;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// What changed in the materialized sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreChange {
    /// Sequence replaced by an initial load
    Reset { len: usize },
    /// Older page merged at the far end; existing items kept their positions
    Older { added: usize },
    /// Newer page merged (refresh or reconnection catch-up)
    Newer { added: usize },
    /// One live message inserted; `at_live_end` when it landed at the live end
    Live { message_id: String, at_live_end: bool },
    /// Existing message changed in place (edit, delete, confirmation, failure)
    Updated { message_id: String },
    /// Message dropped from the sequence (discarded failed send)
    Removed { message_id: String },
    /// A page fetch failed; cursors unchanged, the fetch can be requested again
    FetchFailed { kind: FetchKind, error: String },
}

pub struct EventEmitter {
    conversation_id: String,
    tx: broadcast::Sender<StoreChange>,
}

impl EventEmitter {
    pub fn new(conversation_id: String) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { conversation_id, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }

    /// Relabel after the store switched conversations
    pub fn set_conversation(&mut self, conversation_id: &str) {
        self.conversation_id = conversation_id.to_string();
    }

    pub fn emit(&self, change: StoreChange) {
        trace!(conversation = %self.conversation_id, ?change, "store change");
        // no receivers is fine: nobody is rendering
        let _ = self.tx.send(change);
    }
}

impl Clone for EventEmitter {
    fn clone(&self) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            tx: self.tx.clone(),
        }
    }
}
