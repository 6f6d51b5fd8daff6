/// Optimistic send pipeline
///
/// Text-only sends show up at once as a `Pending` entry whose id is sent
/// along with the request; the server's created event for that id later
/// confirms it in place. Attachment sends block on the upload instead.
use crate::api::{ChatApi, OutgoingFile, SendRequest};
use crate::error::{ChatError, Result};
use crate::message_store::MessageStore;
use crate::messenger_types::{DeliveryState, Message};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Compose state of one conversation screen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub files: Vec<OutgoingFile>,
}

impl Draft {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.files.is_empty()
    }
}

pub struct OptimisticSendPipeline {
    store: MessageStore,
    api: Arc<dyn ChatApi>,
    conversation_id: String,
    sender_id: String,
    draft: Mutex<Draft>,
    sending: watch::Sender<bool>,
}

impl OptimisticSendPipeline {
    pub fn new(
        store: MessageStore,
        api: Arc<dyn ChatApi>,
        conversation_id: &str,
        sender_id: &str,
    ) -> Self {
        let (sending, _) = watch::channel(false);
        Self {
            store,
            api,
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            draft: Mutex::new(Draft::default()),
            sending,
        }
    }

    fn draft_guard(&self) -> MutexGuard<'_, Draft> {
        self.draft.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_draft_text(&self, text: &str) {
        self.draft_guard().text = text.to_string();
    }

    pub fn add_attachment(&self, file: OutgoingFile) {
        self.draft_guard().files.push(file);
    }

    pub fn draft(&self) -> Draft {
        self.draft_guard().clone()
    }

    /// An attachment send is in flight
    pub fn is_sending(&self) -> bool {
        *self.sending.borrow()
    }

    pub fn watch_sending(&self) -> watch::Receiver<bool> {
        self.sending.subscribe()
    }

    /// Send whatever is composed.
    ///
    /// Text-only drafts are cleared right away (the pending entry carries
    /// the text from then on); drafts with files are cleared only after the
    /// upload succeeded.
    pub async fn submit(&self) -> Result<()> {
        let draft = self.draft();
        if draft.is_empty() {
            return Err(ChatError::InvalidInput("nothing to send".to_string()));
        }

        if draft.files.is_empty() {
            self.draft_guard().text.clear();
            self.send_text(&draft.text).await?;
            return Ok(());
        }

        self.send_with_attachments(&draft.text, draft.files.clone())
            .await?;
        let mut current = self.draft_guard();
        if *current == draft {
            *current = Draft::default();
        }
        Ok(())
    }

    /// Insert a pending entry, then send it under the same id.
    ///
    /// On failure the entry stays in the store as `Failed`.
    pub async fn send_text(&self, text: &str) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::InvalidInput("message text is empty".to_string()));
        }

        let local = Message::pending(&self.conversation_id, &self.sender_id, text);
        let message_id = local.message_id.clone();
        if !self.store.apply_created(local.clone()) {
            return Err(ChatError::InvalidState(format!(
                "store is not showing conversation {}",
                self.conversation_id
            )));
        }
        debug!("Optimistic message {} inserted", message_id);

        self.deliver(local).await
    }

    async fn deliver(&self, local: Message) -> Result<Message> {
        let message_id = local.message_id.clone();
        let request = SendRequest {
            conversation_id: self.conversation_id.clone(),
            text: local.body.clone(),
            message_id: Some(message_id.clone()),
            files: Vec::new(),
        };

        match self.api.send_message(request).await {
            Ok(echo) => {
                if let Some(echo) = echo {
                    self.store.apply_created(echo);
                }
                Ok(self.store.get(&message_id).unwrap_or(local))
            }
            Err(e) => {
                warn!("Send of {} failed: {}", message_id, e);
                self.store.mark_failed(&message_id);
                Err(e)
            }
        }
    }

    /// Upload a message with files. No pending entry is shown; the
    /// sending flag is held until the request resolves.
    pub async fn send_with_attachments(
        &self,
        text: &str,
        files: Vec<OutgoingFile>,
    ) -> Result<Option<Message>> {
        if files.is_empty() {
            return Err(ChatError::InvalidInput("no files attached".to_string()));
        }
        let claimed = self.sending.send_if_modified(|sending| {
            if *sending {
                false
            } else {
                *sending = true;
                true
            }
        });
        if !claimed {
            return Err(ChatError::InvalidState(
                "another attachment send is in progress".to_string(),
            ));
        }

        info!("Uploading message with {} files", files.len());
        let request = SendRequest {
            conversation_id: self.conversation_id.clone(),
            text: text.trim().to_string(),
            message_id: None,
            files,
        };
        let result = self.api.send_message(request).await;
        self.sending.send_replace(false);

        let created = result?;
        if let Some(message) = &created {
            self.store.apply_created(message.clone());
        }
        Ok(created)
    }

    /// Edit through the API and apply the result; nothing optimistic
    pub async fn edit(&self, message_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::InvalidInput("edited text is empty".to_string()));
        }
        if let Some(edited) = self.api.edit_message(message_id, text).await? {
            self.store.apply_edited(edited);
        }
        Ok(())
    }

    pub async fn delete(&self, message_id: &str) -> Result<()> {
        self.api.delete_message(message_id).await?;
        if let Some(message) = self.store.get(message_id) {
            self.store.apply_deleted(Message {
                deleted_at: None,
                ..message
            });
        }
        Ok(())
    }

    /// Send a failed entry again under its original id
    pub async fn retry(&self, message_id: &str) -> Result<Message> {
        let message = self.failed_entry(message_id)?;
        self.store.mark_pending(message_id);
        info!("Retrying message {}", message_id);
        self.deliver(Message {
            delivery: DeliveryState::Pending,
            ..message
        })
        .await
    }

    /// Drop a failed entry from the view
    pub fn discard(&self, message_id: &str) -> Result<Message> {
        self.failed_entry(message_id)?;
        self.store
            .remove(message_id)
            .ok_or_else(|| ChatError::InvalidState(format!("message {} is gone", message_id)))
    }

    fn failed_entry(&self, message_id: &str) -> Result<Message> {
        let message = self
            .store
            .get(message_id)
            .ok_or_else(|| ChatError::InvalidInput(format!("unknown message {}", message_id)))?;
        if message.delivery != DeliveryState::Failed {
            return Err(ChatError::InvalidState(format!(
                "message {} is {:?}, not failed",
                message_id, message.delivery
            )));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_emptiness() {
        let mut draft = Draft::default();
        assert!(draft.is_empty());
        draft.text = "   ".to_string();
        assert!(draft.is_empty());
        draft.files.push(OutgoingFile {
            file_name: "a.png".to_string(),
            content_type: None,
            data: bytes::Bytes::from_static(b"png"),
        });
        assert!(!draft.is_empty());
    }
}
