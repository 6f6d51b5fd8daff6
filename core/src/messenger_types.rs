/// Shared types for the chat layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Where a message stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Inserted locally, not yet confirmed
    Pending,
    /// Known to the server
    #[default]
    Confirmed,
    /// The send request failed; can be retried or discarded
    Failed,
}

/// One chat message
///
/// Anything decoded from the wire is `Confirmed`; only the send pipeline
/// creates `Pending` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    /// Empty for attachment-only messages
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub delivery: DeliveryState,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Synthesize a local, not-yet-confirmed message with a fresh id
    pub fn pending(conversation_id: &str, sender_id: &str, body: &str) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            delivery: DeliveryState::Pending,
        }
    }

    /// Server-confirmed (the boolean `sent` view of `delivery`)
    pub fn is_sent(&self) -> bool {
        self.delivery == DeliveryState::Confirmed
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_edited(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Fold a fresher payload for the same message into this one.
    ///
    /// The payload wins for content. `created_at` is fixed once the server
    /// has confirmed the message; a local entry adopts the server's
    /// timestamp on confirmation. `updated_at`/`deleted_at` never go back
    /// to `None`, and a confirmed message never becomes pending again.
    pub fn absorb(&mut self, incoming: Message) {
        let confirmed_here = self.delivery == DeliveryState::Confirmed;
        let created_at = if !confirmed_here && incoming.delivery == DeliveryState::Confirmed {
            incoming.created_at
        } else {
            self.created_at
        };
        let delivery = if confirmed_here {
            DeliveryState::Confirmed
        } else {
            incoming.delivery
        };
        let updated_at = incoming.updated_at.or(self.updated_at);
        let deleted_at = incoming.deleted_at.or(self.deleted_at);

        *self = Message {
            created_at,
            updated_at,
            deleted_at,
            delivery,
            ..incoming
        };
    }
}

/// Order of the materialized sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortDirection {
    /// Chat view: index 0 is the newest message
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SortDirection {
    /// Total order by `created_at`, ties broken by `message_id`
    pub fn compare(&self, a: &Message, b: &Message) -> Ordering {
        let ascending = a
            .created_at
            .cmp(&b.created_at)
            .then_with(|| a.message_id.cmp(&b.message_id));
        match self {
            SortDirection::OldestFirst => ascending,
            SortDirection::NewestFirst => ascending.reverse(),
        }
    }

    /// Index where live messages arrive in a sequence of `len` items
    pub fn live_end(&self, len: usize) -> usize {
        match self {
            SortDirection::NewestFirst => 0,
            SortDirection::OldestFirst => len.saturating_sub(1),
        }
    }
}

/// Cursors bounding the materialized window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPair {
    /// Toward newer messages not yet fetched
    pub next: Option<String>,
    /// Toward older messages not yet fetched
    pub prev: Option<String>,
}

/// One response of the paged fetch endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: Vec<Message>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub prev_cursor: Option<String>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default)]
    pub has_prev: bool,
}

impl MessagePage {
    /// Cursor to keep for the newer direction (None when exhausted)
    pub fn next(&self) -> Option<String> {
        if self.has_next {
            self.next_cursor.clone()
        } else {
            None
        }
    }

    /// Cursor to keep for the older direction (None when exhausted)
    pub fn prev(&self) -> Option<String> {
        if self.has_prev {
            self.prev_cursor.clone()
        } else {
            None
        }
    }
}

/// Which window a paged fetch asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAnchor {
    /// No cursor: the newest page
    Newest,
    /// Strictly older than the cursor
    Before(String),
    /// Strictly newer than the cursor
    After(String),
}

/// Arguments of one paged fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: String,
    pub limit: usize,
    pub anchor: PageAnchor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn confirmed(id: &str, secs: i64) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: "c".to_string(),
            sender_id: "u".to_string(),
            body: format!("body {}", id),
            attachments: Vec::new(),
            created_at: at(secs),
            updated_at: None,
            deleted_at: None,
            delivery: DeliveryState::Confirmed,
        }
    }

    #[test]
    fn test_wire_message_is_confirmed_and_tolerates_nulls() {
        let json = r#"{
            "messageId": "m1",
            "conversationId": "c1",
            "senderId": "u1",
            "body": null,
            "attachments": null,
            "createdAt": "2024-05-01T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.body, "");
        assert!(msg.attachments.is_empty());
        assert!(msg.is_sent());
        assert!(!msg.is_deleted());
    }

    #[test]
    fn test_absorb_confirms_pending_and_adopts_server_time() {
        let mut local = confirmed("c1", 50);
        local.delivery = DeliveryState::Pending;
        let echo = confirmed("c1", 51);

        local.absorb(echo);
        assert_eq!(local.delivery, DeliveryState::Confirmed);
        assert_eq!(local.created_at, at(51));
    }

    #[test]
    fn test_absorb_keeps_created_at_and_markers() {
        let mut msg = confirmed("m", 10);
        let mut edit = confirmed("m", 99);
        edit.body = "edited".to_string();
        edit.updated_at = Some(at(20));
        msg.absorb(edit);
        assert_eq!(msg.body, "edited");
        assert_eq!(msg.created_at, at(10));

        // a stale payload without markers must not clear them
        msg.absorb(confirmed("m", 10));
        assert_eq!(msg.updated_at, Some(at(20)));

        let mut stale_local = confirmed("m", 10);
        stale_local.delivery = DeliveryState::Pending;
        msg.absorb(stale_local);
        assert!(msg.is_sent());
    }

    #[test]
    fn test_newest_first_tie_break_is_deterministic() {
        let a = confirmed("a", 5);
        let b = confirmed("b", 5);
        let c = confirmed("c", 6);
        let mut list = vec![a.clone(), c.clone(), b.clone()];
        list.sort_by(|x, y| SortDirection::NewestFirst.compare(x, y));
        let ids: Vec<&str> = list.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_page_cursors_follow_has_flags() {
        let page = MessagePage {
            next_cursor: Some("n".to_string()),
            prev_cursor: Some("p".to_string()),
            has_next: false,
            has_prev: true,
            ..Default::default()
        };
        assert_eq!(page.next(), None);
        assert_eq!(page.prev().as_deref(), Some("p"));
    }
}
