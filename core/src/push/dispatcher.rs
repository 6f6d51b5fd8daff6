/// Typed publish/subscribe over the shared push connection
use crate::error::{ChatError, Result};
use crate::messenger_types::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A named event delivered by the push connection
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub name: String,
    pub arguments: Vec<Value>,
}

impl PushEvent {
    pub fn new(name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Chat events the server pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatEventKind {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
}

impl ChatEventKind {
    pub const ALL: [ChatEventKind; 3] = [
        ChatEventKind::MessageCreated,
        ChatEventKind::MessageEdited,
        ChatEventKind::MessageDeleted,
    ];

    /// Event name on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatEventKind::MessageCreated => "MessageCreated",
            ChatEventKind::MessageEdited => "MessageEdited",
            ChatEventKind::MessageDeleted => "MessageDeleted",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ChatEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded chat event carrying its full message payload
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Created(Message),
    Edited(Message),
    Deleted(Message),
}

impl ChatEvent {
    /// Decode a push event; `Ok(None)` for events that are not chat events
    pub fn from_push(event: &PushEvent) -> Result<Option<Self>> {
        let Some(kind) = ChatEventKind::from_name(&event.name) else {
            return Ok(None);
        };
        let payload = event.arguments.first().ok_or_else(|| {
            ChatError::Protocol(format!("{} event without payload", kind))
        })?;
        let message: Message = serde_json::from_value(payload.clone())?;
        Ok(Some(Self::new(kind, message)))
    }

    pub fn new(kind: ChatEventKind, message: Message) -> Self {
        match kind {
            ChatEventKind::MessageCreated => ChatEvent::Created(message),
            ChatEventKind::MessageEdited => ChatEvent::Edited(message),
            ChatEventKind::MessageDeleted => ChatEvent::Deleted(message),
        }
    }

    pub fn kind(&self) -> ChatEventKind {
        match self {
            ChatEvent::Created(_) => ChatEventKind::MessageCreated,
            ChatEvent::Edited(_) => ChatEventKind::MessageEdited,
            ChatEvent::Deleted(_) => ChatEventKind::MessageDeleted,
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            ChatEvent::Created(m) | ChatEvent::Edited(m) | ChatEvent::Deleted(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            ChatEvent::Created(m) | ChatEvent::Edited(m) | ChatEvent::Deleted(m) => m,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Disposer token for one registered handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event_name(&self) -> &str {
        &self.event
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

/// Event bus shared by every subscriber of the push connection
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler for `event`
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("Registered handler {} for {}", id, event);
        Subscription {
            event: event.to_string(),
            id,
        }
    }

    /// Register a handler that receives decoded chat messages of one kind
    pub fn on_chat_event<F>(&self, kind: ChatEventKind, handler: F) -> Subscription
    where
        F: Fn(ChatEvent) + Send + Sync + 'static,
    {
        self.on(kind.as_str(), move |event| match ChatEvent::from_push(event) {
            Ok(Some(chat_event)) => handler(chat_event),
            Ok(None) => {}
            Err(e) => warn!("Dropping malformed {} event: {}", kind, e),
        })
    }

    /// Remove exactly the handler behind `subscription`
    pub fn off(&self, subscription: &Subscription) -> bool {
        let mut registry = self.registry();
        let Some(list) = registry.handlers.get_mut(&subscription.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.handlers.remove(&subscription.event);
        }
        removed
    }

    /// Invoke every handler registered for the event's name.
    ///
    /// Handlers run outside the registry lock, so they may register or
    /// remove handlers themselves.
    pub fn dispatch(&self, event: &PushEvent) -> usize {
        let handlers: Vec<EventHandler> = match self.registry().handlers.get(&event.name) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => Vec::new(),
        };
        if handlers.is_empty() {
            debug!("No handlers for {}", event.name);
        }
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.registry()
            .handlers
            .get(event)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

/// The handlers one subscriber added; disposing removes exactly those
pub struct ListenerScope {
    dispatcher: EventDispatcher,
    subscriptions: Vec<Subscription>,
}

impl ListenerScope {
    pub fn new(dispatcher: &EventDispatcher) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            subscriptions: Vec::new(),
        }
    }

    pub fn on<F>(&mut self, event: &str, handler: F) -> &Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let sub = self.dispatcher.on(event, handler);
        self.subscriptions.push(sub);
        &self.subscriptions[self.subscriptions.len() - 1]
    }

    pub fn on_chat_event<F>(&mut self, kind: ChatEventKind, handler: F) -> &Subscription
    where
        F: Fn(ChatEvent) + Send + Sync + 'static,
    {
        let sub = self.dispatcher.on_chat_event(kind, handler);
        self.subscriptions.push(sub);
        &self.subscriptions[self.subscriptions.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Unregister every handler added through this scope
    pub fn dispose(&mut self) {
        for sub in self.subscriptions.drain(..) {
            self.dispatcher.off(&sub);
        }
    }
}

impl Drop for ListenerScope {
    fn drop(&mut self) {
        self.dispose();
    }
}
