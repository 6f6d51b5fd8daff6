//! Shared fakes for integration tests: an in-memory chat server (pages,
//! send/edit/delete) and a scripted push transport.
#![allow(dead_code)]

use async_trait::async_trait;
use chatsync_core::api::{ChatApi, PageFetcher, SendRequest};
use chatsync_core::error::{ChatError, Result};
use chatsync_core::messenger_types::{
    DeliveryState, Message, MessagePage, PageAnchor, PageRequest,
};
use chatsync_core::push::{PushEvent, PushSession, PushTransport, TokenProvider};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

pub const CONV: &str = "conv-1";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn msg(id: &str, secs: i64) -> Message {
    Message {
        message_id: id.to_string(),
        conversation_id: CONV.to_string(),
        sender_id: "alice".to_string(),
        body: format!("hello from {}", id),
        attachments: Vec::new(),
        created_at: at(secs),
        updated_at: None,
        deleted_at: None,
        delivery: DeliveryState::Confirmed,
    }
}

/// `m1` newest ... `m{n}` oldest
pub fn numbered(n: usize) -> Vec<Message> {
    (1..=n)
        .map(|k| msg(&format!("m{}", k), 10_000 - k as i64))
        .collect()
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.message_id.clone()).collect()
}

pub fn push_event(name: &str, message: &Message) -> PushEvent {
    PushEvent::new(name, vec![serde_json::to_value(message).unwrap()])
}

/// Let spawned tasks run until `cond` holds. Sleeps rather than yields so
/// a paused clock can advance.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// A gate that can hold calls until released
#[derive(Default)]
struct Gate {
    held: Mutex<Option<Arc<Semaphore>>>,
}

impl Gate {
    fn hold(&self) {
        *self.held.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    fn release_one(&self) {
        if let Some(sem) = self.held.lock().unwrap().as_ref() {
            sem.add_permits(1);
        }
    }

    fn open(&self) {
        if let Some(sem) = self.held.lock().unwrap().take() {
            sem.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    async fn pass(&self) {
        let sem = self.held.lock().unwrap().clone();
        if let Some(sem) = sem {
            sem.acquire().await.unwrap().forget();
        }
    }
}

/// In-memory server for one conversation. Cursors are message ids.
#[derive(Default)]
pub struct FakeServer {
    /// Oldest first
    log: Mutex<Vec<Message>>,
    requests: Mutex<Vec<PageRequest>>,
    sends: Mutex<Vec<SendRequest>>,
    fetch_failures: AtomicUsize,
    /// 1-based positions in `requests` that fail
    failing_requests: Mutex<HashSet<usize>>,
    send_failures: AtomicUsize,
    no_echo: AtomicBool,
    fetch_gate: Gate,
    send_gate: Gate,
    next_server_id: AtomicUsize,
}

impl FakeServer {
    pub fn with_messages(messages: Vec<Message>) -> Arc<Self> {
        let server = Self::default();
        for m in messages {
            server.insert(m);
        }
        Arc::new(server)
    }

    /// A message created on the server side (not through this client)
    pub fn insert(&self, message: Message) {
        let mut log = self.log.lock().unwrap();
        log.push(message);
        log.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<SendRequest> {
        self.sends.lock().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Option<Message> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.message_id == id)
            .cloned()
    }

    pub fn fail_fetches(&self, n: usize) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the n-th page request counted from the first one
    pub fn fail_request(&self, n: usize) {
        self.failing_requests.lock().unwrap().insert(n);
    }

    pub fn fail_sends(&self, n: usize) {
        self.send_failures.store(n, Ordering::SeqCst);
    }

    /// Send responses carry no body; confirmation only via push
    pub fn set_no_echo(&self, no_echo: bool) {
        self.no_echo.store(no_echo, Ordering::SeqCst);
    }

    pub fn hold_fetches(&self) {
        self.fetch_gate.hold();
    }

    pub fn release_fetch(&self) {
        self.fetch_gate.release_one();
    }

    pub fn open_fetches(&self) {
        self.fetch_gate.open();
    }

    pub fn hold_sends(&self) {
        self.send_gate.hold();
    }

    pub fn open_sends(&self) {
        self.send_gate.open();
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn page(&self, request: &PageRequest) -> MessagePage {
        let log = self.log.lock().unwrap();
        let limit = request.limit;
        let position = |id: &str| log.iter().position(|m| m.message_id == id);

        let (start, end) = match &request.anchor {
            PageAnchor::Newest => (log.len().saturating_sub(limit), log.len()),
            PageAnchor::Before(cursor) => {
                let end = position(cursor).unwrap_or(0);
                (end.saturating_sub(limit), end)
            }
            PageAnchor::After(cursor) => {
                let start = position(cursor).map(|i| i + 1).unwrap_or(log.len());
                (start, (start + limit).min(log.len()))
            }
        };

        let mut items: Vec<Message> = log[start..end].to_vec();
        let prev_cursor = items.first().map(|m| m.message_id.clone());
        let next_cursor = items.last().map(|m| m.message_id.clone());
        let has_prev = start > 0 && !items.is_empty();
        let has_next = end < log.len() && !items.is_empty();
        // wire order is newest first
        items.reverse();
        MessagePage {
            items,
            next_cursor,
            prev_cursor,
            has_next,
            has_prev,
        }
    }
}

#[async_trait]
impl PageFetcher for FakeServer {
    async fn fetch_page(&self, request: PageRequest) -> Result<MessagePage> {
        let number = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        self.fetch_gate.pass().await;
        let scheduled = self.failing_requests.lock().unwrap().remove(&number);
        if scheduled || Self::take_failure(&self.fetch_failures) {
            return Err(ChatError::Http("503 upstream unavailable".to_string()));
        }
        Ok(self.page(&request))
    }
}

#[async_trait]
impl ChatApi for FakeServer {
    async fn send_message(&self, request: SendRequest) -> Result<Option<Message>> {
        self.sends.lock().unwrap().push(request.clone());
        self.send_gate.pass().await;
        if Self::take_failure(&self.send_failures) {
            return Err(ChatError::Api {
                status: 500,
                message: "send failed".to_string(),
            });
        }

        let message_id = request.message_id.clone().unwrap_or_else(|| {
            format!("srv-{}", self.next_server_id.fetch_add(1, Ordering::SeqCst) + 1)
        });
        let message = Message {
            message_id,
            conversation_id: request.conversation_id,
            sender_id: "me".to_string(),
            body: request.text,
            attachments: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
            delivery: DeliveryState::Confirmed,
        };
        self.insert(message.clone());

        if self.no_echo.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            Ok(Some(message))
        }
    }

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<Option<Message>> {
        let mut log = self.log.lock().unwrap();
        let message = log
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| ChatError::Api {
                status: 404,
                message: "not found".to_string(),
            })?;
        message.body = text.to_string();
        message.updated_at = Some(Utc::now());
        Ok(Some(message.clone()))
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        let message = log
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| ChatError::Api {
                status: 404,
                message: "not found".to_string(),
            })?;
        message.deleted_at = Some(Utc::now());
        Ok(())
    }
}

/// Hands out `token-1`, `token-2`, ... and counts calls
#[derive(Default)]
pub struct CountingTokens {
    calls: AtomicUsize,
}

impl CountingTokens {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for CountingTokens {
    async fn token(&self) -> Option<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Some(format!("token-{}", n))
    }
}

/// What a scripted session does next
pub enum SessionInput {
    Event(PushEvent),
    /// Transport error
    Fail,
    /// Server closed the session
    Close,
}

/// Push transport whose connect attempts succeed or fail from a script.
/// With the script empty, attempts fail.
#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<bool>>,
    attempts: Mutex<Vec<(Instant, Option<String>)>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<SessionInput>>>,
    closed: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn scripted(outcomes: &[bool]) -> Arc<Self> {
        let transport = Self::default();
        transport.script.lock().unwrap().extend(outcomes.iter().copied());
        Arc::new(transport)
    }

    pub fn script(&self, outcomes: &[bool]) {
        self.script.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    pub fn attempt_tokens(&self) -> Vec<Option<String>> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, token)| token.clone())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn sessions_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Feed the most recently opened session
    pub fn send(&self, input: SessionInput) {
        let sessions = self.sessions.lock().unwrap();
        let tx = sessions.last().expect("no session opened");
        let _ = tx.send(input);
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn PushSession>> {
        self.attempts.lock().unwrap().push((Instant::now(), token));
        let accept = self.script.lock().unwrap().pop_front().unwrap_or(false);
        if !accept {
            return Err(ChatError::Transport("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().push(tx);
        Ok(Box::new(FakeSession {
            rx,
            closed: self.closed.clone(),
        }))
    }
}

struct FakeSession {
    rx: mpsc::UnboundedReceiver<SessionInput>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl PushSession for FakeSession {
    async fn next_event(&mut self) -> Result<Option<PushEvent>> {
        match self.rx.recv().await {
            Some(SessionInput::Event(event)) => Ok(Some(event)),
            Some(SessionInput::Fail) => Err(ChatError::Transport("connection reset".to_string())),
            Some(SessionInput::Close) | None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
