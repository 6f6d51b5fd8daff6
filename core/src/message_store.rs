/// Message store: the materialized message sequence of one conversation
///
/// Three sources feed it: the initial page, older/newer pages, and live
/// push events. Every change rebuilds the sequence through the same
/// merge-by-id, so any interleaving of pages and events leaves one entry
/// per message id, sorted by `created_at`.
use crate::api::PageFetcher;
use crate::config::DEFAULT_PAGE_SIZE;
use crate::error::Result;
use crate::messenger_types::{
    CursorPair, DeliveryState, Message, MessagePage, PageAnchor, PageRequest, SortDirection,
};
use crate::push::dispatcher::ChatEvent;
use crate::utils::event_emitter::{EventEmitter, StoreChange};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Kind of paged fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Initial,
    Older,
    Newer,
}

/// Fetch state machine: at most one fetch in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Fetching(FetchKind),
}

/// Result of a load call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Page merged; `added` new entries
    Applied { added: usize },
    /// Nothing to do (no cursor, or the same fetch is already in flight)
    Skipped,
    /// Queued behind the fetch in flight; its caller runs it next
    Queued,
    /// Result arrived after teardown or a conversation switch and was dropped
    Discarded,
}

/// Merge incoming messages into an existing sequence by id, then sort.
///
/// Existing entries keep their identity and absorb the incoming content.
pub fn merge_messages(
    existing: &[Message],
    incoming: Vec<Message>,
    direction: SortDirection,
) -> Vec<Message> {
    let mut merged: Vec<Message> = existing.to_vec();
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, m)| (m.message_id.clone(), i))
        .collect();

    for message in incoming {
        match index.get(&message.message_id) {
            Some(&i) => merged[i].absorb(message),
            None => {
                index.insert(message.message_id.clone(), merged.len());
                merged.push(message);
            }
        }
    }

    merged.sort_by(|a, b| direction.compare(a, b));
    merged
}

#[derive(Debug, Clone)]
struct FetchTicket {
    kind: FetchKind,
    generation: u64,
    request: PageRequest,
}

impl FetchTicket {
    fn follow(&self, anchor: PageAnchor) -> Self {
        Self {
            kind: self.kind,
            generation: self.generation,
            request: PageRequest {
                anchor,
                ..self.request.clone()
            },
        }
    }
}

enum Admission {
    Start(FetchTicket),
    Queued,
    Skipped,
}

#[derive(Debug, Default)]
struct QueuedIntents {
    older: bool,
    newer: bool,
}

impl QueuedIntents {
    fn set(&mut self, kind: FetchKind) {
        match kind {
            FetchKind::Older => self.older = true,
            FetchKind::Newer => self.newer = true,
            FetchKind::Initial => {}
        }
    }

    fn take(&mut self, kind: FetchKind) -> bool {
        match kind {
            FetchKind::Older => std::mem::take(&mut self.older),
            FetchKind::Newer => std::mem::take(&mut self.newer),
            FetchKind::Initial => false,
        }
    }
}

struct StoreState {
    conversation_id: Option<String>,
    /// Bumped on every conversation switch; stale fetch results compare against it
    generation: u64,
    direction: SortDirection,
    page_size: usize,
    messages: Vec<Message>,
    cursors: CursorPair,
    fetch: FetchState,
    queued: QueuedIntents,
    /// Live messages applied while the initial page was in flight
    live_during_initial: HashSet<String>,
    closed: bool,
    emitter: EventEmitter,
}

impl StoreState {
    fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.message_id == message_id)
    }

    fn accepts(&self, message: &Message) -> bool {
        !self.closed && self.conversation_id.as_deref() == Some(message.conversation_id.as_str())
    }

    fn switch_to(&mut self, conversation_id: &str) {
        self.generation += 1;
        self.conversation_id = Some(conversation_id.to_string());
        self.messages = Vec::new();
        self.cursors = CursorPair::default();
        self.queued = QueuedIntents::default();
        self.live_during_initial.clear();
        self.emitter.set_conversation(conversation_id);
        self.emitter.emit(StoreChange::Reset { len: 0 });
    }

    fn ticket(&self, kind: FetchKind) -> Option<FetchTicket> {
        let conversation_id = self.conversation_id.clone()?;
        let anchor = match kind {
            FetchKind::Initial => PageAnchor::Newest,
            FetchKind::Older => PageAnchor::Before(self.cursors.prev.clone()?),
            // no newer cursor: re-read the newest page and merge it
            FetchKind::Newer => self
                .cursors
                .next
                .clone()
                .map(PageAnchor::After)
                .unwrap_or(PageAnchor::Newest),
        };
        Some(FetchTicket {
            kind,
            generation: self.generation,
            request: PageRequest {
                conversation_id,
                limit: self.page_size,
                anchor,
            },
        })
    }

    fn admit(&mut self, kind: FetchKind) -> Admission {
        if self.closed || self.conversation_id.is_none() {
            return Admission::Skipped;
        }
        match self.fetch {
            FetchState::Idle => match self.ticket(kind) {
                Some(ticket) => {
                    self.fetch = FetchState::Fetching(kind);
                    Admission::Start(ticket)
                }
                None => Admission::Skipped,
            },
            FetchState::Fetching(current) if current == kind => Admission::Skipped,
            FetchState::Fetching(FetchKind::Initial) if kind == FetchKind::Newer => {
                Admission::Skipped
            }
            FetchState::Fetching(_) => {
                self.queued.set(kind);
                Admission::Queued
            }
        }
    }

    /// Leave the fetch state and pick the next queued intent, if any
    fn next_queued(&mut self) -> Option<FetchTicket> {
        self.fetch = FetchState::Idle;
        if self.closed {
            self.queued = QueuedIntents::default();
            return None;
        }
        for kind in [FetchKind::Newer, FetchKind::Older] {
            if self.queued.take(kind) {
                if let Some(ticket) = self.ticket(kind) {
                    self.fetch = FetchState::Fetching(kind);
                    return Some(ticket);
                }
            }
        }
        None
    }

    /// Merge one page; returns a follow-up ticket when the same fetch has
    /// to continue (forward to the live edge, or down into a gap)
    fn apply_page(
        &mut self,
        ticket: &FetchTicket,
        page: MessagePage,
    ) -> (FetchOutcome, Option<FetchTicket>) {
        let before = self.messages.len();
        let (next, prev) = (page.next(), page.prev());
        let conversation_id = ticket.request.conversation_id.as_str();
        let items: Vec<Message> = page
            .items
            .into_iter()
            .filter(|m| {
                let ours = m.conversation_id == conversation_id;
                if !ours {
                    warn!(
                        "Page for {} contained message {} of {}",
                        conversation_id, m.message_id, m.conversation_id
                    );
                }
                ours
            })
            .collect();

        match ticket.kind {
            FetchKind::Initial => {
                // unconfirmed local sends and live arrivals survive the replace
                let keep: Vec<Message> = self
                    .messages
                    .iter()
                    .filter(|m| !m.is_sent() || self.live_during_initial.contains(&m.message_id))
                    .cloned()
                    .collect();
                self.messages = merge_messages(&keep, items, self.direction);
                self.cursors = CursorPair { next, prev };
                self.live_during_initial.clear();
                let len = self.messages.len();
                self.emitter.emit(StoreChange::Reset { len });
                (FetchOutcome::Applied { added: len }, None)
            }
            FetchKind::Older => {
                self.messages = merge_messages(&self.messages, items, self.direction);
                self.cursors.prev = prev;
                let added = self.messages.len().saturating_sub(before);
                self.emitter.emit(StoreChange::Older { added });
                (FetchOutcome::Applied { added }, None)
            }
            FetchKind::Newer => {
                let had_history = self.messages.iter().any(|m| m.is_sent());
                let overlaps = items.iter().any(|m| {
                    self.position(&m.message_id)
                        .map(|i| self.messages[i].is_sent())
                        .unwrap_or(false)
                });
                self.messages = merge_messages(&self.messages, items, self.direction);

                let follow = match &ticket.request.anchor {
                    PageAnchor::After(_) => {
                        // keep paging forward until the live edge
                        self.cursors.next = next.clone();
                        next.map(PageAnchor::After)
                    }
                    PageAnchor::Newest => {
                        self.cursors.next = next;
                        if !had_history {
                            self.cursors.prev = prev;
                            None
                        } else if overlaps {
                            None
                        } else {
                            // newest page does not reach the window: fill the gap below it
                            prev.map(PageAnchor::Before)
                        }
                    }
                    PageAnchor::Before(_) if overlaps => None,
                    PageAnchor::Before(_) => prev.map(PageAnchor::Before),
                };

                let added = self.messages.len().saturating_sub(before);
                self.emitter.emit(StoreChange::Newer { added });
                (
                    FetchOutcome::Applied { added },
                    follow.map(|anchor| ticket.follow(anchor)),
                )
            }
        }
    }

    fn set_delivery(&mut self, message_id: &str, from: DeliveryState, to: DeliveryState) -> bool {
        let Some(i) = self.position(message_id) else {
            return false;
        };
        if self.messages[i].delivery != from {
            return false;
        }
        let mut rebuilt = self.messages.clone();
        rebuilt[i].delivery = to;
        self.messages = rebuilt;
        self.emitter.emit(StoreChange::Updated {
            message_id: message_id.to_string(),
        });
        true
    }
}

/// Ordered, deduplicated message sequence for one conversation
#[derive(Clone)]
pub struct MessageStore {
    state: Arc<Mutex<StoreState>>,
    fetcher: Arc<dyn PageFetcher>,
}

impl MessageStore {
    /// Newest-first store with the standard page size
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self::with_options(fetcher, SortDirection::NewestFirst, DEFAULT_PAGE_SIZE)
    }

    pub fn with_options(
        fetcher: Arc<dyn PageFetcher>,
        direction: SortDirection,
        page_size: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                conversation_id: None,
                generation: 0,
                direction,
                page_size: page_size.max(1),
                messages: Vec::new(),
                cursors: CursorPair::default(),
                fetch: FetchState::Idle,
                queued: QueuedIntents::default(),
                live_during_initial: HashSet::new(),
                closed: false,
                emitter: EventEmitter::new(String::new()),
            })),
            fetcher,
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.state().conversation_id.clone()
    }

    pub fn direction(&self) -> SortDirection {
        self.state().direction
    }

    /// Snapshot of the materialized sequence
    pub fn messages(&self) -> Vec<Message> {
        self.state().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().messages.is_empty()
    }

    pub fn get(&self, message_id: &str) -> Option<Message> {
        let state = self.state();
        state
            .position(message_id)
            .map(|i| state.messages[i].clone())
    }

    pub fn cursors(&self) -> CursorPair {
        self.state().cursors.clone()
    }

    pub fn fetch_state(&self) -> FetchState {
        self.state().fetch
    }

    /// More history can be paged in
    pub fn has_older(&self) -> bool {
        self.state().cursors.prev.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Change notifications for whoever renders this store
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.state().emitter.subscribe()
    }

    /// Fetch the newest page and replace the sequence.
    ///
    /// Switching to another conversation resets cursors and drops results
    /// still in flight for the old one. For the same conversation a call
    /// while any fetch is in flight is a no-op.
    pub async fn load_initial(&self, conversation_id: &str) -> Result<FetchOutcome> {
        let ticket = {
            let mut state = self.state();
            if state.closed {
                return Ok(FetchOutcome::Skipped);
            }
            let same = state.conversation_id.as_deref() == Some(conversation_id);
            if same && state.fetch != FetchState::Idle {
                debug!("load_initial({}) ignored: fetch in flight", conversation_id);
                return Ok(FetchOutcome::Skipped);
            }
            if !same {
                info!("Message store switching to conversation {}", conversation_id);
                state.switch_to(conversation_id);
            }
            state.fetch = FetchState::Fetching(FetchKind::Initial);
            state.live_during_initial.clear();
            match state.ticket(FetchKind::Initial) {
                Some(ticket) => ticket,
                None => {
                    state.fetch = FetchState::Idle;
                    return Ok(FetchOutcome::Skipped);
                }
            }
        };
        self.drive(ticket).await
    }

    /// Page in messages older than the `prev` cursor
    pub async fn load_older(&self) -> Result<FetchOutcome> {
        self.load(FetchKind::Older).await
    }

    /// Page in messages newer than the `next` cursor (pull-to-refresh,
    /// reconnection catch-up). Without a `next` cursor the newest page is
    /// fetched again and merged.
    pub async fn load_newer(&self) -> Result<FetchOutcome> {
        self.load(FetchKind::Newer).await
    }

    async fn load(&self, kind: FetchKind) -> Result<FetchOutcome> {
        let admission = self.state().admit(kind);
        match admission {
            Admission::Start(ticket) => self.drive(ticket).await,
            Admission::Queued => {
                debug!("{:?} fetch queued behind the one in flight", kind);
                Ok(FetchOutcome::Queued)
            }
            Admission::Skipped => Ok(FetchOutcome::Skipped),
        }
    }

    /// Run a fetch, then whatever got queued while it was in flight
    async fn drive(&self, ticket: FetchTicket) -> Result<FetchOutcome> {
        let (outcome, mut next) = self.execute(ticket).await?;
        while let Some(ticket) = next {
            let kind = ticket.kind;
            match self.execute(ticket).await {
                Ok((_, queued)) => next = queued,
                Err(e) => {
                    // already reported through FetchFailed
                    debug!("Queued {:?} fetch failed: {}", kind, e);
                    break;
                }
            }
        }
        Ok(outcome)
    }

    /// One fetch, possibly spanning several pages
    async fn execute(
        &self,
        mut ticket: FetchTicket,
    ) -> Result<(FetchOutcome, Option<FetchTicket>)> {
        let mut added = 0;
        loop {
            debug!("Fetching {:?} page: {:?}", ticket.kind, ticket.request.anchor);
            let result = self.fetcher.fetch_page(ticket.request.clone()).await;

            let follow = {
                let mut state = self.state();
                if state.generation != ticket.generation {
                    debug!("Dropping {:?} page for a previous conversation", ticket.kind);
                    return Ok((FetchOutcome::Discarded, None));
                }
                if state.closed {
                    state.fetch = FetchState::Idle;
                    state.queued = QueuedIntents::default();
                    debug!("Dropping {:?} page: store closed", ticket.kind);
                    return Ok((FetchOutcome::Discarded, None));
                }

                match result {
                    Ok(page) => {
                        let (outcome, follow) = state.apply_page(&ticket, page);
                        if let FetchOutcome::Applied { added: n } = outcome {
                            added += n;
                        }
                        match follow {
                            Some(follow) => follow,
                            None => {
                                let next = state.next_queued();
                                return Ok((FetchOutcome::Applied { added }, next));
                            }
                        }
                    }
                    Err(e) => {
                        // cursors untouched; guard always cleared
                        state.fetch = FetchState::Idle;
                        state.queued = QueuedIntents::default();
                        warn!("{:?} fetch failed: {}", ticket.kind, e);
                        state.emitter.emit(StoreChange::FetchFailed {
                            kind: ticket.kind,
                            error: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            };
            ticket = follow;
        }
    }

    /// Merge one live or locally created message
    pub fn apply_created(&self, message: Message) -> bool {
        let mut state = self.state();
        if !state.accepts(&message) {
            debug!("Ignoring message {} for another conversation", message.message_id);
            return false;
        }
        let message_id = message.message_id.clone();
        let existed = state.position(&message_id).is_some();
        if state.fetch == FetchState::Fetching(FetchKind::Initial) {
            state.live_during_initial.insert(message_id.clone());
        }
        state.messages = merge_messages(&state.messages, vec![message], state.direction);

        if existed {
            state.emitter.emit(StoreChange::Updated { message_id });
        } else {
            let len = state.messages.len();
            let at_live_end = state.position(&message_id) == Some(state.direction.live_end(len));
            state.emitter.emit(StoreChange::Live {
                message_id,
                at_live_end,
            });
        }
        true
    }

    /// Overwrite an existing message with an edited payload
    pub fn apply_edited(&self, message: Message) -> bool {
        self.apply_update(message, false)
    }

    /// Mark an existing message deleted
    pub fn apply_deleted(&self, message: Message) -> bool {
        self.apply_update(message, true)
    }

    fn apply_update(&self, mut message: Message, deleted: bool) -> bool {
        let mut state = self.state();
        if !state.accepts(&message) {
            return false;
        }
        if state.position(&message.message_id).is_none() {
            debug!(
                "Dropping update for message {} not materialized yet",
                message.message_id
            );
            return false;
        }
        if deleted && message.deleted_at.is_none() {
            message.deleted_at = Some(Utc::now());
        }
        let message_id = message.message_id.clone();
        state.messages = merge_messages(&state.messages, vec![message], state.direction);
        state.emitter.emit(StoreChange::Updated { message_id });
        true
    }

    /// Route a decoded push event
    pub fn apply_event(&self, event: ChatEvent) -> bool {
        match event {
            ChatEvent::Created(m) => self.apply_created(m),
            ChatEvent::Edited(m) => self.apply_edited(m),
            ChatEvent::Deleted(m) => self.apply_deleted(m),
        }
    }

    /// Pending -> Failed; a message the server already confirmed stays confirmed
    pub fn mark_failed(&self, message_id: &str) -> bool {
        self.state()
            .set_delivery(message_id, DeliveryState::Pending, DeliveryState::Failed)
    }

    /// Failed -> Pending, before a retry
    pub fn mark_pending(&self, message_id: &str) -> bool {
        self.state()
            .set_delivery(message_id, DeliveryState::Failed, DeliveryState::Pending)
    }

    /// Drop a message from the sequence
    pub fn remove(&self, message_id: &str) -> Option<Message> {
        let mut state = self.state();
        let i = state.position(message_id)?;
        let mut rebuilt = state.messages.clone();
        let removed = rebuilt.remove(i);
        state.messages = rebuilt;
        state.emitter.emit(StoreChange::Removed {
            message_id: message_id.to_string(),
        });
        Some(removed)
    }

    /// Teardown: later fetch results and events are ignored
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.queued = QueuedIntents::default();
    }
}
