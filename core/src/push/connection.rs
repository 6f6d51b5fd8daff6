/// Push connection lifecycle: one authenticated, auto-reconnecting connection per process
use crate::config::Config;
use crate::error::Result;
use crate::push::dispatcher::{EventDispatcher, PushEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Connection state of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, no attempt in progress
    Disconnected,
    /// First connect attempt in progress
    Connecting,
    /// Handshake done, events flowing
    Connected,
    /// Connection dropped, backoff loop running
    Reconnecting,
}

/// Supplies the bearer token; called fresh before every attempt
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// Fixed token, for tools and tests
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Opens push sessions
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open and authenticate one session
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn PushSession>>;
}

/// One open push session
#[async_trait]
pub trait PushSession: Send {
    /// Next server event; `Ok(None)` once the server closed the session
    async fn next_event(&mut self) -> Result<Option<PushEvent>>;

    /// Close the session from our side
    async fn close(&mut self);
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before attempt N; the last entry repeats
    pub delays: Vec<Duration>,
    /// Attempts per reconnection cycle (None = unbounded)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delays: config.reconnect_delays.clone(),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Walks the reconnect schedule
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            delays: policy.delays.clone(),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, clamped to the last scheduled value
    pub fn next_delay(&mut self) -> Duration {
        let idx = (self.attempt as usize).min(self.delays.len().saturating_sub(1));
        self.attempt += 1;
        self.delays.get(idx).copied().unwrap_or_default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub type RecoveryCallback = Arc<dyn Fn() + Send + Sync>;

/// Token for a registered recovery callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoveryHandle(u64);

#[derive(Default)]
struct RecoveryRegistry {
    next_id: u64,
    callbacks: Vec<(u64, RecoveryCallback)>,
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    transport: Arc<dyn PushTransport>,
    tokens: Arc<dyn TokenProvider>,
    policy: ReconnectPolicy,
    dispatcher: EventDispatcher,
    state: watch::Sender<ConnectionState>,
    recovery: Mutex<RecoveryRegistry>,
    lifecycle: tokio::sync::Mutex<Option<RunHandle>>,
}

/// Owns the process-wide push connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager; no connection is opened until `start`
    pub fn new(
        transport: Arc<dyn PushTransport>,
        tokens: Arc<dyn TokenProvider>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                tokens,
                policy,
                dispatcher: EventDispatcher::new(),
                state,
                recovery: Mutex::new(RecoveryRegistry::default()),
                lifecycle: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Event bus fed by this connection
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect. No-op unless currently `Disconnected`.
    ///
    /// A failed first attempt returns the error and leaves the state
    /// `Disconnected`; drops after that are handled by the backoff loop.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.state() != ConnectionState::Disconnected {
            debug!("start() ignored in state {:?}", self.state());
            return Ok(());
        }
        if let Some(old) = lifecycle.take() {
            // backoff loop gave up earlier; its task is done
            let _ = old.task.await;
        }

        self.inner.set_state(ConnectionState::Connecting);
        let token = self.inner.tokens.token().await;
        let session = match self.inner.transport.connect(token).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Push connection failed: {}", e);
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.inner.set_state(ConnectionState::Connected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.run(session, shutdown_rx).await });
        *lifecycle = Some(RunHandle { shutdown, task });
        Ok(())
    }

    /// Tear the connection down (logout). No-op when already stopped.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(handle) = lifecycle.take() else {
            return;
        };
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            warn!("Push connection task ended abnormally: {}", e);
        }
        if self.state() != ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Disconnected);
        }
        info!("Push connection stopped");
    }

    /// Foreground hint: try to reconnect if nothing is connected.
    ///
    /// Failures are logged and otherwise swallowed.
    pub fn resume_from_background(&self) {
        if self.state() != ConnectionState::Disconnected {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.start().await {
                debug!("Foreground reconnect failed: {}", e);
            }
        });
    }

    /// Register a callback run once each time a dropped connection comes back
    pub fn on_reconnected<F>(&self, callback: F) -> RecoveryHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = self.inner.recovery();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.callbacks.push((id, Arc::new(callback)));
        RecoveryHandle(id)
    }

    pub fn remove_recovery(&self, handle: RecoveryHandle) -> bool {
        let mut registry = self.inner.recovery();
        let before = registry.callbacks.len();
        registry.callbacks.retain(|(id, _)| *id != handle.0);
        registry.callbacks.len() != before
    }
}

impl ManagerInner {
    fn recovery(&self) -> MutexGuard<'_, RecoveryRegistry> {
        self.recovery.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!("Push connection {:?} -> {:?}", prev, next);
        }
    }

    fn fire_recovery(&self) {
        let callbacks: Vec<RecoveryCallback> = self
            .recovery()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        debug!("Running {} recovery callbacks", callbacks.len());
        for callback in callbacks {
            callback();
        }
    }

    /// Pump events from the session; on a drop, reconnect per policy
    async fn run(&self, mut session: Box<dyn PushSession>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    session.close().await;
                    return;
                }
                event = session.next_event() => match event {
                    Ok(Some(event)) => {
                        self.dispatcher.dispatch(&event);
                        continue;
                    }
                    Ok(None) => info!("Push connection closed by server"),
                    Err(e) => warn!("Push connection dropped: {}", e),
                },
            }

            self.set_state(ConnectionState::Reconnecting);
            match self.reconnect(&mut shutdown).await {
                Some(next) => {
                    session = next;
                    self.set_state(ConnectionState::Connected);
                    self.fire_recovery();
                }
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    /// Sequential attempts along the backoff schedule; None when retries
    /// are exhausted or a shutdown arrives
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Box<dyn PushSession>> {
        let mut backoff = Backoff::new(&self.policy);
        loop {
            if let Some(max) = self.policy.max_attempts {
                if backoff.attempts() >= max {
                    warn!("Giving up on push connection after {} attempts", max);
                    return None;
                }
            }

            let delay = backoff.next_delay();
            debug!("Reconnect attempt {} in {:?}", backoff.attempts(), delay);
            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = sleep(delay) => {}
            }

            let attempt = async {
                let token = self.tokens.token().await;
                self.transport.connect(token).await
            };
            let result = tokio::select! {
                _ = shutdown.changed() => return None,
                result = attempt => result,
            };
            match result {
                Ok(session) => {
                    info!("Push connection restored after {} attempts", backoff.attempts());
                    return Some(session);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", backoff.attempts(), e),
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("policy", &self.inner.policy)
            .finish()
    }
}
