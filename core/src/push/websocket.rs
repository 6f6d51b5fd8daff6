/// WebSocket transport for the push hub
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::push::connection::{PushSession, PushTransport};
use crate::push::dispatcher::PushEvent;
use crate::push::protocol::{self, HubMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep_until, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens hub sessions over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    handshake_timeout: Duration,
    keepalive_interval: Duration,
    server_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.push_url.clone(),
            handshake_timeout: config.handshake_timeout,
            keepalive_interval: config.keepalive_interval,
            server_timeout: config.server_timeout,
        }
    }

    /// Push URL with the bearer token as `access_token`
    pub fn connect_url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}access_token={}",
                    self.url,
                    sep,
                    urlencoding::encode(token)
                )
            }
            None => self.url.clone(),
        }
    }

    async fn open(&self, url: &str) -> Result<WebSocketSession> {
        let (mut stream, _) = connect_async(url)
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to connect to {}: {}", self.url, e)))?;

        let handshake = protocol::handshake_request()?;
        stream
            .send(WsMessage::Text(handshake.into()))
            .await
            .map_err(|e| ChatError::Transport(format!("Failed to send handshake: {}", e)))?;

        let reply = loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => break text.as_str().to_string(),
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(ChatError::Handshake(
                        "connection closed during handshake".to_string(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ChatError::Transport(e.to_string())),
            }
        };
        let rest = protocol::parse_handshake_response(&reply)?.to_string();

        let mut keepalive = interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session = WebSocketSession {
            stream,
            pending: VecDeque::new(),
            partial: String::new(),
            keepalive,
            last_seen: Instant::now(),
            server_timeout: self.server_timeout,
            closed: None,
        };
        session.absorb_text(&rest);
        Ok(session)
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, token: Option<String>) -> Result<Box<dyn PushSession>> {
        let url = self.connect_url(token.as_deref());
        let session = timeout(self.handshake_timeout, self.open(&url))
            .await
            .map_err(|_| ChatError::Timeout(format!("handshake with {} timed out", self.url)))??;
        info!("Push session open on {}", self.url);
        Ok(Box::new(session))
    }
}

/// Server-initiated close
#[derive(Debug)]
struct CloseNotice {
    error: Option<String>,
}

struct WebSocketSession {
    stream: WsStream,
    pending: VecDeque<PushEvent>,
    partial: String,
    keepalive: Interval,
    last_seen: Instant,
    server_timeout: Duration,
    closed: Option<CloseNotice>,
}

impl WebSocketSession {
    /// Parse frames out of a text payload, queueing invocations
    fn absorb_text(&mut self, text: &str) {
        self.partial.push_str(text);
        let buffer = std::mem::take(&mut self.partial);
        let (frames, rest) = protocol::split_frames(&buffer);
        for frame in frames {
            match HubMessage::from_frame(frame) {
                Ok(HubMessage::Invocation { target, arguments }) => {
                    self.pending.push_back(PushEvent::new(target, arguments));
                }
                Ok(HubMessage::Ping) => {}
                Ok(HubMessage::Close { error, .. }) => {
                    self.closed = Some(CloseNotice { error });
                }
                Ok(HubMessage::Other(kind)) => debug!("Ignoring hub message type {}", kind),
                Err(e) => warn!("Skipping malformed hub frame: {}", e),
            }
        }
        self.partial = rest.to_string();
    }
}

#[async_trait]
impl PushSession for WebSocketSession {
    async fn next_event(&mut self) -> Result<Option<PushEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if let Some(notice) = self.closed.take() {
                return match notice.error {
                    Some(error) => Err(ChatError::Transport(format!("server closed: {}", error))),
                    None => Ok(None),
                };
            }

            let deadline = self.last_seen + self.server_timeout;
            tokio::select! {
                _ = self.keepalive.tick() => {
                    let ping = HubMessage::Ping.to_frame()?;
                    self.stream
                        .send(WsMessage::Text(ping.into()))
                        .await
                        .map_err(|e| ChatError::Transport(format!("Failed to send ping: {}", e)))?;
                }
                _ = sleep_until(deadline) => {
                    return Err(ChatError::Timeout(format!(
                        "no frames from server for {:?}",
                        self.server_timeout
                    )));
                }
                frame = self.stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.last_seen = Instant::now();
                        self.absorb_text(text.as_str());
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => self.last_seen = Instant::now(),
                    Some(Err(e)) => return Err(ChatError::Transport(e.to_string())),
                },
            }
        }
    }

    async fn close(&mut self) {
        if let Ok(frame) = (HubMessage::Close { error: None, allow_reconnect: false }).to_frame() {
            let _ = self.stream.send(WsMessage::Text(frame.into())).await;
        }
        let _ = self.stream.close(None).await;
    }
}
