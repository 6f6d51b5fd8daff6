/// REST collaborators: paged history fetch and send/edit/delete
///
/// Endpoints:
///   GET    {api}/conversations/:id/messages   ?limit=N&before=C | &after=C
///   POST   {api}/messages                     multipart: conversationId, text, messageId?, files*
///   PUT    {api}/messages/:id                 body: {"text":"..."}
///   DELETE {api}/messages/:id
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::messenger_types::{Message, MessagePage, PageAnchor, PageRequest};
use crate::push::connection::TokenProvider;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cursor-paginated history
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, request: PageRequest) -> Result<MessagePage>;
}

/// A file part of an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Arguments of the send endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub conversation_id: String,
    pub text: String,
    /// Client-generated id the server must reuse
    pub message_id: Option<String>,
    pub files: Vec<OutgoingFile>,
}

/// Message mutations
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Returns the created message when the server includes it in the response
    async fn send_message(&self, request: SendRequest) -> Result<Option<Message>>;

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<Option<Message>>;

    async fn delete_message(&self, message_id: &str) -> Result<()>;
}

#[derive(Serialize)]
struct EditBody<'a> {
    text: &'a str,
}

/// reqwest-backed implementation of both collaborators
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatApi {
    pub fn new(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Attach a fresh bearer token
    async fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.tokens.token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let response = self.authorized(builder).await.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        warn!("API request failed with {}: {}", status, message);
        Err(ChatError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Decode an optional message body
    async fn optional_message(response: Response) -> Result<Option<Message>> {
        let body = response.bytes().await?;
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }
}

/// Query pairs for one paged fetch (exactly one cursor at most)
pub fn page_query(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", request.limit.to_string())];
    match &request.anchor {
        PageAnchor::Newest => {}
        PageAnchor::Before(cursor) => query.push(("before", cursor.clone())),
        PageAnchor::After(cursor) => query.push(("after", cursor.clone())),
    }
    query
}

#[async_trait]
impl PageFetcher for HttpChatApi {
    async fn fetch_page(&self, request: PageRequest) -> Result<MessagePage> {
        let path = format!(
            "conversations/{}/messages",
            urlencoding::encode(&request.conversation_id)
        );
        debug!("Fetching page {:?} for {}", request.anchor, request.conversation_id);
        let builder = self.client.get(self.url(&path)).query(&page_query(&request));
        let response = self.execute(builder).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(&self, request: SendRequest) -> Result<Option<Message>> {
        let mut form = Form::new()
            .text("conversationId", request.conversation_id)
            .text("text", request.text);
        if let Some(id) = request.message_id {
            form = form.text("messageId", id);
        }
        for file in request.files {
            let mut part = Part::bytes(file.data.to_vec()).file_name(file.file_name);
            if let Some(content_type) = file.content_type {
                part = part.mime_str(&content_type).map_err(|e| {
                    ChatError::InvalidInput(format!("bad content type {}: {}", content_type, e))
                })?;
            }
            form = form.part("files", part);
        }

        let response = self
            .execute(self.client.post(self.url("messages")).multipart(form))
            .await?;
        Self::optional_message(response).await
    }

    async fn edit_message(&self, message_id: &str, text: &str) -> Result<Option<Message>> {
        let path = format!("messages/{}", urlencoding::encode(message_id));
        let response = self
            .execute(self.client.put(self.url(&path)).json(&EditBody { text }))
            .await?;
        Self::optional_message(response).await
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        let path = format!("messages/{}", urlencoding::encode(message_id));
        self.execute(self.client.delete(self.url(&path))).await?;
        Ok(())
    }
}
