//! reqwest implementation of [`ChatApi`]

use async_trait::async_trait;
use bookchat_transport::{Conversation, Message, Page};
use reqwest::multipart;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::api::{ChatApi, NewConversation, PageRequest, SendImage, SendText};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountBody {
    unread_count: u32,
}

/// HTTP client for the chat REST API
#[derive(Clone)]
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    bearer: Option<String>,
}

impl HttpChatApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            bearer: None,
        })
    }

    /// Attach a bearer token supplied by the identity provider
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => Err(SyncError::Conflict(body)),
            StatusCode::NOT_FOUND => Err(SyncError::NotFound(body)),
            _ => Err(SyncError::Http {
                status: status.as_u16(),
                body,
            }),
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = Self::check(req.send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn send_ok(&self, req: RequestBuilder) -> Result<()> {
        Self::check(req.send().await?).await?;
        Ok(())
    }
}

fn page_query(page: PageRequest) -> [(&'static str, String); 2] {
    [("page", page.page.to_string()), ("size", page.size.to_string())]
}

#[async_trait]
impl ChatApi for HttpChatApi {
    #[instrument(skip(self))]
    async fn list_conversations(
        &self,
        participant: &str,
        page: PageRequest,
    ) -> Result<Page<Conversation>> {
        let path = format!("/chat/conversations/participant/{}", participant);
        self.send_json(self.request(Method::GET, &path).query(&page_query(page)))
            .await
    }

    #[instrument(skip(self))]
    async fn list_messages(&self, conversation: &str, page: PageRequest) -> Result<Page<Message>> {
        let path = format!("/chat/conversations/{}/messages", conversation);
        self.send_json(self.request(Method::GET, &path).query(&page_query(page)))
            .await
    }

    async fn unread_count(&self, conversation: &str, participant: &str) -> Result<u32> {
        let path = format!("/chat/conversations/{}/unread-count", conversation);
        let body: UnreadCountBody = self
            .send_json(
                self.request(Method::GET, &path)
                    .query(&[("participantId", participant)]),
            )
            .await?;
        Ok(body.unread_count)
    }

    async fn mark_read(&self, conversation: &str, participant: &str) -> Result<()> {
        let path = format!("/chat/conversations/{}/read", conversation);
        debug!(conversation, participant, "Marking conversation read");
        self.send_ok(
            self.request(Method::PUT, &path)
                .query(&[("participantId", participant)]),
        )
        .await
    }

    async fn send_text(&self, request: SendText) -> Result<()> {
        self.send_ok(self.request(Method::POST, "/chat/messages").json(&request))
            .await
    }

    async fn send_image(&self, request: SendImage) -> Result<()> {
        let mime = mime_guess::from_path(&request.file_name).first_or_octet_stream();
        let part = multipart::Part::stream(request.data)
            .file_name(request.file_name)
            .mime_str(mime.essence_str())?;

        let mut form = multipart::Form::new()
            .text("conversationId", request.conversation_id)
            .text("senderId", request.sender_id)
            .part("imageFile", part);
        if let Some(caption) = request.caption {
            form = form.text("caption", caption);
        }

        self.send_ok(self.request(Method::POST, "/chat/messages/image").multipart(form))
            .await
    }

    async fn create_conversation(&self, request: NewConversation) -> Result<Conversation> {
        self.send_json(self.request(Method::POST, "/chat/conversations").json(&request))
            .await
    }

    async fn conversation_by_booking(&self, booking: &str) -> Result<Option<Conversation>> {
        let path = format!("/chat/conversations/booking/{}", booking);
        match self.send_json(self.request(Method::GET, &path)).await {
            Ok(conversation) => Ok(Some(conversation)),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
