use super::error::{map_request_error, ApiError};
use super::logging::emit_debug_payload;
use crate::config::Config;
use crate::types::{
    Attachment, AttachmentEnvelope, AttachmentRequest, AuthSession, Chat, ChatEnvelope,
    ChatListEnvelope, ChatSummary, ErrorBody, Feedback, FeedbackRequest, LoginRequest,
    SendMessageRequest, TranscriptEnvelope, Turn,
};
use crate::util::join_api_url;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

const AUTH_HEADER: &str = "X-Auth-Token";

/// The four remote operations a conversation session depends on.
///
/// `ChatClient` talks HTTP; tests substitute `MockBackend`.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Opens the reply stream for one user message. Resolves once response
    /// headers arrive; a non-success status is an error here, not a stream event.
    async fn open_stream(&self, chat_id: &str, message: &str) -> Result<ByteStream, ApiError>;

    async fn fetch_transcript(&self, chat_id: &str) -> Result<Vec<Turn>, ApiError>;

    /// `Ok(None)` when the service has nothing to attach for this turn.
    async fn fetch_attachment(
        &self,
        chat_id: &str,
        turn_number: usize,
    ) -> Result<Option<Attachment>, ApiError>;

    async fn send_feedback(
        &self,
        chat_id: &str,
        message_id: &str,
        feedback: Feedback,
    ) -> Result<(), ApiError>;
}

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl ChatClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| ApiError::Request {
                url: config.api_url.clone(),
                source,
            })?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            auth_token: config.auth_token.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn has_auth_token(&self) -> bool {
        self.auth_token.is_some()
    }

    pub async fn login(&self, email: &str) -> Result<AuthSession, ApiError> {
        self.request_json(Method::POST, "auth/login/", Some(&LoginRequest { email }))
            .await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>, ApiError> {
        let envelope: ChatListEnvelope = self
            .request_json(Method::GET, "chats/", None::<&()>)
            .await?;
        Ok(envelope.chats)
    }

    pub async fn create_chat(&self, message: &str) -> Result<Chat, ApiError> {
        let envelope: ChatEnvelope = self
            .request_json(Method::POST, "chats/", Some(&SendMessageRequest { message }))
            .await?;
        Ok(envelope.chat)
    }

    fn url(&self, path: &str) -> String {
        join_api_url(&self.api_url, &format!("api/{path}"))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self
            .http
            .request(method, url)
            .header("content-type", "application/json");
        if let Some(token) = &self.auth_token {
            request = request.header(AUTH_HEADER, token);
        }
        request
    }

    /// Sends a bounded request and decodes the JSON body.
    async fn request_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned + Send,
    {
        let url = self.url(path);
        let mut request = self
            .request(method.clone(), &url)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            emit_debug_payload(method.as_str(), &url, body);
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| map_request_error(error, &url))?;
        let response = ensure_success(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|error| map_request_error(error, &url))
    }
}

#[async_trait]
impl ChatBackend for ChatClient {
    async fn open_stream(&self, chat_id: &str, message: &str) -> Result<ByteStream, ApiError> {
        let url = self.url(&format!("chats/{chat_id}/send/"));
        let payload = SendMessageRequest { message };
        emit_debug_payload("POST", &url, &payload);

        // No timeout: the reply runs until done, error, cancellation or close.
        let response = self
            .request(Method::POST, &url)
            .header("accept", "text/event-stream")
            .json(&payload)
            .send()
            .await
            .map_err(|error| map_request_error(error, &url))?;
        let response = ensure_success(response).await?;

        let stream = response
            .bytes_stream()
            .map(move |item| item.map_err(|error| map_request_error(error, &url)));
        Ok(Box::pin(stream))
    }

    async fn fetch_transcript(&self, chat_id: &str) -> Result<Vec<Turn>, ApiError> {
        let envelope: TranscriptEnvelope = self
            .request_json(Method::GET, &format!("chats/{chat_id}/"), None::<&()>)
            .await?;
        Ok(envelope.chat.messages)
    }

    async fn fetch_attachment(
        &self,
        chat_id: &str,
        turn_number: usize,
    ) -> Result<Option<Attachment>, ApiError> {
        let envelope: AttachmentEnvelope = self
            .request_json(
                Method::POST,
                &format!("chats/{chat_id}/ad/"),
                Some(&AttachmentRequest { turn_number }),
            )
            .await?;
        Ok(envelope.ad)
    }

    async fn send_feedback(
        &self,
        chat_id: &str,
        message_id: &str,
        feedback: Feedback,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .request_json(
                Method::POST,
                &format!("chats/{chat_id}/feedback/"),
                Some(&FeedbackRequest {
                    message_id,
                    feedback,
                }),
            )
            .await?;
        Ok(())
    }
}

/// Converts a non-success response into `ApiError::Status`, preferring the
/// server's `{ "error": ... }` message.
async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let server_message = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.error);
    Err(ApiError::from_status(status, server_message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(api_url: &str) -> ChatClient {
        let config = Config {
            api_url: api_url.to_string(),
            ..Config::default()
        };
        ChatClient::new(&config).expect("client should build")
    }

    #[test]
    fn test_url_prefixes_api_path() {
        let client = client_for("http://localhost:8000/");
        assert_eq!(
            client.url("chats/abc/send/"),
            "http://localhost:8000/api/chats/abc/send/"
        );
    }

    #[test]
    fn test_with_auth_token_sets_token() {
        let client = client_for("http://localhost:8000");
        assert!(!client.has_auth_token());
        assert!(client.with_auth_token("tok").has_auth_token());
    }
}
