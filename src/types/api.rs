use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feedback {
    Like,
    Dislike,
}

impl Feedback {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Dislike => "dislike",
        }
    }
}

/// One user message or one assistant reply.
///
/// `id` is server-assigned once the transcript has been reconciled; before
/// that it is a provisional `local-…` id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

impl Turn {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            feedback: None,
        }
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: content.into(),
            feedback: None,
        }
    }
}

/// Sponsored content shown under a settled assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub advertiser: String,
    pub headline: String,
    pub description: String,
    #[serde(default)]
    pub cta_text: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub messages: Vec<Turn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthSession {
    pub email: String,
    pub token: String,
}

// Request bodies.

#[derive(Debug, Serialize)]
pub struct SendMessageRequest<'a> {
    pub message: &'a str,
}

#[derive(Debug, Serialize)]
pub struct FeedbackRequest<'a> {
    pub message_id: &'a str,
    pub feedback: Feedback,
}

#[derive(Debug, Serialize)]
pub struct AttachmentRequest {
    pub turn_number: usize,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
}

// Response envelopes.

#[derive(Debug, Deserialize)]
pub struct ChatEnvelope {
    pub chat: Chat,
}

#[derive(Debug, Deserialize)]
pub struct TranscriptEnvelope {
    pub chat: TranscriptBody,
}

#[derive(Debug, Deserialize)]
pub struct TranscriptBody {
    #[serde(default)]
    pub messages: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
pub struct ChatListEnvelope {
    #[serde(default)]
    pub chats: Vec<ChatSummary>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentEnvelope {
    #[serde(default)]
    pub ad: Option<Attachment>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

/// One decoded record of the reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    /// Terminal. The id may be empty; the transcript fetch supplies it later.
    Done(String),
    /// Terminal.
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// Raw JSON payload of a `data:` record. All fields are optional so that a
/// record can be classified after parsing rather than rejected by serde.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct StreamRecord {
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub done: Option<bool>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StreamRecord {
    pub(crate) fn into_event(self) -> Option<StreamEvent> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Some(StreamEvent::Error(error));
        }
        if self.done == Some(true) {
            return Some(StreamEvent::Done(self.message_id.unwrap_or_default()));
        }
        self.chunk
            .filter(|c| !c.is_empty())
            .map(StreamEvent::Chunk)
    }
}
