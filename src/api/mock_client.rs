//! Scripted in-memory `ChatBackend` for driving a session without a server.

use crate::api::client::{ByteStream, ChatBackend};
use crate::api::error::ApiError;
use crate::types::{Attachment, Feedback, Turn};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// How one `open_stream` call responds.
pub enum ScriptedStream {
    /// Yields each string as one network chunk, then closes.
    Chunks(Vec<String>),
    /// Yields each string, then stays open until dropped.
    Hanging(Vec<String>),
    /// Yields whatever the test pushes through the paired sender.
    Manual(mpsc::UnboundedReceiver<String>),
    /// The request itself fails with this status and message.
    Rejected(StatusCode, String),
}

impl ScriptedStream {
    /// A stream that delivers `chunks` as separate `data:` records and ends
    /// with a `done` record for `message_id`.
    pub fn reply(chunks: &[&str], message_id: &str) -> Self {
        let mut records: Vec<String> = chunks.iter().map(|c| chunk_record(c)).collect();
        records.push(done_record(message_id));
        Self::Chunks(records)
    }

    pub fn manual() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::Manual(rx))
    }
}

pub fn chunk_record(text: &str) -> String {
    format!("data: {}\n\n", serde_json::json!({ "chunk": text }))
}

pub fn done_record(message_id: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "done": true, "message_id": message_id })
    )
}

pub fn error_record(message: &str) -> String {
    format!("data: {}\n\n", serde_json::json!({ "error": message }))
}

#[derive(Default)]
struct MockState {
    streams: VecDeque<ScriptedStream>,
    transcripts: VecDeque<Result<Vec<Turn>, (StatusCode, String)>>,
    attachments: VecDeque<Result<Option<Attachment>, (StatusCode, String)>>,
    attachment_delay: Option<Duration>,
    sent_messages: Vec<(String, String)>,
    attachment_requests: Vec<(String, usize)>,
    feedback_calls: Vec<(String, String, Feedback)>,
    feedback_failure: Option<(StatusCode, String)>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    dropped_streams: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_stream(&self, stream: ScriptedStream) -> &Self {
        self.state().streams.push_back(stream);
        self
    }

    pub fn push_transcript(&self, turns: Vec<Turn>) -> &Self {
        self.state().transcripts.push_back(Ok(turns));
        self
    }

    pub fn push_transcript_failure(&self, status: StatusCode, message: &str) -> &Self {
        self.state()
            .transcripts
            .push_back(Err((status, message.to_string())));
        self
    }

    pub fn push_attachment(&self, attachment: Option<Attachment>) -> &Self {
        self.state().attachments.push_back(Ok(attachment));
        self
    }

    pub fn push_attachment_failure(&self, status: StatusCode, message: &str) -> &Self {
        self.state()
            .attachments
            .push_back(Err((status, message.to_string())));
        self
    }

    pub fn set_attachment_delay(&self, delay: Duration) -> &Self {
        self.state().attachment_delay = Some(delay);
        self
    }

    pub fn fail_feedback(&self, status: StatusCode, message: &str) -> &Self {
        self.state().feedback_failure = Some((status, message.to_string()));
        self
    }

    pub fn sent_messages(&self) -> Vec<(String, String)> {
        self.state().sent_messages.clone()
    }

    pub fn attachment_requests(&self) -> Vec<(String, usize)> {
        self.state().attachment_requests.clone()
    }

    pub fn feedback_calls(&self) -> Vec<(String, String, Feedback)> {
        self.state().feedback_calls.clone()
    }

    /// Number of response bodies released by their reader, whether read to
    /// completion or abandoned on cancellation.
    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn open_stream(&self, chat_id: &str, message: &str) -> Result<ByteStream, ApiError> {
        let scripted = {
            let mut state = self.state();
            state
                .sent_messages
                .push((chat_id.to_string(), message.to_string()));
            state.streams.pop_front()
        };

        let inner: ByteStream = match scripted {
            Some(ScriptedStream::Chunks(chunks)) => Box::pin(stream::iter(into_bytes(chunks))),
            Some(ScriptedStream::Hanging(chunks)) => {
                Box::pin(stream::iter(into_bytes(chunks)).chain(stream::pending()))
            }
            Some(ScriptedStream::Manual(mut rx)) => Box::pin(stream::poll_fn(move |cx| {
                rx.poll_recv(cx).map(|item| item.map(|s| Ok(Bytes::from(s))))
            })),
            Some(ScriptedStream::Rejected(status, message)) => {
                return Err(ApiError::from_status(status, Some(message)));
            }
            None => {
                return Err(ApiError::from_status(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some("MockBackend: no more streams configured".to_string()),
                ));
            }
        };

        Ok(Box::pin(DropCounted {
            inner,
            counter: Arc::clone(&self.dropped_streams),
        }))
    }

    async fn fetch_transcript(&self, _chat_id: &str) -> Result<Vec<Turn>, ApiError> {
        let scripted = self.state().transcripts.pop_front();
        match scripted {
            Some(Ok(turns)) => Ok(turns),
            Some(Err((status, message))) => Err(ApiError::from_status(status, Some(message))),
            None => Err(ApiError::from_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("MockBackend: no transcript configured".to_string()),
            )),
        }
    }

    async fn fetch_attachment(
        &self,
        chat_id: &str,
        turn_number: usize,
    ) -> Result<Option<Attachment>, ApiError> {
        let (scripted, delay) = {
            let mut state = self.state();
            state
                .attachment_requests
                .push((chat_id.to_string(), turn_number));
            (state.attachments.pop_front(), state.attachment_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match scripted {
            Some(Ok(attachment)) => Ok(attachment),
            Some(Err((status, message))) => Err(ApiError::from_status(status, Some(message))),
            None => Ok(None),
        }
    }

    async fn send_feedback(
        &self,
        chat_id: &str,
        message_id: &str,
        feedback: Feedback,
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        state
            .feedback_calls
            .push((chat_id.to_string(), message_id.to_string(), feedback));
        match &state.feedback_failure {
            Some((status, message)) => Err(ApiError::from_status(*status, Some(message.clone()))),
            None => Ok(()),
        }
    }
}

fn into_bytes(chunks: Vec<String>) -> Vec<Result<Bytes, ApiError>> {
    chunks.into_iter().map(|s| Ok(Bytes::from(s))).collect()
}

struct DropCounted {
    inner: ByteStream,
    counter: Arc<AtomicUsize>,
}

impl Stream for DropCounted {
    type Item = Result<Bytes, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for DropCounted {
    fn drop(&mut self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}
