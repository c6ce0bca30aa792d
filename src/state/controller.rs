//! Async driver around `SessionState`.
//!
//! One task owns the state and handles commands and I/O completions strictly
//! one at a time. Network work runs in spawned tasks that post results back
//! over an internal channel, so a slow transcript or attachment fetch never
//! holds up the next command.

use super::error::ControlError;
use super::session::{
    AttachmentTicket, Phase, SessionOptions, SessionState, SessionView, StreamStep, StreamTicket,
};
use super::slot::SessionId;
use crate::api::stream::decode_stream;
use crate::api::{ApiError, ChatBackend};
use crate::types::{Attachment, Feedback, StreamEvent, Turn};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<SessionId, ControlError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Retry {
        reply: oneshot::Sender<Result<SessionId, ControlError>>,
    },
    Feedback {
        message_id: String,
        feedback: Feedback,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Load {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Event {
    Stream {
        session: SessionId,
        event: StreamEvent,
    },
    Reconciled {
        session: SessionId,
        result: Result<Vec<Turn>, String>,
    },
    Attachment {
        message_id: String,
        attachment: Option<Attachment>,
    },
    Loaded {
        revision: u64,
        result: Result<Vec<Turn>, ApiError>,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    FeedbackSent {
        message_id: String,
        feedback: Feedback,
        result: Result<(), ApiError>,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
}

/// Cloneable front door to a running controller.
///
/// The controller tears down once `shutdown` is called or every handle is
/// dropped.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<SessionView>,
}

/// Starts a controller for `chat_id` on the current tokio runtime.
pub fn spawn(
    backend: Arc<dyn ChatBackend>,
    chat_id: impl Into<String>,
    options: SessionOptions,
) -> ControllerHandle {
    let state = SessionState::new(chat_id, options);
    let (view_tx, view_rx) = watch::channel(state.view());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let controller = Controller {
        state,
        backend,
        events: event_tx,
        view: view_tx,
        lifetime: CancellationToken::new(),
    };
    tokio::spawn(controller.run(command_rx, event_rx));

    ControllerHandle {
        commands: command_tx,
        view: view_rx,
    }
}

impl ControllerHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ControlError::Closed)?;
        response.await.map_err(|_| ControlError::Closed)
    }

    /// Appends `text` optimistically and starts streaming the reply.
    /// Resolves as soon as the session is open, not when the reply finishes.
    pub async fn send(&self, text: impl Into<String>) -> Result<SessionId, ControlError> {
        let text = text.into();
        self.call(|reply| Command::Send { text, reply }).await?
    }

    /// True when a live session was cancelled.
    pub async fn cancel(&self) -> Result<bool, ControlError> {
        self.call(|reply| Command::Cancel { reply }).await
    }

    pub async fn retry(&self) -> Result<SessionId, ControlError> {
        self.call(|reply| Command::Retry { reply }).await?
    }

    pub async fn feedback(
        &self,
        message_id: impl Into<String>,
        feedback: Feedback,
    ) -> Result<(), ControlError> {
        let message_id = message_id.into();
        self.call(|reply| Command::Feedback {
            message_id,
            feedback,
            reply,
        })
        .await?
    }

    /// Replaces the cache with the server's transcript.
    pub async fn load(&self) -> Result<(), ControlError> {
        self.call(|reply| Command::Load { reply }).await?
    }

    /// Tears the controller down and waits for it to stop. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Waits for the first published view satisfying `predicate`.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&SessionView) -> bool,
    ) -> Result<SessionView, ControlError> {
        let mut view = self.view.clone();
        let matched = view
            .wait_for(|v| predicate(v))
            .await
            .map_err(|_| ControlError::Closed)?;
        Ok(matched.clone())
    }
}

struct Controller {
    state: SessionState,
    backend: Arc<dyn ChatBackend>,
    events: mpsc::UnboundedSender<Event>,
    view: watch::Sender<SessionView>,
    /// Fired on teardown; background fetches stop posting once it is.
    lifetime: CancellationToken,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.publish();
        }

        tracing::debug!(chat_id = %self.state.chat_id(), "controller shutting down");
        self.state.teardown();
        self.lifetime.cancel();
        self.publish();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Replies go out after this, so an awaited call is visible in `view()`.
    fn publish(&self) {
        self.view.send_replace(self.state.view());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { text, reply } => {
                let result = self
                    .state
                    .begin_send(&text)
                    .map(|ticket| self.start_stream(ticket));
                self.publish();
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let cancelled = self.state.cancel().is_some();
                self.publish();
                let _ = reply.send(cancelled);
            }
            Command::Retry { reply } => {
                let result = self
                    .state
                    .prepare_retry()
                    .and_then(|text| self.state.begin_send(&text))
                    .map(|ticket| self.start_stream(ticket));
                self.publish();
                let _ = reply.send(result);
            }
            Command::Feedback {
                message_id,
                feedback,
                reply,
            } => self.start_feedback(message_id, feedback, reply),
            Command::Load { reply } => self.start_load(reply),
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Stream { session, event } => {
                let step = self.state.apply_stream_event(session, event);
                if let StreamStep::Reconcile { session } = step {
                    self.start_reconcile(session);
                }
            }
            Event::Reconciled { session, result } => {
                if let Some(ticket) = self.state.finish_reconcile(session, result) {
                    self.start_attachment(ticket);
                }
            }
            Event::Attachment {
                message_id,
                attachment,
            } => {
                if self.state.record_attachment(&message_id, attachment) {
                    tracing::debug!(
                        chat_id = %self.state.chat_id(),
                        message_id = %message_id,
                        "attachment stored"
                    );
                }
            }
            Event::Loaded {
                revision,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(turns) => self.state.apply_loaded(revision, turns),
                    Err(error) => {
                        tracing::warn!(
                            chat_id = %self.state.chat_id(),
                            %error,
                            "transcript load failed"
                        );
                        Err(error.into())
                    }
                };
                self.publish();
                let _ = reply.send(outcome);
            }
            Event::FeedbackSent {
                message_id,
                feedback,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => self.state.apply_feedback(&message_id, feedback),
                    Err(error) => {
                        tracing::warn!(
                            chat_id = %self.state.chat_id(),
                            message_id = %message_id,
                            %error,
                            "feedback failed"
                        );
                        Err(error.into())
                    }
                };
                self.publish();
                let _ = reply.send(outcome);
            }
        }
    }

    fn start_stream(&self, ticket: StreamTicket) -> SessionId {
        let session = ticket.session;
        if let Some(previous) = ticket.superseded {
            tracing::debug!(
                chat_id = %self.state.chat_id(),
                %previous,
                %session,
                "session superseded"
            );
        }
        tokio::spawn(read_stream(
            Arc::clone(&self.backend),
            self.state.chat_id().to_string(),
            ticket,
            self.events.clone(),
        ));
        session
    }

    fn start_reconcile(&self, session: SessionId) {
        let backend = Arc::clone(&self.backend);
        let chat_id = self.state.chat_id().to_string();
        let events = self.events.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = lifetime.cancelled() => return,
                result = backend.fetch_transcript(&chat_id) => result,
            };
            let _ = events.send(Event::Reconciled {
                session,
                result: result.map_err(|error| error.to_string()),
            });
        });
    }

    fn start_attachment(&self, ticket: AttachmentTicket) {
        let backend = Arc::clone(&self.backend);
        let chat_id = self.state.chat_id().to_string();
        let events = self.events.clone();
        let lifetime = self.lifetime.clone();
        tracing::debug!(
            chat_id = %chat_id,
            message_id = %ticket.message_id,
            turn_number = ticket.turn_number,
            "requesting attachment"
        );
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = lifetime.cancelled() => return,
                result = backend.fetch_attachment(&chat_id, ticket.turn_number) => result,
            };
            let attachment = result.unwrap_or_else(|error| {
                tracing::debug!(
                    message_id = %ticket.message_id,
                    status = ?error.status(),
                    %error,
                    "attachment fetch failed"
                );
                None
            });
            let _ = events.send(Event::Attachment {
                message_id: ticket.message_id,
                attachment,
            });
        });
    }

    fn start_load(&self, reply: oneshot::Sender<Result<(), ControlError>>) {
        if self.state.phase() != Phase::Idle {
            let _ = reply.send(Err(ControlError::Busy));
            return;
        }
        let revision = self.state.revision();
        let backend = Arc::clone(&self.backend);
        let chat_id = self.state.chat_id().to_string();
        let events = self.events.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = lifetime.cancelled() => return,
                result = backend.fetch_transcript(&chat_id) => result,
            };
            let _ = events.send(Event::Loaded {
                revision,
                result,
                reply,
            });
        });
    }

    fn start_feedback(
        &self,
        message_id: String,
        feedback: Feedback,
        reply: oneshot::Sender<Result<(), ControlError>>,
    ) {
        if !self.state.transcript().iter().any(|t| t.id == message_id)
            || super::is_local_turn_id(&message_id)
        {
            let _ = reply.send(Err(ControlError::UnknownMessage(message_id)));
            return;
        }
        let backend = Arc::clone(&self.backend);
        let chat_id = self.state.chat_id().to_string();
        let events = self.events.clone();
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = lifetime.cancelled() => return,
                result = backend.send_feedback(&chat_id, &message_id, feedback) => result,
            };
            let _ = events.send(Event::FeedbackSent {
                message_id,
                feedback,
                result,
                reply,
            });
        });
    }
}

/// Reads one session's reply stream until a terminal event, cancellation or
/// close. The response body is dropped on return, which releases the
/// connection.
async fn read_stream(
    backend: Arc<dyn ChatBackend>,
    chat_id: String,
    ticket: StreamTicket,
    events: mpsc::UnboundedSender<Event>,
) {
    let StreamTicket {
        session,
        message,
        token,
        ..
    } = ticket;

    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        opened = backend.open_stream(&chat_id, &message) => opened,
    };
    let bytes = match opened {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(chat_id = %chat_id, %session, %error, "stream request failed");
            let _ = events.send(Event::Stream {
                session,
                event: StreamEvent::Error(error.to_string()),
            });
            return;
        }
    };

    let mut decoded = Box::pin(decode_stream(bytes));
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = decoded.next() => next,
        };
        let Some(event) = next else {
            break;
        };
        let terminal = event.is_terminal();
        if events.send(Event::Stream { session, event }).is_err() || terminal {
            break;
        }
    }
}
