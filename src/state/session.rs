//! Lifecycle of one conversation's send/receive turns.
//!
//! `SessionState` is synchronous and owns every piece of mutable session
//! data. The async controller feeds it commands and I/O results one at a
//! time and performs the I/O it asks for.

use super::attachments::AttachmentLedger;
use super::error::ControlError;
use super::slot::{SessionId, SessionSlot, StreamSession};
use super::transcript::{local_turn_id, Transcript};
use crate::config::{Config, SendPolicy};
use crate::types::{Attachment, Feedback, Role, StreamEvent, Turn};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Optimistic user turn appended, no reply text yet.
    Sending,
    /// Reply text is arriving.
    Streaming,
    /// Reply finished; waiting for the authoritative transcript.
    Reconciling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Reply committed; the id is the one the `done` record carried.
    Completed { message_id: String },
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub send_policy: SendPolicy,
    pub attachments_enabled: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            send_policy: SendPolicy::Reject,
            attachments_enabled: true,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            send_policy: config.send_policy,
            attachments_enabled: config.attachments_enabled,
        }
    }
}

/// What the driver needs to open the reply stream for a new session.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub session: SessionId,
    pub message: String,
    pub token: CancellationToken,
    /// Session cancelled to make room for this one, if any.
    pub superseded: Option<SessionId>,
}

/// Result of feeding one stream event to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStep {
    /// Stale or cancelled session; nothing changed.
    Ignored,
    Accumulated,
    /// Terminal `done`: fetch the transcript for this session.
    Reconcile { session: SessionId },
    Failed { reason: String },
}

/// An attachment request reserved in the ledger, ready to be issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentTicket {
    pub message_id: String,
    pub turn_number: usize,
}

#[derive(Debug)]
struct PendingReconcile {
    session: SessionId,
    message_id: String,
    content: String,
}

/// Point-in-time copy of everything a view renders.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub chat_id: String,
    pub phase: Phase,
    /// Session whose reply is streaming, while one is.
    pub active_session: Option<SessionId>,
    pub transcript: Transcript,
    /// Reply text so far while streaming; empty otherwise.
    pub streaming_content: String,
    /// The one user-visible error, cleared by the next send.
    pub error: Option<String>,
    pub last_outcome: Option<SessionOutcome>,
    pub attachments: Arc<BTreeMap<String, Attachment>>,
}

impl SessionView {
    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn attachment_for(&self, message_id: &str) -> Option<&Attachment> {
        self.attachments.get(message_id)
    }
}

#[derive(Debug)]
pub struct SessionState {
    chat_id: String,
    options: SessionOptions,
    phase: Phase,
    transcript: Transcript,
    revision: u64,
    slot: SessionSlot,
    pending: Option<PendingReconcile>,
    attachments: AttachmentLedger,
    error: Option<String>,
    last_outcome: Option<SessionOutcome>,
    next_session: u64,
}

impl SessionState {
    pub fn new(chat_id: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            chat_id: chat_id.into(),
            options,
            phase: Phase::Idle,
            transcript: Transcript::default(),
            revision: 0,
            slot: SessionSlot::default(),
            pending: None,
            attachments: AttachmentLedger::default(),
            error: None,
            last_outcome: None,
            next_session: 1,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    #[cfg(test)]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[cfg(test)]
    pub fn last_outcome(&self) -> Option<&SessionOutcome> {
        self.last_outcome.as_ref()
    }

    /// Bumped on every transcript replacement. Lets a background load detect
    /// that the cache moved on while it was in flight.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn streaming_content(&self) -> &str {
        match self.phase {
            Phase::Sending | Phase::Streaming => self.slot.get().map_or("", |s| s.buffer.as_str()),
            Phase::Idle | Phase::Reconciling => "",
        }
    }

    pub fn active_session(&self) -> Option<SessionId> {
        match self.phase {
            Phase::Sending | Phase::Streaming => self.slot.get().map(|s| s.id),
            Phase::Idle | Phase::Reconciling => None,
        }
    }

    #[cfg(test)]
    pub fn attachments(&self) -> &AttachmentLedger {
        &self.attachments
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            chat_id: self.chat_id.clone(),
            phase: self.phase,
            active_session: self.active_session(),
            transcript: self.transcript.clone(),
            streaming_content: self.streaming_content().to_string(),
            error: self.error.clone(),
            last_outcome: self.last_outcome.clone(),
            attachments: self.attachments.snapshot(),
        }
    }

    fn set_transcript(&mut self, transcript: Transcript) {
        self.transcript = transcript;
        self.revision += 1;
    }

    /// `Idle -> Sending`: appends the optimistic user turn and opens a session.
    ///
    /// While a session is live the send is refused, unless the policy is
    /// `Supersede`, in which case the live session is cancelled and replaced
    /// in one swap. Refusals leave the state untouched.
    pub fn begin_send(&mut self, text: &str) -> Result<StreamTicket, ControlError> {
        if text.trim().is_empty() {
            return Err(ControlError::EmptyMessage);
        }

        let supersede = match self.phase {
            Phase::Idle => false,
            Phase::Sending | Phase::Streaming
                if self.options.send_policy == SendPolicy::Supersede =>
            {
                true
            }
            Phase::Sending | Phase::Streaming | Phase::Reconciling => {
                return Err(ControlError::Busy);
            }
        };

        let id = SessionId(self.next_session);
        self.next_session += 1;
        let session = StreamSession::new(id);
        let token = session.token.clone();

        let superseded = if supersede {
            let previous = self.slot.supersede(session).map(|s| s.id);
            self.last_outcome = Some(SessionOutcome::Cancelled);
            previous
        } else if let Err(session) = self.slot.claim(session) {
            // Phase said Idle, so the slot should be empty; refuse rather than clobber.
            session.cancel();
            return Err(ControlError::Busy);
        } else {
            None
        };

        let optimistic = Turn::user(local_turn_id(), text);
        self.set_transcript(self.transcript.with_appended(optimistic));
        self.error = None;
        self.phase = Phase::Sending;
        tracing::debug!(chat_id = %self.chat_id, session = %id, "send started");

        Ok(StreamTicket {
            session: id,
            message: text.to_string(),
            token,
            superseded,
        })
    }

    /// Applies one decoded event from `session`'s stream.
    pub fn apply_stream_event(&mut self, session: SessionId, event: StreamEvent) -> StreamStep {
        let Some(live) = self.slot.get_live_mut(session) else {
            return StreamStep::Ignored;
        };

        match event {
            StreamEvent::Chunk(text) => {
                live.buffer.push_str(&text);
                self.phase = Phase::Streaming;
                StreamStep::Accumulated
            }
            StreamEvent::Done(message_id) => {
                let Some(finished) = self.slot.release(session) else {
                    return StreamStep::Ignored;
                };
                tracing::debug!(
                    chat_id = %self.chat_id,
                    session = %session,
                    message_id = %message_id,
                    "reply complete, reconciling"
                );
                self.pending = Some(PendingReconcile {
                    session,
                    message_id: message_id.clone(),
                    content: finished.buffer,
                });
                self.last_outcome = Some(SessionOutcome::Completed { message_id });
                self.phase = Phase::Reconciling;
                StreamStep::Reconcile { session }
            }
            StreamEvent::Error(reason) => {
                self.slot.release(session);
                tracing::warn!(chat_id = %self.chat_id, session = %session, %reason, "reply failed");
                self.error = Some(reason.clone());
                self.last_outcome = Some(SessionOutcome::Failed {
                    reason: reason.clone(),
                });
                self.phase = Phase::Idle;
                StreamStep::Failed { reason }
            }
        }
    }

    /// Cancels the live session. The reply so far is discarded silently and
    /// the optimistic user turn stays. Returns the cancelled id, or `None`
    /// when nothing was streaming.
    pub fn cancel(&mut self) -> Option<SessionId> {
        if !matches!(self.phase, Phase::Sending | Phase::Streaming) {
            return None;
        }
        let cancelled = self.slot.cancel_active()?;
        tracing::debug!(chat_id = %self.chat_id, session = %cancelled.id, "session cancelled");
        self.last_outcome = Some(SessionOutcome::Cancelled);
        self.phase = Phase::Idle;
        Some(cancelled.id)
    }

    /// `Reconciling -> Idle`. On success the server's turns replace the cache
    /// wholesale; on failure the reply is synthesized locally from the
    /// streamed text and the `done` id. Either way the returned ticket, if
    /// any, is the advisory attachment request to issue next.
    pub fn finish_reconcile(
        &mut self,
        session: SessionId,
        fetched: Result<Vec<Turn>, String>,
    ) -> Option<AttachmentTicket> {
        if self.pending.as_ref().map(|p| p.session) != Some(session) {
            return None;
        }
        let pending = self.pending.take()?;

        let settled = match fetched {
            Ok(turns) => Transcript::new(turns),
            Err(reason) => {
                tracing::warn!(
                    chat_id = %self.chat_id,
                    session = %session,
                    %reason,
                    "transcript fetch failed, keeping local reply"
                );
                self.transcript
                    .with_appended(Turn::assistant(pending.message_id, pending.content))
            }
        };
        self.set_transcript(settled);
        self.phase = Phase::Idle;

        self.next_attachment_ticket()
    }

    fn next_attachment_ticket(&mut self) -> Option<AttachmentTicket> {
        if !self.options.attachments_enabled {
            return None;
        }
        let last = self.transcript.last()?;
        if last.role != Role::Assistant {
            return None;
        }
        let message_id = last.id.clone();
        let turn_number = self.transcript.assistant_count().saturating_sub(1);
        if !self.attachments.begin_request(&message_id) {
            return None;
        }
        Some(AttachmentTicket {
            message_id,
            turn_number,
        })
    }

    pub fn record_attachment(&mut self, message_id: &str, attachment: Option<Attachment>) -> bool {
        self.attachments.complete(message_id, attachment)
    }

    /// Replaces the cache with a freshly loaded transcript, unless a send or
    /// another replacement happened since `revision` was read. Loaded replies
    /// did not settle here, so no attachment is requested for them.
    pub fn apply_loaded(&mut self, revision: u64, turns: Vec<Turn>) -> Result<(), ControlError> {
        if self.phase != Phase::Idle || self.revision != revision {
            return Err(ControlError::Busy);
        }
        self.set_transcript(Transcript::new(turns));
        Ok(())
    }

    /// Prepares an explicit retry: cancels a live session, drops the trailing
    /// exchange, and returns the last user text to send again. The re-send
    /// appends that user turn back optimistically.
    pub fn prepare_retry(&mut self) -> Result<String, ControlError> {
        if self.phase == Phase::Reconciling {
            return Err(ControlError::Busy);
        }
        let text = self
            .transcript
            .last_user_turn()
            .map(|t| t.content.clone())
            .ok_or(ControlError::NothingToRetry)?;
        if text.trim().is_empty() {
            return Err(ControlError::EmptyMessage);
        }

        self.cancel();
        let mut trimmed = self.transcript.without_trailing_assistant();
        if trimmed.last().is_some_and(|t| t.role == Role::User) {
            trimmed = trimmed.truncated(trimmed.len() - 1);
        }
        if trimmed.len() != self.transcript.len() {
            self.set_transcript(trimmed);
        }
        Ok(text)
    }

    pub fn apply_feedback(&mut self, message_id: &str, feedback: Feedback) -> Result<(), ControlError> {
        let updated = self
            .transcript
            .with_feedback(message_id, feedback)
            .ok_or_else(|| ControlError::UnknownMessage(message_id.to_string()))?;
        self.set_transcript(updated);
        Ok(())
    }

    /// Controller teardown: fires the live token and abandons any pending
    /// reconciliation.
    pub fn teardown(&mut self) {
        if self.cancel().is_none() {
            self.slot.cancel_active();
        }
        self.pending = None;
        self.phase = Phase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        SessionState::new("chat-1", SessionOptions::default())
    }

    fn chunk(text: &str) -> StreamEvent {
        StreamEvent::Chunk(text.to_string())
    }

    #[test]
    fn test_send_appends_optimistic_user_turn() {
        let mut state = state();
        let ticket = state.begin_send("hi").expect("idle send");

        assert_eq!(state.phase(), Phase::Sending);
        assert_eq!(ticket.message, "hi");
        assert!(ticket.superseded.is_none());
        let turns = state.transcript();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
        assert!(crate::state::is_local_turn_id(&turns[0].id));
    }

    #[test]
    fn test_empty_message_is_refused() {
        let mut state = state();
        assert!(matches!(state.begin_send("   "), Err(ControlError::EmptyMessage)));
        assert!(state.transcript().is_empty());
    }

    #[test]
    fn test_chunks_accumulate_in_arrival_order() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        assert_eq!(state.apply_stream_event(ticket.session, chunk("He")), StreamStep::Accumulated);
        assert_eq!(state.phase(), Phase::Streaming);
        state.apply_stream_event(ticket.session, chunk("l"));
        state.apply_stream_event(ticket.session, chunk("lo"));
        assert_eq!(state.streaming_content(), "Hello");
    }

    #[test]
    fn test_done_moves_to_reconciling_and_clears_buffer() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, chunk("Hello"));
        let step = state.apply_stream_event(ticket.session, StreamEvent::Done("srv-1".into()));

        assert_eq!(step, StreamStep::Reconcile { session: ticket.session });
        assert_eq!(state.phase(), Phase::Reconciling);
        assert_eq!(state.streaming_content(), "");
        assert_eq!(
            state.last_outcome(),
            Some(&SessionOutcome::Completed { message_id: "srv-1".into() })
        );
    }

    #[test]
    fn test_done_without_chunks_or_id_still_reconciles() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        let step = state.apply_stream_event(ticket.session, StreamEvent::Done(String::new()));
        assert_eq!(step, StreamStep::Reconcile { session: ticket.session });
    }

    #[test]
    fn test_reconcile_replaces_transcript_wholesale() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, chunk("He"));
        state.apply_stream_event(ticket.session, chunk("llo"));
        state.apply_stream_event(ticket.session, StreamEvent::Done("srv-1".into()));

        let server = vec![Turn::user("u1", "hi"), Turn::assistant("srv-1", "Hello")];
        let attachment = state.finish_reconcile(ticket.session, Ok(server.clone()));

        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.transcript().turns(), server.as_slice());
        assert_eq!(state.streaming_content(), "");
        assert_eq!(
            attachment,
            Some(AttachmentTicket { message_id: "srv-1".into(), turn_number: 0 })
        );
    }

    #[test]
    fn test_reconcile_failure_synthesizes_reply_locally() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, chunk("hel"));
        state.apply_stream_event(ticket.session, chunk("lo"));
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));

        let attachment = state.finish_reconcile(ticket.session, Err("API error 500".into()));

        let turns = state.transcript();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1], Turn::assistant("m1", "hello"));
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.error().is_none());
        assert_eq!(attachment.map(|a| a.message_id), Some("m1".to_string()));
    }

    #[test]
    fn test_reconcile_failure_with_empty_id_requests_no_attachment() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, chunk("x"));
        state.apply_stream_event(ticket.session, StreamEvent::Done(String::new()));
        assert!(state.finish_reconcile(ticket.session, Err("down".into())).is_none());
        assert_eq!(state.transcript().assistant_count(), 1);
    }

    #[test]
    fn test_error_event_fails_and_preserves_user_turn() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, chunk("partial"));
        let step = state.apply_stream_event(ticket.session, StreamEvent::Error("overloaded".into()));

        assert_eq!(step, StreamStep::Failed { reason: "overloaded".into() });
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.error(), Some("overloaded"));
        assert_eq!(state.streaming_content(), "");
        assert_eq!(state.transcript().len(), 1);
        assert_eq!(state.transcript()[0].content, "hi");
    }

    #[test]
    fn test_next_send_clears_previous_error() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Error("boom".into()));
        state.begin_send("again").unwrap();
        assert!(state.error().is_none());
    }

    #[test]
    fn test_cancel_discards_buffer_silently_and_ignores_late_events() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, chunk("par"));

        assert_eq!(state.cancel(), Some(ticket.session));
        assert!(ticket.token.is_cancelled());
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.error().is_none());
        assert_eq!(state.last_outcome(), Some(&SessionOutcome::Cancelled));

        for late in [chunk("tial"), StreamEvent::Done("m9".into()), StreamEvent::Error("x".into())] {
            assert_eq!(state.apply_stream_event(ticket.session, late), StreamStep::Ignored);
        }
        assert!(state.error().is_none());
        assert_eq!(state.transcript().len(), 1);
        assert_eq!(state.transcript().assistant_count(), 0);
    }

    #[test]
    fn test_cancel_when_idle_is_noop() {
        let mut state = state();
        assert!(state.cancel().is_none());
    }

    #[test]
    fn test_send_while_streaming_is_rejected_without_state_change() {
        let mut state = state();
        let ticket = state.begin_send("first").unwrap();
        state.apply_stream_event(ticket.session, chunk("abc"));
        let before = state.transcript().clone();

        assert!(matches!(state.begin_send("second"), Err(ControlError::Busy)));
        assert_eq!(state.transcript(), &before);
        assert_eq!(state.phase(), Phase::Streaming);
        assert_eq!(state.streaming_content(), "abc");
        assert!(!ticket.token.is_cancelled());
    }

    #[test]
    fn test_send_while_reconciling_is_rejected_even_when_superseding() {
        let mut state = SessionState::new(
            "chat-1",
            SessionOptions {
                send_policy: SendPolicy::Supersede,
                attachments_enabled: true,
            },
        );
        let ticket = state.begin_send("first").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));
        assert!(matches!(state.begin_send("second"), Err(ControlError::Busy)));
    }

    #[test]
    fn test_supersede_policy_swaps_sessions() {
        let mut state = SessionState::new(
            "chat-1",
            SessionOptions {
                send_policy: SendPolicy::Supersede,
                attachments_enabled: true,
            },
        );
        let first = state.begin_send("first").unwrap();
        state.apply_stream_event(first.session, chunk("old"));

        let second = state.begin_send("second").unwrap();
        assert_eq!(second.superseded, Some(first.session));
        assert!(first.token.is_cancelled());
        assert_eq!(state.phase(), Phase::Sending);
        assert_eq!(state.streaming_content(), "");
        assert_eq!(
            state.apply_stream_event(first.session, chunk("stale")),
            StreamStep::Ignored
        );
        assert_eq!(
            state.apply_stream_event(second.session, chunk("new")),
            StreamStep::Accumulated
        );
        assert_eq!(state.streaming_content(), "new");
        assert_eq!(state.transcript().len(), 2);
    }

    #[test]
    fn test_turn_number_counts_previous_assistant_turns() {
        let mut state = state();
        state
            .apply_loaded(
                state.revision(),
                vec![Turn::user("u1", "a"), Turn::assistant("a1", "b")],
            )
            .unwrap();
        let ticket = state.begin_send("c").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Done("a2".into()));
        let attachment = state
            .finish_reconcile(
                ticket.session,
                Ok(vec![
                    Turn::user("u1", "a"),
                    Turn::assistant("a1", "b"),
                    Turn::user("u2", "c"),
                    Turn::assistant("a2", "d"),
                ]),
            )
            .expect("attachment ticket");
        assert_eq!(attachment.turn_number, 1);
        assert_eq!(attachment.message_id, "a2");
    }

    #[test]
    fn test_reply_settling_twice_is_requested_once_even_after_empty_result() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));
        let first = state.finish_reconcile(
            ticket.session,
            Ok(vec![Turn::user("u1", "hi"), Turn::assistant("m1", "yo")]),
        );
        assert!(first.is_some());
        assert!(state.attachments().is_pending("m1"));
        assert!(!state.record_attachment("m1", None));

        let ticket = state.begin_send("again").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));
        let second = state.finish_reconcile(
            ticket.session,
            Ok(vec![Turn::user("u1", "hi"), Turn::assistant("m1", "yo")]),
        );
        assert!(second.is_none());
    }

    #[test]
    fn test_loaded_history_requests_no_attachment() {
        let mut state = state();
        state
            .apply_loaded(
                state.revision(),
                vec![Turn::user("u1", "a"), Turn::assistant("a1", "b")],
            )
            .unwrap();
        assert!(!state.attachments().is_pending("a1"));
        assert!(state.view().attachments.is_empty());
    }

    #[test]
    fn test_view_names_active_session_only_while_streaming() {
        let mut state = state();
        assert!(state.view().active_session.is_none());
        let ticket = state.begin_send("hi").unwrap();
        assert_eq!(state.view().active_session, Some(ticket.session));
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));
        assert!(state.view().active_session.is_none());
    }

    #[test]
    fn test_attachments_disabled_issue_no_ticket() {
        let mut state = SessionState::new(
            "chat-1",
            SessionOptions {
                send_policy: SendPolicy::Reject,
                attachments_enabled: false,
            },
        );
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));
        assert!(state
            .finish_reconcile(ticket.session, Ok(vec![Turn::assistant("m1", "x")]))
            .is_none());
    }

    #[test]
    fn test_stale_reconcile_result_is_ignored() {
        let mut state = state();
        assert!(state
            .finish_reconcile(SessionId(42), Ok(vec![Turn::assistant("x", "y")]))
            .is_none());
        assert!(state.transcript().is_empty());
    }

    #[test]
    fn test_apply_loaded_rejects_stale_revision() {
        let mut state = state();
        let revision = state.revision();
        let ticket = state.begin_send("hi").unwrap();
        state.cancel();
        assert!(matches!(
            state.apply_loaded(revision, vec![]),
            Err(ControlError::Busy)
        ));
        assert_eq!(state.transcript().len(), 1);
        assert!(ticket.token.is_cancelled());
    }

    #[test]
    fn test_prepare_retry_drops_trailing_reply_and_returns_last_user_text() {
        let mut state = state();
        state
            .apply_loaded(
                state.revision(),
                vec![Turn::user("u1", "question"), Turn::assistant("a1", "bad answer")],
            )
            .unwrap();
        assert_eq!(state.prepare_retry().unwrap(), "question");
        assert!(state.transcript().is_empty());

        let ticket = state.begin_send("question").unwrap();
        assert_eq!(ticket.message, "question");
        assert_eq!(state.transcript().len(), 1);
    }

    #[test]
    fn test_prepare_retry_cancels_live_session() {
        let mut state = state();
        let ticket = state.begin_send("question").unwrap();
        state.apply_stream_event(ticket.session, chunk("half"));
        assert_eq!(state.prepare_retry().unwrap(), "question");
        assert!(ticket.token.is_cancelled());
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.transcript().is_empty());
    }

    #[test]
    fn test_prepare_retry_refuses_blank_user_text_before_touching_state() {
        let mut state = state();
        let turns = vec![Turn::user("u1", "  "), Turn::assistant("a1", "huh?")];
        state.apply_loaded(state.revision(), turns.clone()).unwrap();
        let revision = state.revision();

        assert!(matches!(state.prepare_retry(), Err(ControlError::EmptyMessage)));
        assert_eq!(state.transcript().turns(), turns.as_slice());
        assert_eq!(state.revision(), revision);
    }

    #[test]
    fn test_prepare_retry_without_user_turn() {
        let mut state = state();
        assert!(matches!(state.prepare_retry(), Err(ControlError::NothingToRetry)));
    }

    #[test]
    fn test_apply_feedback_updates_matching_turn() {
        let mut state = state();
        state
            .apply_loaded(state.revision(), vec![Turn::assistant("a1", "x")])
            .unwrap();
        state.apply_feedback("a1", Feedback::Dislike).unwrap();
        assert_eq!(state.transcript()[0].feedback, Some(Feedback::Dislike));
        assert!(matches!(
            state.apply_feedback("zz", Feedback::Like),
            Err(ControlError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_teardown_fires_token_and_drops_pending_reconcile() {
        let mut state = state();
        let ticket = state.begin_send("hi").unwrap();
        state.teardown();
        assert!(ticket.token.is_cancelled());

        let mut state = self::state();
        let ticket = state.begin_send("hi").unwrap();
        state.apply_stream_event(ticket.session, StreamEvent::Done("m1".into()));
        state.teardown();
        assert!(state
            .finish_reconcile(ticket.session, Ok(vec![Turn::assistant("m1", "x")]))
            .is_none());
        assert_eq!(state.phase(), Phase::Idle);
    }
}
