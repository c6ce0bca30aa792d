use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One in-flight send: from the optimistic append until its terminal outcome.
#[derive(Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub buffer: String,
    pub token: CancellationToken,
}

impl StreamSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            buffer: String::new(),
            token: CancellationToken::new(),
        }
    }

    /// Fires the token; the reader task stops and late events are ignored.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Ownership slot holding at most one live session for a conversation.
#[derive(Debug, Default)]
pub struct SessionSlot {
    active: Option<StreamSession>,
}

impl SessionSlot {
    pub fn get(&self) -> Option<&StreamSession> {
        self.active.as_ref()
    }

    /// The live session only if it is `id` and has not been cancelled.
    pub fn get_live_mut(&mut self, id: SessionId) -> Option<&mut StreamSession> {
        self.active
            .as_mut()
            .filter(|session| session.id == id && !session.is_cancelled())
    }

    /// Installs `session` into an empty slot. Hands it back if the slot is taken.
    pub fn claim(&mut self, session: StreamSession) -> Result<(), StreamSession> {
        if self.active.is_some() {
            return Err(session);
        }
        self.active = Some(session);
        Ok(())
    }

    /// Swaps in `session`, cancelling and returning whatever was there.
    /// There is no moment at which the slot is observably empty.
    pub fn supersede(&mut self, session: StreamSession) -> Option<StreamSession> {
        let previous = self.active.replace(session);
        if let Some(previous) = &previous {
            previous.cancel();
        }
        previous
    }

    /// Removes the session if it is `id`.
    pub fn release(&mut self, id: SessionId) -> Option<StreamSession> {
        if self.active.as_ref().is_some_and(|s| s.id == id) {
            self.active.take()
        } else {
            None
        }
    }

    /// Cancels and removes whatever session is live.
    pub fn cancel_active(&mut self) -> Option<StreamSession> {
        let session = self.active.take()?;
        session.cancel();
        Some(session)
    }
}
