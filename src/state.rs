mod attachments;
pub mod controller;
mod error;
mod session;
mod slot;
mod transcript;

pub use attachments::AttachmentLedger;
pub use controller::{spawn, ControllerHandle};
pub use error::ControlError;
pub use session::{
    AttachmentTicket, Phase, SessionOptions, SessionOutcome, SessionState, SessionView,
    StreamStep, StreamTicket,
};
pub use slot::{SessionId, SessionSlot, StreamSession};
pub use transcript::{is_local_turn_id, local_turn_id, Transcript};
