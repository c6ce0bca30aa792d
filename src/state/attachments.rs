use crate::types::Attachment;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Sponsored attachments keyed by assistant message id.
///
/// Append-only for the life of a controller. Each id is requested at most
/// once, whatever that request returns, and stores at most one attachment.
#[derive(Debug, Default)]
pub struct AttachmentLedger {
    stored: Arc<BTreeMap<String, Attachment>>,
    requested: HashSet<String>,
    in_flight: HashSet<String>,
}

impl AttachmentLedger {
    /// Reserves the one request `message_id` will ever get. False for an
    /// empty id or an id that was requested before.
    pub fn begin_request(&mut self, message_id: &str) -> bool {
        if message_id.is_empty() || !self.requested.insert(message_id.to_string()) {
            return false;
        }
        self.in_flight.insert(message_id.to_string());
        true
    }

    /// Settles the outstanding request for `message_id`. Returns true when an
    /// attachment was stored.
    pub fn complete(&mut self, message_id: &str, attachment: Option<Attachment>) -> bool {
        if !self.in_flight.remove(message_id) {
            return false;
        }
        let Some(attachment) = attachment else {
            return false;
        };
        if self.stored.contains_key(message_id) {
            return false;
        }
        Arc::make_mut(&mut self.stored).insert(message_id.to_string(), attachment);
        true
    }

    #[cfg(test)]
    pub fn is_pending(&self, message_id: &str) -> bool {
        self.in_flight.contains(message_id)
    }

    /// Shared view of every stored attachment.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Attachment>> {
        Arc::clone(&self.stored)
    }
}
