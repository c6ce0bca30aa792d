//! Decoder for the reply stream of `POST /chats/{id}/send/`.
//!
//! The body is newline-delimited. Only lines starting with `data: ` carry a
//! JSON record; everything else is keep-alive or comment padding.

use super::logging::emit_record_parse_error;
use crate::api::client::ByteStream;
use crate::types::api::StreamRecord;
use crate::types::StreamEvent;
use futures::stream::{self, Stream, StreamExt};

const DATA_PREFIX: &[u8] = b"data: ";
const UNEXPECTED_END: &str = "stream ended unexpectedly";

/// Line-reassembly buffer for one stream. Holds raw bytes so that a UTF-8
/// sequence split across network chunks is decoded only once complete.
#[derive(Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal event has been produced. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds one network chunk and returns the events completed by it.
    ///
    /// At most one terminal event is ever returned and it is always last.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let line_end = start + offset;
            let event = decode_line(&self.buffer[start..line_end]);
            start = line_end + 1;

            if let Some(event) = event {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.finished = true;
                    self.buffer.clear();
                    return events;
                }
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        events
    }

    /// Signals end of input. A trailing unterminated line is still decoded;
    /// if no terminal event was seen, an implicit error closes the stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if let Some(event) = decode_line(&rest) {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                self.finished = true;
                return events;
            }
        }
        self.finished = true;
        events.push(StreamEvent::Error(UNEXPECTED_END.to_string()));
        events
    }

    /// Terminates the stream with a transport failure.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        self.buffer.clear();
        vec![StreamEvent::Error(message.into())]
    }
}

fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let payload = raw.strip_prefix(DATA_PREFIX)?;
    let payload = String::from_utf8_lossy(payload);
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamRecord>(payload) {
        Ok(record) => record.into_event(),
        Err(e) => {
            emit_record_parse_error(payload, &e);
            None
        }
    }
}

/// Turns a response body into a lazy, finite sequence of events that ends
/// with exactly one `Done` or `Error`.
pub fn decode_stream(bytes: ByteStream) -> impl Stream<Item = StreamEvent> + Send {
    stream::unfold(
        Some((bytes, StreamDecoder::new())),
        |state| async move {
            let Some((mut bytes, mut decoder)) = state else {
                return None;
            };
            loop {
                let events = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.process(&chunk),
                    Some(Err(e)) => decoder.fail(e.to_string()),
                    None => decoder.finish(),
                };
                if events.is_empty() {
                    continue;
                }
                let next = if decoder.is_finished() {
                    None
                } else {
                    Some((bytes, decoder))
                };
                return Some((stream::iter(events), next));
            }
        },
    )
    .flatten()
}
