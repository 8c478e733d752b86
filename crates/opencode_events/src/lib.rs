//! Decoder for the backend's global server-sent-event stream.
//!
//! The stream carries `{ directory, payload }` envelopes around typed events
//! (`message.part.updated`, `message.updated`, `session.*`). This crate turns
//! raw bytes into [`chat_protocol::ChatEvent`]s and owns no connection logic;
//! callers keep reading bytes and resume with [`EventPipeline::last_event_id`].

pub mod decode;
pub mod error;
pub mod sse;

use chat_protocol::ChatEvent;
use tracing::warn;

pub use decode::EventDecoder;
pub use error::EventDecodeError;
pub use sse::{SseFrame, SseFrameParser};

/// SSE framing plus event decoding in one incremental pipeline.
#[derive(Debug, Default)]
pub struct EventPipeline {
    parser: SseFrameParser,
    decoder: EventDecoder,
}

impl EventPipeline {
    /// Feeds raw stream bytes; undecodable frames are logged and skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ChatEvent> {
        let mut events = Vec::new();

        for frame in self.parser.feed(bytes) {
            match self.decoder.decode_frame(&frame.data) {
                Ok(decoded) => events.extend(decoded),
                Err(error) => {
                    warn!(event_id = ?frame.id, %error, "dropping undecodable stream event");
                }
            }
        }

        events
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.parser.last_event_id()
    }
}
