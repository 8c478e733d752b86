/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub data: String,
}

/// Incremental line-oriented SSE parser.
///
/// Bytes are buffered until a full line is available so multi-byte characters
/// split across chunks decode intact. A blank line dispatches the pending
/// `data:` lines as one frame; `:` lines are comments/heartbeats.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: Vec<u8>,
    data: String,
    pending_id: Option<String>,
    last_event_id: Option<String>,
}

impl SseFrameParser {
    /// Feed arbitrary bytes into the parser and drain complete frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=position).collect();
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.starts_with(':') {
                continue;
            }

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(rest.trim_start());
            } else if let Some(rest) = line.strip_prefix("id:") {
                self.pending_id = Some(rest.trim().to_string());
            }
        }

        frames
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<SseFrame> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes())
    }

    /// Id of the most recently dispatched frame, used to resume with `Last-Event-ID`.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.is_empty() && self.data.is_empty()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let id = self.pending_id.take();
        if id.is_some() {
            self.last_event_id.clone_from(&id);
        }

        if self.data.is_empty() {
            return None;
        }

        Some(SseFrame {
            id,
            data: std::mem::take(&mut self.data),
        })
    }
}
