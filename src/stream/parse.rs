//! Incremental parser for `text/event-stream` bodies.
//!
//! Bytes can arrive split at any point, including in the middle of a line or
//! between the `\r` and `\n` of a CRLF pair. Complete frames are returned from
//! [`SseParser::feed`] in the order they were received.

use super::types::StreamMessage;

const BOM: char = '\u{feff}';

#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    after_cr: bool,
    started: bool,
    event: Option<String>,
    data: String,
    retry: Option<u64>,
    last_event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body, returning every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamMessage> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if self.after_cr {
                self.after_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }

            match byte {
                b'\n' => self.end_line(&mut frames),
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut frames);
                }
                _ => self.line.push(byte),
            }
        }

        frames
    }

    /// Id of the most recent frame that carried one
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn end_line(&mut self, frames: &mut Vec<StreamMessage>) {
        let raw = std::mem::take(&mut self.line);
        let mut line = String::from_utf8_lossy(&raw).into_owned();

        if !self.started {
            self.started = true;
            if line.starts_with(BOM) {
                line.remove(0);
            }
        }

        self.process_line(&line, frames);
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<StreamMessage>) {
        if line.is_empty() {
            self.dispatch(frames);
            return;
        }

        // Comment / keep-alive
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = (!value.is_empty()).then(|| value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    self.retry = value.parse().ok();
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, frames: &mut Vec<StreamMessage>) {
        let event = self.event.take();
        let retry = self.retry.take();

        if self.data.is_empty() {
            return;
        }

        let mut data = std::mem::take(&mut self.data);
        data.pop();

        frames.push(StreamMessage {
            id: self.last_event_id.clone(),
            event: event.filter(|e| !e.is_empty()),
            data,
            retry,
        });
    }
}
