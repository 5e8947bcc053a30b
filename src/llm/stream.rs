//! Incremental decoder for OpenAI-style `text/event-stream` bodies.
//!
//! Upstream bytes arrive in arbitrary slices: a `data:` line (or even a
//! multi-byte character) may be split across network chunks. The decoder
//! buffers raw bytes and only interprets complete lines.

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feeds raw bytes, returning events for every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.parse_line(line.trim(), &mut events);
        }

        events
    }

    /// Flushes a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        let line = String::from_utf8_lossy(&rest);
        self.parse_line(line.trim(), &mut events);
        events
    }

    fn parse_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if self.done {
            return;
        }
        let data = match line.strip_prefix("data:") {
            Some(d) => d.trim_start(),
            // comments (": keep-alive"), event names and blank separators
            None => return,
        };

        if data == "[DONE]" {
            self.done = true;
            events.push(StreamEvent::Done);
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream line");
                return;
            }
        };

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.and_then(|d| d.content) {
                if !content.is_empty() {
                    events.push(StreamEvent::Delta(content));
                }
            }
            if choice.finish_reason.is_some() {
                self.done = true;
                events.push(StreamEvent::Done);
            }
        }
    }
}
