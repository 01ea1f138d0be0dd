//! C3: incremental Server-Sent Events framer.
//!
//! Splits a byte stream into individual SSE events while leaving the
//! original bytes untouched for downstream forwarding. Grounded on the
//! parsing state machine in `turbomcp-transport-streamable::sse::SseParser`,
//! adapted here to run as a tee: every chunk is pushed unmodified onto the
//! client-facing body and, independently, fed to this parser for the
//! capture side.

use serde_json::Value;

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u32>,
}

impl SseEvent {
    /// Parse `data` as a JSON-RPC message, if it is valid JSON.
    pub fn data_as_json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }
}

/// Incremental parser: `feed` may be called with arbitrary chunk
/// boundaries and always returns the events completed by that call.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: String,
    current_id: Option<String>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_retry: Option<u32>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return any events completed as a result. Invalid
    /// UTF-8 in a chunk is dropped rather than panicking; the caller still
    /// forwards the original bytes to the client unchanged.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.buffer.push_str(text);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);

            if line.is_empty() {
                if let Some(event) = self.emit() {
                    events.push(event);
                }
            } else if line.starts_with(':') {
                // comment / keepalive, ignored
            } else if let Some(colon) = line.find(':') {
                let field = &line[..colon];
                let value = line[colon + 1..].trim_start();
                self.apply_field(field, value);
            } else {
                self.apply_field(&line, "");
            }
        }
        events
    }

    fn apply_field(&mut self, field: &str, value: &str) {
        match field {
            "id" => self.current_id = Some(value.to_string()),
            "event" => self.current_event = Some(value.to_string()),
            "data" => self.current_data.push(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.current_retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn emit(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_id = None;
            self.current_event = None;
            self.current_retry = None;
            return None;
        }
        let data = self.current_data.join("\n");
        self.current_data.clear();
        Some(SseEvent {
            id: self.current_id.take(),
            event: self.current_event.take(),
            data,
            retry: self.current_retry.take(),
        })
    }
}
