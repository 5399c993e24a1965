//! Incremental event-stream wire parsing.
//!
//! Events are dispatched by name (`fragment`, `done`, `error`), never by
//! sniffing payload content. The parser accepts byte chunks split at
//! arbitrary boundaries, including mid-line and mid-codepoint.

/// Event name carried by incremental response fragments.
pub const EVENT_FRAGMENT: &str = "fragment";
/// Event name for the explicit completion marker.
pub const EVENT_DONE: &str = "done";
/// Event name for an application-level error. Terminal, never retried.
pub const EVENT_ERROR: &str = "error";

const DEFAULT_EVENT_NAME: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
    event_id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline_at) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw_line: Vec<u8> = self.buffer.drain(..=newline_at).collect();
            let line = String::from_utf8_lossy(&raw_line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.accept_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn accept_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment / keep-alive line.
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.event_id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return None;
        }
        let name = self
            .event_name
            .take()
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(SseEvent {
            name,
            data,
            id: self.event_id.clone(),
        })
    }
}
