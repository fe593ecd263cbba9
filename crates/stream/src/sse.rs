//! Server-sent-event wire handling.
//!
//! Inbound: [`SseParser`] consumes upstream body bytes incrementally and
//! yields complete events per the standard grammar — `field: value` lines,
//! blank line dispatches, multi-line `data` joined with `\n`, comment lines
//! (leading `:`) skipped.
//!
//! Outbound: [`frame`], [`comment`], and [`done_frame`] produce the exact
//! wire text written to the client.

/// Literal data payload that terminates a stream in both directions.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if present.
    pub event: Option<String>,
    /// `data:` field; multiple lines joined with `\n`.
    pub data: String,
    /// `id:` field, if present.
    pub id: Option<String>,
    /// `retry:` field in milliseconds, if present and numeric.
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Whether this event is the `[DONE]` end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Incremental SSE parser over arbitrary byte chunk boundaries.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed upstream bytes; returns every event completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            self.field(&line);
        }
        events
    }

    fn field(&mut self, line: &str) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty()
            && self.event.is_none()
            && self.id.is_none()
            && self.retry.is_none()
        {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
            id: self.id.take(),
            retry: self.retry.take(),
        };
        Some(event)
    }
}

/// Encode one outbound frame: optional `event:` and `id:` lines, then
/// `data: <payload>\n\n`.
pub fn frame(event: Option<&str>, id: Option<&str>, data: &str) -> String {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(id) = id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(data);
    out.push_str("\n\n");
    out
}

/// Encode a comment frame, e.g. `: keepalive\n\n`.
pub fn comment(text: &str) -> String {
    format!(": {text}\n\n")
}

/// The terminal `data: [DONE]\n\n` frame.
pub fn done_frame() -> String {
    format!("data: {DONE_SENTINEL}\n\n")
}
