//! Minimal incremental Server-Sent Events parser.
//!
//! Feeds response bytes in as they arrive and yields the `data:` payload
//! of each complete event. Only the subset of SSE that streaming
//! inference APIs use is handled: `data:` lines (joined with `\n`),
//! comment lines, and the `[DONE]` sentinel.

/// Incremental SSE reader over a byte stream.
#[derive(Debug, Default)]
pub struct SseReader {
    partial_line: String,
    data_lines: Vec<String>,
}

/// The `data:` payload of one complete SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseData(pub String);

impl SseData {
    /// Whether this event is the `[DONE]` end-of-stream sentinel.
    pub fn is_done(&self) -> bool {
        self.0.trim() == "[DONE]"
    }
}

impl SseReader {
    /// Create a new reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning any events completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseData> {
        let mut out = Vec::new();
        for ch in String::from_utf8_lossy(bytes).chars() {
            if ch != '\n' {
                self.partial_line.push(ch);
                continue;
            }
            let line = std::mem::take(&mut self.partial_line);
            if let Some(event) = self.take_line(line.strip_suffix('\r').unwrap_or(&line)) {
                out.push(event);
            }
        }
        out
    }

    /// Flush any buffered data as a final event when the stream ends.
    pub fn finish(&mut self) -> Option<SseData> {
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            let _ = self.take_line(line.strip_suffix('\r').unwrap_or(&line));
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(SseData(std::mem::take(&mut self.data_lines).join("\n")))
        }
    }

    fn take_line(&mut self, line: &str) -> Option<SseData> {
        if line.is_empty() {
            // Event boundary.
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(SseData(std::mem::take(&mut self.data_lines).join("\n")));
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
        }
        // `event:`/`id:` fields are irrelevant for the APIs we stream from.
        None
    }
}
