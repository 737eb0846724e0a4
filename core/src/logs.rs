use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use nodectl_protocol::LogLine;

/// Hard cap on retained log lines. Inserting beyond it evicts the oldest
/// entry, FIFO.
pub const LOG_CAPACITY: usize = 1000;

/// Bounded, append-only store of captured worker output. Owned by the
/// supervisor; the process runner appends through a [`LogHandle`].
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    /// Lines ever appended, monotonic across eviction and clear. Tail
    /// readers cursor on this instead of the retained length, which stops
    /// moving once the ring is full.
    total_appended: u64,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(LOG_CAPACITY),
            total_appended: 0,
        }
    }

    pub fn append(&mut self, text: impl Into<String>) {
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            timestamp: Utc::now(),
            text: text.into(),
        });
        self.total_appended += 1;
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    /// Retained lines appended after `cursor`, plus the cursor to pass next
    /// time. Lines evicted before they were read are simply gone; the
    /// cursor never goes backwards, including across [`LogBuffer::clear`].
    pub fn lines_since(&self, cursor: u64) -> (Vec<LogLine>, u64) {
        let oldest_retained = self.total_appended - self.lines.len() as u64;
        let skip = cursor.saturating_sub(oldest_retained) as usize;
        let lines = self.lines.iter().skip(skip).cloned().collect();
        (lines, self.total_appended)
    }

    /// Full log rendered as one newline-terminated block of text.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.render());
            out.push('\n');
        }
        out
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Cloneable handle the supervisor hands to the process runner. Appends and
/// reads never block on each other for long; the critical section is a
/// single ring operation.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    inner: Arc<Mutex<LogBuffer>>,
}

impl LogHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogBuffer::new())),
        }
    }

    pub fn append(&self, text: impl Into<String>) {
        if let Ok(mut buffer) = self.inner.lock() {
            buffer.append(text);
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        match self.inner.lock() {
            Ok(buffer) => buffer.snapshot(),
            Err(_) => Vec::new(),
        }
    }

    pub fn lines_since(&self, cursor: u64) -> (Vec<LogLine>, u64) {
        match self.inner.lock() {
            Ok(buffer) => buffer.lines_since(cursor),
            Err(_) => (Vec::new(), cursor),
        }
    }

    pub fn render_text(&self) -> String {
        match self.inner.lock() {
            Ok(buffer) => buffer.render_text(),
            Err(_) => String::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut buffer) = self.inner.lock() {
            buffer.clear();
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(buffer) => buffer.len(),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_preserves_insertion_order() {
        let mut buffer = LogBuffer::new();
        buffer.append("first");
        buffer.append("second");
        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "first");
        assert_eq!(lines[1].text, "second");
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let mut buffer = LogBuffer::new();
        for i in 0..LOG_CAPACITY + 1 {
            buffer.append(format!("line {i}"));
        }
        assert_eq!(buffer.len(), LOG_CAPACITY);
        let lines = buffer.snapshot();
        assert_eq!(lines[0].text, "line 1");
        assert_eq!(lines[LOG_CAPACITY - 1].text, format!("line {LOG_CAPACITY}"));
    }

    #[test]
    fn clear_empties_regardless_of_size() {
        let mut buffer = LogBuffer::new();
        for i in 0..10 {
            buffer.append(format!("line {i}"));
        }
        buffer.clear();
        assert!(buffer.is_empty());

        // Clearing an already-empty buffer is a no-op.
        buffer.clear();
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn lines_since_keeps_streaming_past_capacity() {
        let mut buffer = LogBuffer::new();
        for i in 0..LOG_CAPACITY {
            buffer.append(format!("line {i}"));
        }
        let (lines, cursor) = buffer.lines_since(0);
        assert_eq!(lines.len(), LOG_CAPACITY);
        assert_eq!(cursor, LOG_CAPACITY as u64);

        // The ring is full, so the retained length stops growing. A reader
        // cursoring on total appends still sees the fresh line.
        buffer.append("one more");
        assert_eq!(buffer.len(), LOG_CAPACITY);
        let (lines, cursor) = buffer.lines_since(cursor);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "one more");
        assert_eq!(cursor, LOG_CAPACITY as u64 + 1);
    }

    #[test]
    fn lines_since_drops_evicted_prefix() {
        let mut buffer = LogBuffer::new();
        for i in 0..LOG_CAPACITY + 5 {
            buffer.append(format!("line {i}"));
        }
        // The first five lines were evicted before this reader caught up.
        let (lines, cursor) = buffer.lines_since(0);
        assert_eq!(lines.len(), LOG_CAPACITY);
        assert_eq!(lines[0].text, "line 5");
        assert_eq!(cursor, LOG_CAPACITY as u64 + 5);
    }

    #[test]
    fn lines_since_cursor_survives_clear() {
        let mut buffer = LogBuffer::new();
        buffer.append("before");
        let (_, cursor) = buffer.lines_since(0);
        buffer.clear();
        let (lines, cursor) = buffer.lines_since(cursor);
        assert!(lines.is_empty());
        buffer.append("after");
        let (lines, _) = buffer.lines_since(cursor);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "after");
    }

    #[test]
    fn handle_appends_are_visible_to_readers() {
        let handle = LogHandle::new();
        let clone = handle.clone();
        clone.append("from the runner");
        let text = handle.render_text();
        assert!(text.contains("from the runner"));
        assert!(text.ends_with('\n'));
    }
}
