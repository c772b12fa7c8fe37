//! Bounded capture of tool output.

pub const TRUNCATION_MARKER: &str = "\n...[truncated]...";

#[derive(Debug)]
pub struct OutputCapture {
    limit: usize,
    buf: Vec<u8>,
    total: usize,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::with_capacity(limit.min(64 * 1024)),
            total: 0,
        }
    }

    /// Keeps the first `limit` bytes ever pushed; later bytes are only counted.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total = self.total.saturating_add(chunk.len());
        let room = self.limit.saturating_sub(self.buf.len());
        if room > 0 {
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// True when more than `limit` bytes arrived.
    pub fn is_truncated(&self) -> bool {
        self.total > self.limit
    }

    pub fn render(&self) -> String {
        self.render_bounded().0
    }

    /// Lossy UTF-8 text of the kept bytes, never longer than `limit` plus the
    /// marker, and whether it was cut. Invalid bytes widen to U+FFFD, so the
    /// bound is applied after decoding.
    pub fn render_bounded(&self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if !self.is_truncated() && text.len() <= self.limit {
            return (text, false);
        }
        if text.len() > self.limit {
            let mut cut = self.limit;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text.push_str(TRUNCATION_MARKER);
        (text, true)
    }
}
