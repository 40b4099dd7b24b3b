//! Incremental newline framing for streamed output.

/// Longest line kept by default. Longer lines are dropped whole.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Accumulates raw output chunks and yields complete lines.
///
/// Chunks may split lines (and UTF-8 sequences) anywhere; bytes are held
/// until their terminating `\n` arrives. A trailing `\r` is stripped.
///
/// Buffered bytes never contain a newline, so each push only scans the new
/// chunk. A line growing past the cap is discarded up to its newline and
/// the buffer stays bounded.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_len: usize,
    overflowed: bool,
    discarded: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line_len(MAX_LINE_LEN)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_len,
            overflowed: false,
            discarded: 0,
        }
    }

    /// Appends `chunk` and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append(rest.get(..pos).unwrap_or_default());
            if let Some(line) = self.complete_line() {
                lines.push(line);
            }
            rest = rest.get(pos + 1..).unwrap_or_default();
        }
        self.append(rest);
        lines
    }

    /// Returns whatever is left without a terminating newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.overflowed {
            self.reset_overflow();
            return None;
        }
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Number of buffered bytes not yet part of a complete line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Lines dropped so far for exceeding the length cap.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.pending.len() + bytes.len() > self.max_line_len {
            self.pending = Vec::new();
            self.overflowed = true;
            return;
        }
        self.pending.extend_from_slice(bytes);
    }

    fn complete_line(&mut self) -> Option<String> {
        if self.overflowed {
            self.reset_overflow();
            return None;
        }
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn reset_overflow(&mut self) {
        self.overflowed = false;
        self.discarded += 1;
    }
}
