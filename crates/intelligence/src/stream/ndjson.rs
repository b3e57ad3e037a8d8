/// Incremental newline-delimited line decoder.
///
/// Buffers bytes as they arrive from the transport and yields complete lines
/// on each newline. Partial-line buffering and end-of-stream flushing are
/// explicit states: `push` returns finished lines, `finish` surfaces the
/// trailing line of a stream that ended without a newline.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line completed by it.
    /// Blank lines are dropped; a trailing `\r` is stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).into_owned();
            if !text.trim().is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Consumes the decoder, returning the unterminated final line if any.
    pub fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}
