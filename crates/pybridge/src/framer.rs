//! Byte-stream splitter that turns a raw stdout stream into whole JSON-bearing lines.
//!
//! [`Framer`] never parses JSON — a non-JSON line is emitted exactly like a valid one. It only
//! knows about line delimiters (`\n`, with an optional preceding `\r` stripped) and a maximum
//! line length. This mirrors `wrapper_events::reader::sync::SyncBoundedLineReader`'s
//! buffer/discard-mode state machine, reshaped as a push-based API so a [`crate::transport`]
//! reader task can feed it arbitrary-sized chunks as they arrive off a pipe.

use crate::error::FramerError;

/// Default cap on a single line, matching spec §4.2 (16 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Incremental line framer. Bytes are fed with [`Framer::push`]; each call returns zero or more
/// completed lines (or oversize-line errors) found in that chunk, in order.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    max_line_length: usize,
    discarding: bool,
}

impl Framer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_length,
            discarding: false,
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    /// Feeds `chunk` into the framer, returning the lines (and any oversize-line errors)
    /// completed as a result. A `LineTooLong` error does not poison the framer itself — it
    /// resets the buffer and keeps consuming, per spec §4.2 ("does not attempt to resync
    /// mid-line" refers to the *current* line only; the framer recovers cleanly at the next
    /// delimiter). Whether the enclosing Transport additionally quarantines the worker is a
    /// Protocol-layer decision, not this one's.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, FramerError>> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                    self.buffer.clear();
                    out.push(Err(FramerError::LineTooLong {
                        max_line_length: self.max_line_length,
                    }));
                    continue;
                }
                let mut line = std::mem::take(&mut self.buffer);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                out.push(Ok(line));
                continue;
            }

            if self.discarding {
                continue;
            }

            self.buffer.push(byte);
            if self.buffer.len() > self.max_line_length {
                self.discarding = true;
                self.buffer.clear();
            }
        }
        out
    }

    /// Bytes buffered for an as-yet-unterminated line. Exposed for diagnostics (e.g. attaching
    /// a truncated tail to a disposal error) — never treated as a complete message.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_only(events: Vec<Result<Vec<u8>, FramerError>>) -> Vec<String> {
        events
            .into_iter()
            .map(|e| String::from_utf8(e.expect("expected Ok line")).unwrap())
            .collect()
    }

    #[test]
    fn emits_single_line() {
        let mut framer = Framer::new(1024);
        let out = framer.push(b"hello\n");
        assert_eq!(lines_only(out), vec!["hello"]);
    }

    #[test]
    fn strips_trailing_carriage_return() {
        let mut framer = Framer::new(1024);
        let out = framer.push(b"hello\r\n");
        assert_eq!(lines_only(out), vec!["hello"]);
    }

    #[test]
    fn preserves_partial_reads_across_chunks() {
        let mut framer = Framer::new(1024);
        assert!(framer.push(b"hel").is_empty());
        assert!(framer.push(b"lo wor").is_empty());
        let out = framer.push(b"ld\n");
        assert_eq!(lines_only(out), vec!["hello world"]);
    }

    #[test]
    fn emits_multiple_lines_from_one_chunk() {
        let mut framer = Framer::new(1024);
        let out = framer.push(b"a\nb\nc\n");
        assert_eq!(lines_only(out), vec!["a", "b", "c"]);
    }

    #[test]
    fn oversize_line_emits_error_and_recovers() {
        let mut framer = Framer::new(4);
        let out = framer.push(b"toolong\nshort\n");
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(FramerError::LineTooLong { max_line_length: 4 })));
        assert_eq!(out[1].as_ref().unwrap(), b"short");
    }

    #[test]
    fn oversize_line_split_across_chunks_still_recovers() {
        let mut framer = Framer::new(4);
        assert!(framer.push(b"too").is_empty());
        let out = framer.push(b"long\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(FramerError::LineTooLong { .. })));
        let out2 = framer.push(b"next\n");
        assert_eq!(lines_only(out2), vec!["next"]);
    }

    #[test]
    fn empty_lines_are_emitted() {
        let mut framer = Framer::new(1024);
        let out = framer.push(b"\n\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), b"");
    }

    #[test]
    fn pending_exposes_unterminated_buffer() {
        let mut framer = Framer::new(1024);
        framer.push(b"partial");
        assert_eq!(framer.pending(), b"partial");
    }
}
