//! Line framing for captured stage output.
//!
//! Stage processes print whatever they like: partial UTF-8, carriage
//! returns from progress bars, or one enormous line of serialized data. The
//! supervisor must keep reading until EOF regardless, because a reader that
//! stops early leaves the pipe full and the child blocked on its next write.
//! [`StageLineCodec`] therefore never fails on content: bytes are decoded
//! lossily and lines over the limit are dropped with a warning.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use research_checkpoint::supervisor::line_codec::StageLineCodec;
//!
//! let lines = FramedRead::new(child_stdout, StageLineCodec::new());
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use crate::{AppError, Result};

/// Longest line forwarded to the supervisor: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited decoder for untrusted process output.
#[derive(Debug)]
pub struct StageLineCodec {
    max_length: usize,
    /// Skipping the remainder of an over-long line.
    discarding: bool,
    /// Offset already scanned for a newline in the current buffer.
    next_index: usize,
}

impl StageLineCodec {
    /// Codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec that drops lines longer than `max_length` bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            discarding: false,
            next_index: 0,
        }
    }

    /// Maximum accepted line length in bytes, excluding the terminator.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for StageLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StageLineCodec {
    type Item = String;
    type Error = AppError;

    /// Next complete line in `src`, or `Ok(None)` while buffering.
    ///
    /// Never returns `Err` for line content; only I/O errors from the
    /// underlying reader surface through `FramedRead`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            // Look one byte past the limit so a line of exactly `max_length`
            // bytes still finds its terminator.
            let read_to = src.len().min(self.max_length.saturating_add(1));
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(at)) => {
                    src.advance(at + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(at)) => {
                    self.next_index = 0;
                    let line = src.split_to(at + 1);
                    return Ok(Some(to_text(&line[..at])));
                }
                (false, None) if src.len() > self.max_length => {
                    warn!(
                        limit = self.max_length,
                        "stage output line exceeds limit, discarding"
                    );
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    /// Flush a trailing line that has no terminator.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(to_text(&rest)))
    }
}

fn to_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
