//! Newline framing for the engine's output stream.
//!
//! Works as a [`Decoder`] under `FramedRead` (one framer per engine process)
//! and as a push-style [`LineFramer::feed`] for callers holding raw chunks.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Splits a byte stream on `\n`, retaining the trailing partial segment.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Bytes of the decode source already searched for a newline.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(line) = self.next_line(&mut buffer) {
            lines.push(line);
        }
        self.buffer = buffer;
        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Flush the unterminated tail, if any. Used at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn next_line(&mut self, src: &mut BytesMut) -> Option<String> {
        match src[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.scanned + offset;
                let mut line = src.split_to(end + 1);
                line.truncate(end);
                self.scanned = 0;
                Some(String::from_utf8_lossy(&line).into_owned())
            }
            None => {
                self.scanned = src.len();
                None
            }
        }
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_line(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.next_line(src) {
            return Ok(Some(line));
        }
        self.scanned = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        tracing::debug!(bytes = rest.len(), "Flushing unterminated line at end of stream");
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}
