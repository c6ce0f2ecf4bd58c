//! Bounded-wait line reader over a child's output stream.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest line held in memory. Longer runs of bytes without a newline are
/// delivered in pieces of this size.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Result of one bounded read.
#[derive(Debug)]
pub enum ReadEvent {
    /// A complete line, without its trailing `\n` / `\r\n`.
    Line(String),
    /// No complete line arrived before the deadline.
    Timeout,
    /// End of output.
    Closed,
    /// The stream failed. The reader is closed afterwards.
    Error(io::Error),
}

/// Pulls one line at a time with a deadline.
///
/// Bytes of a line that has not been terminated yet survive a timeout and are
/// completed by the next call, so no output is lost between polls.
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
    closed: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Wait at most `max_wait` for the next line. `Duration::ZERO` polls once
    /// without waiting.
    pub async fn next_line(&mut self, max_wait: Duration) -> ReadEvent {
        if self.closed {
            return ReadEvent::Closed;
        }

        let result = tokio::time::timeout(max_wait, self.fill_pending()).await;
        match result {
            Err(_elapsed) => ReadEvent::Timeout,
            Ok(Err(e)) => {
                self.closed = true;
                ReadEvent::Error(e)
            }
            Ok(Ok(true)) => ReadEvent::Line(self.take_line()),
            Ok(Ok(false)) => {
                self.closed = true;
                match self.take_partial() {
                    Some(line) => ReadEvent::Line(line),
                    None => ReadEvent::Closed,
                }
            }
        }
    }

    /// Move bytes into `pending` up to and including the next newline, or
    /// until `MAX_LINE_BYTES` are held. Returns `false` at end of output.
    ///
    /// Bytes are consumed from the inner reader only once they are in
    /// `pending`, so dropping this future loses nothing.
    async fn fill_pending(&mut self) -> io::Result<bool> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(false);
            }
            let room = MAX_LINE_BYTES.saturating_sub(self.pending.len());
            let (used, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) if i < room => (i + 1, true),
                _ if available.len() >= room => (room, true),
                _ => (available.len(), false),
            };
            self.pending.extend_from_slice(&available[..used]);
            self.inner.consume(used);
            if done {
                return Ok(true);
            }
        }
    }

    /// Bytes of an unterminated line read so far, if any.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
