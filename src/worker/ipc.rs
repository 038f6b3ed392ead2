//! Buffered IPC primitives for worker communication.
//!
//! Line-based async I/O over the worker's pipes, plus a capped tail of
//! recent output lines kept for crash diagnostics.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Lines kept per stream for diagnostics.
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Longest single line kept in a tail; longer lines are truncated.
const MAX_TAIL_LINE_LEN: usize = 2048;

/// Buffered line reader for IPC.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Read one line without its terminator.
    ///
    /// Returns `None` on EOF. A trailing line without newline is still returned.
    /// Partially read bytes stay buffered if the future is dropped, so the
    /// next call picks up where this one stopped.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buffer).await?;
        if read == 0 && self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer.ends_with(b"\n") {
            self.buffer.pop();
        }
        if self.buffer.ends_with(b"\r") {
            self.buffer.pop();
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Ok(Some(line))
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await
    }
}

/// Capped ring buffer of the most recent lines of a stream.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_TAIL_LINES)),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        let mut line = line.to_string();
        if line.len() > MAX_TAIL_LINE_LEN {
            let mut cut = MAX_TAIL_LINE_LEN;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str("...");
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LINES)
    }
}
