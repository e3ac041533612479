//! Framed message channel
//!
//! Every message is a single line of JSON followed by a line containing only
//! `end`. Reads accumulate lines until the sentinel arrives and enforce the
//! limits of [`FrameConfig`], which protect the worker against a dead or
//! half-closed pipe to the host.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The line terminating every framed message.
pub const SENTINEL: &str = "end";

/// Default maximum number of bytes read before the sentinel (16MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum number of lines read before the sentinel.
pub const DEFAULT_MAX_MESSAGE_LINES: usize = 100;

/// Default maximum number of consecutive blank lines.
pub const DEFAULT_MAX_BLANK_LINES: usize = 20;

/// Limits applied while reading a single framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub max_message_size: usize,
    pub max_message_lines: usize,
    pub max_blank_lines: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_message_lines: DEFAULT_MAX_MESSAGE_LINES,
            max_blank_lines: DEFAULT_MAX_BLANK_LINES,
        }
    }
}

/// Reads whole messages from a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    config: FrameConfig,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Reads the next message. Lines are joined back with `\n` before being
    /// parsed, so a payload split over several lines is reassembled.
    pub async fn read_message(&mut self) -> Result<Value> {
        let mut lines: Vec<String> = Vec::new();
        let mut message_size = 0usize;
        let mut blank_lines = 0usize;

        loop {
            let budget = self
                .config
                .max_message_size
                .saturating_sub(message_size)
                .max(SENTINEL.len());
            let line = self.read_line(budget).await?;
            if line == SENTINEL {
                break;
            }

            message_size += line.len();
            if message_size > self.config.max_message_size {
                return Err(Self::overflow_by_size(self.config.max_message_size));
            }

            if line.is_empty() {
                blank_lines += 1;
                warn!(
                    line = lines.len() + 1,
                    blank_lines, "Blank line read, pipe to the host may be broken"
                );
                if blank_lines > self.config.max_blank_lines {
                    return Err(Error::ChannelBroken(format!(
                        "{} consecutive blank lines received, assuming the pipe to the host is broken",
                        blank_lines
                    )));
                }
            } else {
                blank_lines = 0;
            }

            lines.push(line);
            if lines.len() > self.config.max_message_lines {
                return Err(Error::ChannelOverflow(format!(
                    "message exceeds {} lines",
                    self.config.max_message_lines
                )));
            }
        }

        let message = lines.join("\n");
        debug!(message = %message, "Read message from host");
        serde_json::from_str(&message)
            .map_err(|e| Error::MalformedMessage(format!("invalid JSON frame: {e}")))
    }

    /// Reads one line without its trailing newline, refusing to buffer more
    /// than `budget` bytes. End-of-stream before a newline means the host is gone.
    async fn read_line(&mut self, budget: usize) -> Result<String> {
        let mut buf = Vec::new();
        loop {
            let (done, used) = {
                let available = self.inner.fill_buf().await?;
                if available.is_empty() {
                    return Err(Error::ChannelClosed);
                }
                match available.iter().position(|b| *b == b'\n') {
                    Some(i) => {
                        buf.extend_from_slice(&available[..i]);
                        (true, i + 1)
                    }
                    None => {
                        buf.extend_from_slice(available);
                        (false, available.len())
                    }
                }
            };
            self.inner.consume(used);

            if buf.len() > budget {
                return Err(Self::overflow_by_size(self.config.max_message_size));
            }
            if done {
                break;
            }
        }

        String::from_utf8(buf).map_err(|e| Error::MalformedMessage(format!("frame is not UTF-8: {e}")))
    }

    fn overflow_by_size(max: usize) -> Error {
        Error::ChannelOverflow(format!("message exceeds {max} bytes"))
    }
}

/// Writes whole messages to a byte stream, flushing after each one.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_message<T>(&mut self, message: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        // serde_json escapes control characters, the encoding never contains a raw newline
        let mut frame = serde_json::to_vec(message)
            .map_err(|e| Error::MalformedMessage(format!("message is not serializable: {e}")))?;
        debug!(message = %String::from_utf8_lossy(&frame), "Sending message to host");
        frame.push(b'\n');
        frame.extend_from_slice(SENTINEL.as_bytes());
        frame.push(b'\n');

        self.inner.write_all(&frame).await.map_err(Self::write_error)?;
        self.inner.flush().await.map_err(Self::write_error)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn write_error(e: std::io::Error) -> Error {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe => Error::ChannelClosed,
            _ => Error::Io(e.to_string()),
        }
    }
}
