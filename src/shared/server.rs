//! Server configuration and process wiring
//!
//! This module provides the configuration shared by all role servers and the
//! setup a worker needs before talking to the host over its standard streams:
//! logging to stderr and the stdout redirection.

use std::io;

use tokio::io::DuplexStream;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use crate::shared::channel::FrameConfig;
use crate::shared::stdio::{redirect_stdout, stdin_reader};

/// Default capacity of the queue between the reader task and the runtime
const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Common server configuration that all roles share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    frame: FrameConfig,
    channel_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            frame: FrameConfig::default(),
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }

    /// Set the maximum number of bytes a single message may span before its `end` line. Default value is 16MB.
    pub fn with_max_message_size(mut self, message_size: usize) -> Self {
        self.frame.max_message_size = message_size;
        self
    }

    /// Get the maximum number of bytes a single message may span. Default value is 16MB.
    pub fn max_message_size(&self) -> usize {
        self.frame.max_message_size
    }

    /// Set the maximum number of lines a single message may span. Default value is 100.
    pub fn with_max_message_lines(mut self, lines: usize) -> Self {
        self.frame.max_message_lines = lines;
        self
    }

    /// Get the maximum number of lines a single message may span. Default value is 100.
    pub fn max_message_lines(&self) -> usize {
        self.frame.max_message_lines
    }

    /// Set how many consecutive blank lines are tolerated before the pipe is considered broken. Default value is 20.
    pub fn with_max_blank_lines(mut self, lines: usize) -> Self {
        self.frame.max_blank_lines = lines;
        self
    }

    /// Get how many consecutive blank lines are tolerated. Default value is 20.
    pub fn max_blank_lines(&self) -> usize {
        self.frame.max_blank_lines
    }

    /// Set how many decoded messages may be buffered ahead of the component. Default value is 64.
    pub fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    pub fn channel_size(&self) -> usize {
        self.channel_size
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        self.frame
    }
}

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`).
/// A subscriber installed by the application takes precedence.
pub(crate) fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Prepares the process for serving over its standard streams and returns the
/// protocol's input and output. Must be called from within a tokio runtime.
pub(crate) fn stdio_transport() -> io::Result<(DuplexStream, tokio::fs::File)> {
    init_logging();
    let output = redirect_stdout()?;
    let input = stdin_reader(Handle::current())?;
    Ok((input, tokio::fs::File::from_std(output)))
}
