use thiserror::Error;

/// The main Result type used throughout the multilang binding
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by user-supplied component hooks. Anything that implements
/// [`std::error::Error`] converts into it with `?`, including [`Error`] itself.
///
/// The host is told the name of the fault along with its message. Boxed errors
/// carry no type name, so it is taken from [`NamedError`] when the hook wraps
/// its error in one, from [`Error::name`], `IoError` for [`std::io::Error`],
/// and otherwise from the leading identifier of the `Debug` output (`Error`
/// for plain strings).
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// A hook error with an explicit name for the fault report.
///
/// ```
/// use multilang::error::{HookError, NamedError};
///
/// let err: HookError = NamedError::new("ValueError", "count must be positive").into();
/// assert_eq!(err.to_string(), "count must be positive");
/// ```
#[derive(Debug)]
pub struct NamedError {
    name: String,
    source: HookError,
}

impl NamedError {
    pub fn new(name: impl Into<String>, source: impl Into<HookError>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for NamedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.source.fmt(f)
    }
}

impl std::error::Error for NamedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Result returned by user-supplied component hooks.
pub type HookResult = std::result::Result<(), HookError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// User-defined hook errors
    #[error("User Defined error: {0}")]
    UserDefinedError(String),

    /// Internal errors of the binding
    #[error("Internal error: {0}")]
    InternalError(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The peer sent more bytes or lines than allowed before the `end` sentinel.
    #[error("Channel overflow - {0}")]
    ChannelOverflow(String),

    /// Too many consecutive blank lines, the pipe to the host is most likely half-closed.
    #[error("Channel broken - {0}")]
    ChannelBroken(String),

    /// The input stream reached end-of-file before a sentinel was seen.
    #[error("Channel closed - the host has gone away")]
    ChannelClosed,

    #[error("Malformed handshake - {0}")]
    MalformedHandshake(String),

    /// A frame that is not valid JSON or does not have the expected shape.
    #[error("Malformed message - {0}")]
    MalformedMessage(String),

    #[error("I/O error - {0}")]
    Io(String),

    #[error("Spout Error - {0}")]
    SpoutError(ErrorKind),

    #[error("Bolt Error - {0}")]
    BoltError(ErrorKind),

    #[error("BatchingBolt Error - {0}")]
    BatchingBoltError(ErrorKind),

    #[error("Multilang Error - {0}")]
    DefaultError(ErrorKind),
}

impl Error {
    /// Short name of the fault, used as the exception name when the fault is
    /// reported to the host.
    pub fn name(&self) -> &'static str {
        match self {
            Error::ChannelOverflow(_) => "ChannelOverflow",
            Error::ChannelBroken(_) => "ChannelBroken",
            Error::ChannelClosed => "ChannelClosed",
            Error::MalformedHandshake(_) => "MalformedHandshake",
            Error::MalformedMessage(_) => "MalformedMessage",
            Error::Io(_) => "Io",
            Error::SpoutError(kind)
            | Error::BoltError(kind)
            | Error::BatchingBoltError(kind)
            | Error::DefaultError(kind) => match kind {
                ErrorKind::UserDefinedError(_) => "UserHookFault",
                ErrorKind::InternalError(_) => "InternalError",
            },
        }
    }

    /// Whether the error originates from a user hook. Such faults have
    /// already been reported to the host by the dispatch step that caught them.
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            Error::SpoutError(ErrorKind::UserDefinedError(_))
                | Error::BoltError(ErrorKind::UserDefinedError(_))
                | Error::BatchingBoltError(ErrorKind::UserDefinedError(_))
                | Error::DefaultError(ErrorKind::UserDefinedError(_))
        )
    }

    /// Whether the channel itself is unusable, in which case reporting over it is pointless.
    pub fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            Error::ChannelOverflow(_) | Error::ChannelBroken(_) | Error::ChannelClosed | Error::Io(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_fault_classification() {
        let err = Error::BoltError(ErrorKind::UserDefinedError("borked".into()));
        assert!(err.is_user_fault());
        assert!(!err.is_channel_fault());
        assert_eq!(err.name(), "UserHookFault");
        assert_eq!(err.to_string(), "Bolt Error - User Defined error: borked");

        let err = Error::ChannelBroken("20 blank lines".into());
        assert!(!err.is_user_fault());
        assert!(err.is_channel_fault());
        assert_eq!(err.name(), "ChannelBroken");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("pipe closed")));
    }
}
