//! Shared service traits for consistent patterns across the component roles
//! Currently only ServiceError trait is implemented
//!

use crate::error::{Error, ErrorKind};

/// Trait for consistent error construction across the component roles
///
/// Each role server implements it so that errors carry the role they were
/// raised in. This is an internal trait used only by the role implementations.
pub(crate) trait ServiceError {
    /// Get the service name for error context
    fn service_name() -> &'static str;

    /// Create a user-defined hook error
    fn user_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::UserDefinedError(message.into()))
    }

    /// Create an internal service error
    fn internal_error(message: impl Into<String>) -> Error {
        Self::wrap(ErrorKind::InternalError(message.into()))
    }

    #[doc(hidden)]
    fn wrap(kind: ErrorKind) -> Error {
        match Self::service_name() {
            "spout" => Error::SpoutError(kind),
            "bolt" => Error::BoltError(kind),
            "batchingbolt" => Error::BatchingBoltError(kind),
            _ => Error::DefaultError(kind),
        }
    }
}
