//! Faults raised by component hooks
//!
//! Hooks may fail by returning an error or by panicking. Both are caught at the
//! dispatch boundary and turned into a [`Fault`] that can be reported to the host.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures_util::FutureExt;

use crate::error::{Error, HookError, NamedError};
use crate::shared::panic::{payload_message, take_panic_info};

/// A failure of user code, ready to be reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Name of the fault, e.g. the error type or `panic`.
    pub name: String,
    pub message: String,
    pub backtrace: String,
}

impl Fault {
    pub fn from_error(err: &HookError) -> Self {
        let name = if let Some(e) = err.downcast_ref::<NamedError>() {
            e.name().to_string()
        } else if let Some(e) = err.downcast_ref::<Error>() {
            e.name().to_string()
        } else if err.is::<std::io::Error>() {
            "IoError".to_string()
        } else {
            debug_type_name(err)
        };
        Self {
            name,
            message: err.to_string(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let mut message = payload_message(payload.as_ref());
        let backtrace = match take_panic_info() {
            Some(info) => {
                if let Some(location) = info.location {
                    message = format!("{message} at {location}");
                }
                info.backtrace
            }
            None => Backtrace::force_capture().to_string(),
        };
        Self {
            name: "panic".to_string(),
            message,
            backtrace,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Leading identifier of the `Debug` output, which for most error types is the
/// type or variant name.
fn debug_type_name(err: &HookError) -> String {
    let debug = format!("{err:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}

/// Runs a hook future, turning errors and panics into a [`Fault`].
pub(crate) async fn guard<F, T>(hook: F) -> Result<T, Fault>
where
    F: Future<Output = Result<T, HookError>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Fault::from_error(&e)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

/// Same as [`guard`] for synchronous hooks.
pub(crate) fn guard_sync<F, T>(hook: F) -> Result<T, Fault>
where
    F: FnOnce() -> Result<T, HookError>,
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Fault::from_error(&e)),
        Err(payload) => Err(Fault::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[derive(Debug)]
    struct WordTooLong {
        len: usize,
    }

    impl fmt::Display for WordTooLong {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "word of {} characters", self.len)
        }
    }

    impl std::error::Error for WordTooLong {}

    #[tokio::test]
    async fn test_guard_passes_values_through() {
        let value = guard(async { Ok::<_, HookError>(5) }).await.unwrap();
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn test_guard_names_errors() {
        let fault = guard(async { Err::<(), HookError>(Box::new(WordTooLong { len: 90 })) })
            .await
            .unwrap_err();
        assert_eq!(fault.name, "WordTooLong");
        assert_eq!(fault.message, "word of 90 characters");
        assert!(!fault.backtrace.is_empty());

        let fault = guard(async { Err::<(), HookError>(Error::ChannelClosed.into()) })
            .await
            .unwrap_err();
        assert_eq!(fault.name, "ChannelClosed");

        let fault = guard(async {
            Err::<(), HookError>(Error::BoltError(ErrorKind::UserDefinedError("x".into())).into())
        })
        .await
        .unwrap_err();
        assert_eq!(fault.name, "UserHookFault");

        let fault = guard(async { Err::<(), HookError>("plain message".into()) })
            .await
            .unwrap_err();
        assert_eq!(fault.name, "Error");
        assert_eq!(fault.message, "plain message");
    }

    #[tokio::test]
    async fn test_guard_explicit_names() {
        let fault = guard(async {
            Err::<(), HookError>(NamedError::new("ValueError", "count must be positive").into())
        })
        .await
        .unwrap_err();
        assert_eq!(fault.name, "ValueError");
        assert_eq!(fault.message, "count must be positive");
        assert_eq!(fault.to_string(), "ValueError: count must be positive");

        let fault = guard(async {
            Err::<(), HookError>(NamedError::new("TooLong", WordTooLong { len: 3 }).into())
        })
        .await
        .unwrap_err();
        assert_eq!(fault.name, "TooLong");
        assert_eq!(fault.message, "word of 3 characters");

        let fault = guard(async {
            Err::<(), HookError>(
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such word list").into(),
            )
        })
        .await
        .unwrap_err();
        assert_eq!(fault.name, "IoError");
    }

    #[tokio::test]
    async fn test_guard_catches_panics() {
        let fault = guard(async {
            if true {
                panic!("index out of range");
            }
            Ok::<(), HookError>(())
        })
        .await
        .unwrap_err();
        assert_eq!(fault.name, "panic");
        assert!(fault.message.starts_with("index out of range"));
    }

    #[test]
    fn test_guard_sync() {
        assert_eq!(guard_sync(|| Ok::<_, HookError>("key")).unwrap(), "key");

        let fault = guard_sync(|| -> Result<(), HookError> { panic!("bad key") }).unwrap_err();
        assert_eq!(fault.name, "panic");
        assert_eq!(fault.to_string().split(" at ").next(), Some("panic: bad key"));
    }
}
