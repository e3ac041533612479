//! Panic handling utilities
//!
//! A panic inside a component hook is caught at the dispatch boundary and
//! reported to the host like any other fault. The payload only carries the
//! message, so a panic hook records where the panic happened and the
//! backtrace at that point for the report to pick up.

use std::backtrace::Backtrace;
use std::panic;
use std::sync::{Mutex, Once};

/// Latest panic seen by the hook
static PANIC_INFO: Mutex<Option<PanicInfo>> = Mutex::new(None);

static INIT_PANIC_HOOK: Once = Once::new();

/// Panic information captured by the panic hook
#[derive(Clone, Debug)]
pub struct PanicInfo {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: String,
}

/// Installs the panic hook. Only the first call per process has an effect.
pub(crate) fn init_panic_hook() {
    INIT_PANIC_HOOK.call_once(|| {
        panic::set_hook(Box::new(|panic_info| {
            let message = payload_message(panic_info.payload());
            let location = panic_info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));

            // must be captured here, the stack is unwound by the time the fault is reported
            let backtrace = Backtrace::force_capture();

            if let Ok(mut panic_storage) = PANIC_INFO.lock() {
                *panic_storage = Some(PanicInfo {
                    message,
                    location,
                    backtrace: backtrace.to_string(),
                });
            }
        }));
    });
}

/// Takes the stored panic information, leaving nothing behind for the next panic.
pub(crate) fn take_panic_info() -> Option<PanicInfo> {
    PANIC_INFO.lock().ok().and_then(|mut guard| guard.take())
}

/// Extracts the message of a panic payload.
pub(crate) fn payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(payload_message(payload.as_ref()), "static message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("formatted {}", 42));
        assert_eq!(payload_message(payload.as_ref()), "formatted 42");

        let payload: Box<dyn std::any::Any + Send> = Box::new(17u8);
        assert_eq!(payload_message(payload.as_ref()), "Unknown panic");
    }

    #[test]
    fn test_panic_hook_captures_location() {
        init_panic_hook();

        let result = std::panic::catch_unwind(|| {
            panic!("hook test panic");
        });
        assert!(result.is_err());

        // other tests may panic concurrently, only assert on what this one left behind
        if let Some(info) = take_panic_info() {
            if info.message == "hook test panic" {
                assert!(info.location.unwrap().contains("panic.rs"));
                assert!(!info.backtrace.is_empty());
            }
        }
    }
}
