//! Component runtime
//!
//! The runtime owns the channel to the host and provides the primitives every
//! component uses: emit, ack, fail, log and fault reporting. The host
//! multiplexes commands and the task id replies to emits over the same
//! channel, the runtime keeps one queue for each so neither reader loses
//! messages meant for the other.

mod fault;
#[allow(clippy::module_inception)]
mod runtime;

pub use fault::Fault;
pub(crate) use fault::{guard, guard_sync};
pub(crate) use runtime::{serve, Dispatch};
pub use runtime::{Emission, Runtime};
