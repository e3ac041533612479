//! Spout functionality of the multilang binding
//!
//! A spout is the source of a topology. It emits tuples when the host asks for
//! them and learns about the outcome of the tuples it emitted with an id.

#[allow(clippy::module_inception)]
mod spout;

pub use spout::*;
