//! Batching bolt functionality of the multilang binding
//!
//! A batching bolt groups incoming tuples by key and processes each group at
//! once, either every few ticks or on its own timer.

#[allow(clippy::module_inception)]
mod batching;
mod batches;

pub use batching::*;
