//! Bolt functionality of the multilang binding
//!
//! A bolt consumes tuples, emits derived tuples anchored to its input and
//! acknowledges or fails what it consumed.

#[allow(clippy::module_inception)]
mod bolt;

pub use bolt::*;
