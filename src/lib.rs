//! A Rust binding for the [Apache Storm] multilang protocol.
//!
//! Storm runs non-JVM components as subprocesses and talks to them over their
//! standard input and output with newline delimited JSON messages, each one
//! terminated by a line containing `end`. This crate implements that protocol:
//! the handshake, the command loop and the emit/ack/fail primitives for
//! [Spouts], [Bolts] and [Batching Bolts].
//!
//! ```no_run
//! use multilang::bolt::{self, Bolt};
//! use multilang::error::HookResult;
//! use multilang::runtime::{Emission, Runtime};
//! use multilang::shared::Tuple;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Bolt for Echo {
//!     async fn process(&mut self, tup: &Tuple, runtime: &mut Runtime) -> HookResult {
//!         runtime.emit(Emission::new(tup.values.clone())).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> multilang::error::Result<()> {
//!     bolt::Server::new(Echo).start().await
//! }
//! ```
//!
//! [Apache Storm]: https://storm.apache.org/
//! [Spouts]: spout::Spout
//! [Bolts]: bolt::Bolt
//! [Batching Bolts]: batching::BatchingBolt

/// framing, handshake, configuration and the types shared by all roles
pub mod shared;

/// runtime shared by all roles, the channel to the host and its primitives.
pub mod runtime;

/// spout is for writing [spouts](https://storm.apache.org/releases/current/Concepts.html#spouts), the sources of a topology.
pub mod spout;

/// bolt is for writing [bolts](https://storm.apache.org/releases/current/Concepts.html#bolts) that process tuples one at a time.
pub mod bolt;

/// batching is for writing bolts that process tuples in groups.
pub mod batching;

// Error handling in the multilang binding!
//
// A worker crash is total. Any error ends the dispatch loop and the process is expected to exit with
// a non-zero status, the host restarts the worker and replays failed or timed out tuples from the spouts.
// Nothing is retried here.
//
// Error flow.
//
//      (host)
//        |
//        v
//   (reader task) ---mpsc(Result<Value>)---> (runtime) ---> (role service) ---> (user hook)
//                                                ^                 |                  |
//                                                |                 |   error/panic    |
//                                                |                 +<-----------------+
//                                                |                 |
//                                                +---- report -----+
//
// The reader task forwards the first channel error (overflow, broken pipe, end of stream) and stops.
// A failing user hook is reported by the role service as `error` + `sync`, the in-flight tuples are failed
// when auto-fail is on, and the error is returned. Every other error is reported best-effort at the top of
// the loop, except a malformed handshake which is never reported since the host does not listen yet.

/// error module
pub mod error;
