//! Client write path: the per-file coordinator and per-chunk state machines
//! that take application byte ranges to durable completion on the chunk
//! servers, under retries, lease renewal and credential rotation.
//!
//! The core ([`FileWriter`] and its per-chunk writers) is a deterministic,
//! single-threaded state machine: transports only accept ops, and the host
//! feeds completions and the current time back in. [`driver`] wraps the core
//! in a tokio task for hosts that want an async handle.

pub mod buffer;
mod chunk_writer;
pub mod config;
pub mod driver;
pub mod err;
pub mod file_writer;
pub mod monitor;
pub mod striper;
#[doc(hidden)]
pub mod testing;

pub use buffer::IoBuffer;
pub use config::WriterConfig;
pub use driver::{TransportEvent, WriterDriver, WriterHandle};
pub use err::{Error, Result};
pub use file_writer::{Completion, FileWriter, OpenParams, Stats};
pub use monitor::{ClientOpKind, LogMonitor, Monitor, NullMonitor};
pub use striper::{StripeLayout, Striper, StriperFactory, StriperKind, StriperSink};
