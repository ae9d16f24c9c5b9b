//! # Streamnet Core
//!
//! Runtime for streaming dataflow networks: bounded streams connecting boxes
//! of user code, collectors that merge parallel branches, and a distributed
//! reference layer that moves record fields between nodes on demand.
//!
//! This crate provides:
//! - **Streams**: Bounded blocking FIFO channels with multi-stream polling
//! - **Records**: Data and control records with their wire form
//! - **References**: Reference-counted field values with single-fetch remote access
//! - **Entities**: Boxes, static and dynamic collectors, and their scheduler
//! - **Distribution**: Input and output managers over a pluggable transport
//!
//! ## Design Principles
//!
//! 1. **Backpressure by blocking** - A full stream blocks its writer, never errors
//! 2. **One owner per descriptor** - A stream has at most one reader and one writer
//! 3. **Counts, not pointers** - Shared data lives in tables keyed by `(node, id)`
//! 4. **Protocol violations are fatal** - Broken invariants log and panic
//!
//! ## Example
//!
//! ```rust,no_run
//! use streamnet_core::entity::{BoxContext, Network};
//! use streamnet_core::record::{DataRecord, Record};
//! use streamnet_core::RuntimeConfig;
//!
//! let net = Network::local(RuntimeConfig::default());
//! let input = net.stream(0);
//! let output = net
//!     .spawn_box("echo", &input, |ctx: &mut BoxContext<'_>| {
//!         if let Some(rec) = ctx.take_record() {
//!             ctx.emit(rec);
//!         }
//!     })
//!     .unwrap();
//!
//! let writer = input.open_writer();
//! let reader = output.open_reader();
//! writer.write(Record::from(DataRecord::default()));
//! writer.write(Record::terminate());
//! assert!(reader.read().as_data().is_some());
//! net.wait();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod distrib;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod record;
pub mod reference;
pub mod stream;

// Re-export key types
pub use config::RuntimeConfig;
pub use error::{fatal, Error, Result};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use record::{DataRecord, Record};
pub use stream::{Stream, StreamReader, StreamSet, StreamWriter};
