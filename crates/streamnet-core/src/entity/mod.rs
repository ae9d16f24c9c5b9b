//! # Entities
//!
//! The long-running tasks of a network: boxes running user code and
//! collectors merging parallel branches. Entities only ever talk to each
//! other through streams.
//!
//! ## Module Structure
//!
//! - [`scheduler`]: The scheduler trait and the thread-per-entity scheduler
//! - [`boxes`]: Box entities and the handle passed to user code
//! - [`collector`]: Static and dynamic collectors
//! - [`network`]: The builder context that spawns entities

pub mod boxes;
pub mod collector;
pub mod network;
pub mod scheduler;

pub use boxes::{BoxContext, BoxEntity, BoxFn};
pub use collector::{Collector, CollectorMode};
pub use network::Network;
pub use scheduler::{EntityKind, Scheduler, SchedulerError, Task, ThreadScheduler};
