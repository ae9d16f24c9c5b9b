//! Entity scheduling.
//!
//! Every entity is a long-running task that blocks on streams. The
//! [`Scheduler`] trait hides how those tasks are run; [`ThreadScheduler`]
//! gives each entity its own OS thread and keeps a live-entity count so a
//! driver can wait for the network to wind down.

use std::fmt;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::metrics::RuntimeMetrics;

/// Body of an entity.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The kind of a spawned entity, used for naming and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A box wrapping user code.
    Box,
    /// A collector over a fixed set of inputs.
    CollectorStatic,
    /// A collector that grows through `collect` records.
    CollectorDynamic,
    /// The distribution input manager.
    InputManager,
    /// The distribution output manager.
    OutputManager,
}

impl EntityKind {
    /// Short name used in thread names.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Box => "box",
            Self::CollectorStatic => "coll-st",
            Self::CollectorDynamic => "coll-dyn",
            Self::InputManager => "input",
            Self::OutputManager => "output",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while spawning entities.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The entity's thread could not be created.
    #[error("Failed to spawn entity {name}: {message}")]
    SpawnFailed {
        /// Name of the entity.
        name: String,
        /// Error message
        message: String,
    },
}

/// Runs entity tasks.
pub trait Scheduler: Send + Sync {
    /// Starts `task` as an entity of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if the task cannot be started.
    fn spawn(&self, kind: EntityKind, name: &str, task: Task) -> Result<(), SchedulerError>;

    /// Returns the number of entities that have not returned yet.
    fn live(&self) -> usize;

    /// Blocks until every spawned entity has returned.
    fn wait_idle(&self);
}

#[derive(Default)]
struct LiveCount {
    count: Mutex<usize>,
    idle: Condvar,
}

impl LiveCount {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn exit(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

/// Decrements the live count when the entity returns or unwinds.
struct ExitGuard {
    live: Arc<LiveCount>,
    metrics: Arc<RuntimeMetrics>,
    name: String,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        RuntimeMetrics::incr(&self.metrics.entities_exited);
        if thread::panicking() {
            debug!(entity = %self.name, "entity unwound");
        } else {
            debug!(entity = %self.name, "entity exited");
        }
        self.live.exit();
    }
}

/// One OS thread per entity.
pub struct ThreadScheduler {
    stack_size: Option<usize>,
    live: Arc<LiveCount>,
    metrics: Arc<RuntimeMetrics>,
}

impl ThreadScheduler {
    /// Creates a scheduler using the stack size from `config`.
    #[must_use]
    pub fn new(config: &RuntimeConfig, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            stack_size: config.thread_stack_size,
            live: Arc::new(LiveCount::default()),
            metrics,
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn spawn(&self, kind: EntityKind, name: &str, task: Task) -> Result<(), SchedulerError> {
        let thread_name = format!("sn-{kind}-{name}");
        let mut builder = thread::Builder::new().name(thread_name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        self.live.enter();
        RuntimeMetrics::incr(&self.metrics.entities_spawned);
        let guard = ExitGuard {
            live: Arc::clone(&self.live),
            metrics: Arc::clone(&self.metrics),
            name: thread_name.clone(),
        };
        let spawned = builder.spawn(move || {
            let _guard = guard;
            task();
        });

        match spawned {
            Ok(_) => {
                debug!(entity = %thread_name, "entity spawned");
                Ok(())
            }
            Err(e) => {
                // The failed spawn dropped the guard, balancing the counters.
                Err(SchedulerError::SpawnFailed {
                    name: thread_name,
                    message: e.to_string(),
                })
            }
        }
    }

    fn live(&self) -> usize {
        *self.live.count.lock()
    }

    fn wait_idle(&self) {
        let mut count = self.live.count.lock();
        while *count > 0 {
            self.live.idle.wait(&mut count);
        }
    }
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("stack_size", &self.stack_size)
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}
