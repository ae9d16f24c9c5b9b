//! Builder context for wiring entities into a running network.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::boxes::{BoxEntity, BoxFn};
use super::collector::{Collector, CollectorMode};
use super::scheduler::{EntityKind, Scheduler, ThreadScheduler};
use crate::config::RuntimeConfig;
use crate::distrib::Node;
use crate::error::Result;
use crate::metrics::RuntimeMetrics;
use crate::record::Record;
use crate::reference::{InterfaceRegistry, ReferenceTable};
use crate::stream::Stream;

/// Holds what every entity needs: configuration, scheduler, reference
/// table and metrics.
///
/// Each `spawn_*` method opens the descriptors of its input streams, creates
/// the output stream and starts the entity.
pub struct Network {
    config: RuntimeConfig,
    scheduler: Arc<dyn Scheduler>,
    table: Arc<ReferenceTable>,
    metrics: Arc<RuntimeMetrics>,
    next_entity: AtomicUsize,
}

impl Network {
    /// Creates a network context from its parts.
    #[must_use]
    pub fn new(
        config: RuntimeConfig,
        scheduler: Arc<dyn Scheduler>,
        table: Arc<ReferenceTable>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            config,
            scheduler,
            table,
            metrics,
            next_entity: AtomicUsize::new(0),
        }
    }

    /// Creates a single-node network on a [`ThreadScheduler`].
    #[must_use]
    pub fn local(config: RuntimeConfig) -> Self {
        let metrics = Arc::new(RuntimeMetrics::new());
        let scheduler = Arc::new(ThreadScheduler::new(&config, Arc::clone(&metrics)));
        let table = ReferenceTable::local(Arc::new(InterfaceRegistry::new()), Arc::clone(&metrics));
        Self::new(config, scheduler, table, metrics)
    }

    /// Creates the network context of a distributed node.
    #[must_use]
    pub fn on_node(node: &Node, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::new(
            node.config().clone(),
            scheduler,
            Arc::clone(node.table()),
            Arc::clone(node.metrics()),
        )
    }

    /// Creates a stream; a `capacity` of 0 selects the configured default.
    #[must_use]
    pub fn stream(&self, capacity: usize) -> Stream<Record> {
        Stream::new(self.config.effective_capacity(capacity))
    }

    /// Starts a box reading `input` and returns its output stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`](crate::Error::Scheduler) if the entity
    /// cannot be spawned.
    ///
    /// # Panics
    ///
    /// If `input` already has an open reader.
    pub fn spawn_box<F: BoxFn>(
        &self,
        name: &str,
        input: &Stream<Record>,
        func: F,
    ) -> Result<Stream<Record>> {
        let output = self.stream(0);
        let entity = BoxEntity::new(
            name,
            input.open_reader(),
            output.open_writer(),
            func,
            Arc::clone(&self.table),
            Arc::clone(&self.metrics),
        );
        self.spawn(EntityKind::Box, name, Box::new(move || entity.run()))?;
        Ok(output)
    }

    /// Starts a collector over a fixed set of inputs and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`](crate::Error::Scheduler) if the entity
    /// cannot be spawned.
    pub fn collector_static(&self, inputs: &[Stream<Record>]) -> Result<Stream<Record>> {
        self.collector(CollectorMode::Static, inputs)
    }

    /// Starts a collector that grows through `collect` records arriving on
    /// `input`, and returns its output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Scheduler`](crate::Error::Scheduler) if the entity
    /// cannot be spawned.
    pub fn collector_dynamic(&self, input: &Stream<Record>) -> Result<Stream<Record>> {
        self.collector(CollectorMode::Dynamic, std::slice::from_ref(input))
    }

    fn collector(&self, mode: CollectorMode, inputs: &[Stream<Record>]) -> Result<Stream<Record>> {
        let output = self.stream(0);
        let collector = Collector::new(
            mode,
            inputs.iter().map(Stream::open_reader).collect(),
            output.open_writer(),
            Arc::clone(&self.metrics),
        );
        let kind = match mode {
            CollectorMode::Static => EntityKind::CollectorStatic,
            CollectorMode::Dynamic => EntityKind::CollectorDynamic,
        };
        self.spawn(kind, "", Box::new(move || collector.run()))?;
        Ok(output)
    }

    fn spawn(&self, kind: EntityKind, name: &str, task: super::Task) -> Result<()> {
        let seq = self.next_entity.fetch_add(1, Ordering::Relaxed);
        let name = if name.is_empty() {
            seq.to_string()
        } else {
            format!("{name}-{seq}")
        };
        self.scheduler.spawn(kind, &name, task)?;
        Ok(())
    }

    /// Blocks until every entity started on the scheduler has returned.
    pub fn wait(&self) {
        self.scheduler.wait_idle();
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the reference table.
    #[must_use]
    pub fn table(&self) -> &Arc<ReferenceTable> {
        &self.table
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("config", &self.config)
            .field("live", &self.scheduler.live())
            .finish_non_exhaustive()
    }
}
