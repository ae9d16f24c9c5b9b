//! Wiring of one node of a distributed run.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use super::input::{DynamicRouter, InputManager, InputShared};
use super::output::{OutputControl, OutputManager};
use super::{Destination, DistribError, Link, NodeId, Transport};
use crate::config::RuntimeConfig;
use crate::entity::{EntityKind, Scheduler, SchedulerError};
use crate::metrics::RuntimeMetrics;
use crate::record::Record;
use crate::reference::{InterfaceRegistry, ReferenceTable};
use crate::stream::Stream;

/// One node: its link, reference table and the shared state of its input
/// and output managers.
pub struct Node {
    config: RuntimeConfig,
    link: Arc<Link>,
    table: Arc<ReferenceTable>,
    input: Arc<InputShared>,
    output: Arc<OutputControl>,
    metrics: Arc<RuntimeMetrics>,
}

impl Node {
    /// Creates a node over `transport`.
    ///
    /// The node id is taken from the transport; a different `node_id` in
    /// `config` is overridden.
    #[must_use]
    pub fn new(
        mut config: RuntimeConfig,
        transport: Arc<dyn Transport>,
        interfaces: Arc<InterfaceRegistry>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Arc<Self> {
        let node = transport.node_id();
        if config.node_id != node {
            warn!(
                configured = config.node_id,
                transport = node,
                "node id taken from transport"
            );
            config.node_id = node;
        }
        let link = Arc::new(Link::new(
            transport,
            Arc::clone(&interfaces),
            Arc::clone(&metrics),
        ));
        let table = ReferenceTable::new(
            node,
            interfaces,
            Arc::clone(&link) as Arc<dyn crate::reference::RefChannel>,
            Arc::clone(&metrics),
        );
        let input = InputShared::new(Arc::clone(&link));
        let output = OutputControl::new(config.wakeup_stream_capacity);
        Arc::new(Self {
            config,
            link,
            table,
            input,
            output,
            metrics,
        })
    }

    /// Spawns the input and output managers on `scheduler`.
    ///
    /// `router` is consulted for records addressed to destinations that
    /// have not been registered yet.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if either manager cannot be spawned.
    pub fn start(
        &self,
        scheduler: &dyn Scheduler,
        router: Option<DynamicRouter>,
    ) -> Result<(), SchedulerError> {
        let name = format!("n{}", self.node_id());
        let output = OutputManager::new(
            Arc::clone(&self.output),
            Arc::clone(&self.link),
            Arc::clone(&self.metrics),
        );
        scheduler.spawn(EntityKind::OutputManager, &name, Box::new(move || output.run()))?;

        let input = InputManager::new(
            Arc::clone(&self.input),
            Arc::clone(&self.table),
            Arc::clone(&self.output),
            Arc::clone(&self.metrics),
            router,
        );
        if let Err(e) = scheduler.spawn(EntityKind::InputManager, &name, Box::new(move || input.run())) {
            self.output.stop();
            return Err(e);
        }
        info!(node = self.node_id(), nodes = self.link.node_count(), "node started");
        Ok(())
    }

    /// Returns this node's id.
    #[must_use]
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the node configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Returns the reference table.
    #[must_use]
    pub fn table(&self) -> &Arc<ReferenceTable> {
        &self.table
    }

    /// Returns the outbound link.
    #[must_use]
    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Returns the node's metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Registers `stream` as the receiving end of `dest`.
    pub fn new_in(&self, dest: Destination, stream: Stream<Record>) {
        self.input.new_in(dest, stream);
    }

    /// Registers `stream` as the sending end of `dest`.
    pub fn new_out(&self, dest: Destination, stream: Stream<Record>) {
        self.output.new_out(dest, stream);
    }

    /// Stops the managers of every node.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure.
    pub fn global_stop(&self) -> Result<(), DistribError> {
        info!(node = self.node_id(), "global stop");
        self.link.global_stop()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node", &self.node_id())
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distrib::MemoryFabric;
    use crate::entity::ThreadScheduler;

    #[test]
    fn test_node_id_comes_from_transport() {
        let mut fabric = MemoryFabric::build(3);
        let transport = fabric.remove(2);
        let node = Node::new(
            RuntimeConfig::default(),
            Arc::new(transport),
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        );
        assert_eq!(node.node_id(), 2);
        assert_eq!(node.config().node_id, 2);
        assert_eq!(node.table().node(), 2);
    }

    #[test]
    fn test_start_and_global_stop() {
        let metrics = Arc::new(RuntimeMetrics::new());
        let scheduler = ThreadScheduler::new(&RuntimeConfig::default(), Arc::clone(&metrics));
        let nodes: Vec<_> = MemoryFabric::build(2)
            .into_iter()
            .map(|transport| {
                Node::new(
                    RuntimeConfig::default(),
                    Arc::new(transport),
                    Arc::new(InterfaceRegistry::new()),
                    Arc::clone(&metrics),
                )
            })
            .collect();
        for node in &nodes {
            node.start(&scheduler, None).unwrap();
        }
        assert_eq!(scheduler.live(), 4);
        nodes[1].global_stop().unwrap();
        scheduler.wait_idle();
        assert_eq!(metrics.snapshot().live_entities(), 0);
    }
}
