//! Destination assignment while a network is instantiated.
//!
//! Every node builds the same network description and walks it in the same
//! order, so each crossing of a node boundary gets the same destination id
//! on both sides without any negotiation. The walk carries a
//! [`RouteState`]: the node the current stream lives on and the next free
//! destination id.

use tracing::trace;

use super::{Destination, Node, NodeId};
use crate::record::Record;
use crate::stream::Stream;

/// Routing state threaded through network instantiation.
#[derive(Debug, Clone)]
pub struct RouteState {
    local: NodeId,
    counter: i32,
    saved: Vec<i32>,
    dest: Destination,
}

impl RouteState {
    /// Starts a walk on node `local` for a network whose input lives on
    /// node `origin`.
    #[must_use]
    pub fn new(local: NodeId, origin: NodeId) -> Self {
        Self {
            local,
            counter: 0,
            saved: Vec::new(),
            dest: Destination {
                node: origin,
                ..Destination::default()
            },
        }
    }

    /// Returns the current destination.
    #[must_use]
    #[inline]
    pub fn destination(&self) -> Destination {
        self.dest
    }

    /// Returns the node the current stream lives on.
    #[must_use]
    #[inline]
    pub fn location(&self) -> NodeId {
        self.dest.node
    }

    /// Moves the current stream to node `location`.
    ///
    /// Moving to another node takes the next destination id. If this node
    /// is the sender, `input` becomes an outgoing stream and `None` is
    /// returned: nothing downstream runs here. If this node is the
    /// receiver, a fresh stream is created when `input` is `None` and
    /// registered as incoming. Walks that neither send nor receive only
    /// record the new location.
    pub fn update(
        &mut self,
        node: &Node,
        input: Option<Stream<Record>>,
        location: NodeId,
    ) -> Option<Stream<Record>> {
        if self.dest.node == location {
            return input;
        }
        self.dest.dest = self.counter;
        self.counter += 1;

        if self.dest.node == self.local {
            self.dest.node = location;
            trace!(dest = %self.dest, "outgoing route");
            if let Some(stream) = input {
                node.new_out(self.dest, stream);
            }
            None
        } else if location == self.local {
            let stream = input.unwrap_or_else(|| Stream::new(node.config().stream_capacity));
            trace!(dest = %self.dest, "incoming route");
            node.new_in(self.dest, stream.clone());
            self.dest.node = location;
            Some(stream)
        } else {
            self.dest.node = location;
            input
        }
    }

    /// Enters a dynamic network instance, optionally nested in `parent`.
    ///
    /// Destination ids restart at zero inside the instance and resume on
    /// [`exit_dynamic`](Self::exit_dynamic).
    pub fn enter_dynamic(&mut self, parent: Option<(i32, i32)>) {
        self.saved.push(self.counter);
        self.counter = 0;
        if let Some((parent, index)) = parent {
            self.dest.parent = parent;
            self.dest.dynamic_index = index;
            self.dest.parent_node = self.local;
            self.dest.dynamic_loc = self.dest.node;
        }
    }

    /// Leaves the innermost dynamic network instance.
    pub fn exit_dynamic(&mut self) {
        self.counter = self.saved.pop().unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::distrib::MemoryFabric;
    use crate::metrics::RuntimeMetrics;
    use crate::reference::InterfaceRegistry;
    use std::sync::Arc;

    fn node(id: usize, fabric: &mut Vec<Option<crate::distrib::MemoryTransport>>) -> Arc<Node> {
        Node::new(
            RuntimeConfig::default(),
            Arc::new(fabric[id].take().unwrap()),
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        )
    }

    #[test]
    fn test_same_location_is_untouched() {
        let mut fabric: Vec<_> = MemoryFabric::build(1).into_iter().map(Some).collect();
        let n = node(0, &mut fabric);
        let mut route = RouteState::new(0, 0);
        let stream = Stream::new(2);
        let out = route.update(&n, Some(stream.clone()), 0).unwrap();
        assert!(out.same_stream(&stream));
        assert_eq!(route.destination(), Destination::default());
    }

    #[test]
    fn test_sender_and_receiver_agree_on_ids() {
        let mut fabric: Vec<_> = MemoryFabric::build(2).into_iter().map(Some).collect();
        let a = node(0, &mut fabric);
        let b = node(1, &mut fabric);

        let mut on_a = RouteState::new(0, 0);
        let mut on_b = RouteState::new(1, 0);

        assert!(on_a.update(&a, Some(Stream::new(1)), 1).is_none());
        assert!(on_b.update(&b, None, 1).is_some());
        assert_eq!(on_a.destination().dest, on_b.destination().dest);
        assert_eq!(on_a.location(), 1);
        assert_eq!(on_b.location(), 1);

        // Second crossing takes the next id.
        assert!(on_b.update(&b, Some(Stream::new(1)), 0).is_none());
        assert_eq!(on_b.destination().dest, 1);
    }

    #[test]
    fn test_dynamic_counters_nest() {
        let mut fabric: Vec<_> = MemoryFabric::build(2).into_iter().map(Some).collect();
        let a = node(0, &mut fabric);
        let mut route = RouteState::new(0, 0);
        route.update(&a, Some(Stream::new(1)), 1);
        route.enter_dynamic(Some((7, 2)));
        assert_eq!(route.destination().parent, 7);
        assert_eq!(route.destination().dynamic_index, 2);
        assert_eq!(route.destination().dynamic_loc, 1);
        assert_eq!(route.destination().parent_node, 0);
        route.update(&a, None, 0);
        assert_eq!(route.destination().dest, 0);
        route.exit_dynamic();
        route.update(&a, Some(Stream::new(1)), 1);
        assert_eq!(route.destination().dest, 1);
    }
}
