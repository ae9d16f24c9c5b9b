//! # Distribution
//!
//! Moves records and reference traffic between nodes.
//!
//! ## Architecture
//!
//! ```text
//!            node A                                 node B
//!  ┌──────────────────────────┐          ┌──────────────────────────┐
//!  │ entity ─▶ outgoing stream │          │ incoming stream ─▶ entity │
//!  │            │              │          │        ▲                  │
//!  │     output manager ───────┼─ record ─┼─▶ input manager           │
//!  │            ▲              │          │        │                  │
//!  │            └── block ◀────┼──────────┼────────┘ (backlog)        │
//!  └──────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Each node runs one input manager, which owns all inbound traffic, and
//! one output manager, which drains the streams that leave the node.
//!
//! ## Module Structure
//!
//! - [`transport`]: The frame transport trait and the in-memory fabric
//! - [`message`]: Message types and their wire form
//! - [`input`]: The input manager entity
//! - [`output`]: The output manager entity
//! - [`route`]: Destination assignment while a network is built
//! - [`node`]: Wiring of one node

pub mod input;
pub mod message;
pub mod node;
pub mod output;
pub mod route;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::fatal;
use crate::metrics::RuntimeMetrics;
use crate::record::codec::CodecError;
use crate::record::Record;
use crate::reference::{FieldValue, InterfaceId, InterfaceRegistry, RefChannel, RefKey};

pub use message::{CommTag, Message};
pub use node::Node;
pub use route::RouteState;
pub use transport::{MemoryFabric, MemoryTransport, Transport};

/// Identifies a node of a distributed run.
pub type NodeId = i32;

/// Consumer-side endpoint of a stream crossing a node boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Destination {
    /// Node at the other end of the link.
    pub node: NodeId,
    /// Per-network endpoint number.
    pub dest: i32,
    /// Id of the enclosing dynamic network.
    pub parent: i32,
    /// Node that instantiated the enclosing dynamic network.
    pub parent_node: NodeId,
    /// Index of the dynamic instance.
    pub dynamic_index: i32,
    /// Location of the dynamic instance.
    pub dynamic_loc: i32,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (parent {}@{}, dyn {}@{})",
            self.node, self.dest, self.parent, self.parent_node, self.dynamic_index, self.dynamic_loc
        )
    }
}

/// Errors raised by the distribution layer.
#[derive(Debug, thiserror::Error)]
pub enum DistribError {
    /// The transport could not deliver a frame.
    #[error("transport to node {node} failed: {message}")]
    Transport {
        /// Target node.
        node: NodeId,
        /// Transport-specific reason.
        message: String,
    },

    /// No node with this id exists.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Every sender to this node is gone.
    #[error("transport disconnected")]
    Disconnected,

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Outbound half of a node: encodes messages and hands them to the
/// transport.
pub struct Link {
    transport: Arc<dyn Transport>,
    interfaces: Arc<InterfaceRegistry>,
    metrics: Arc<RuntimeMetrics>,
}

impl Link {
    /// Creates a link over `transport`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        interfaces: Arc<InterfaceRegistry>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            transport,
            interfaces,
            metrics,
        }
    }

    /// Returns the local node id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.transport.node_id()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.transport.node_count()
    }

    /// Returns true if `node` is this node.
    #[must_use]
    pub fn is_local(&self, node: NodeId) -> bool {
        node == self.node_id()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Encodes and sends `message` to node `to`.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError`] if encoding or delivery fails.
    pub fn send(&self, to: NodeId, message: Message) -> Result<(), DistribError> {
        trace!(to, tag = ?message.tag(), "sending message");
        let frame = message::encode(message, &self.interfaces)?;
        self.transport.send(to, frame)
    }

    /// Sends `record` to the node of `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError`] if delivery fails.
    pub fn send_record(&self, dest: Destination, record: Record) -> Result<(), DistribError> {
        RuntimeMetrics::incr(&self.metrics.records_sent);
        self.send(dest.node, Message::Record { dest, record })
    }

    /// Asks the sender of `dest` to hold back.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError`] if delivery fails.
    pub fn block_dest(&self, dest: Destination) -> Result<(), DistribError> {
        self.send(dest.node, Message::Block { dest })
    }

    /// Lets the sender of `dest` resume.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError`] if delivery fails.
    pub fn unblock_dest(&self, dest: Destination) -> Result<(), DistribError> {
        self.send(dest.node, Message::Unblock { dest })
    }

    /// Wakes the local input manager to retry buffered records.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError`] if delivery fails.
    pub fn update_blocked(&self) -> Result<(), DistribError> {
        self.send(self.node_id(), Message::Update)
    }

    /// Stops the input manager of every node.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure.
    pub fn global_stop(&self) -> Result<(), DistribError> {
        for node in 0..self.node_count() {
            let node = NodeId::try_from(node).map_err(|_| DistribError::UnknownNode(NodeId::MAX))?;
            self.send(node, Message::Stop)?;
        }
        Ok(())
    }

    fn send_or_die(&self, to: NodeId, message: Message) {
        if let Err(e) = self.send(to, message) {
            fatal(format!("reference traffic to node {to} failed: {e}"));
        }
    }
}

impl RefChannel for Link {
    fn fetch_ref(&self, key: RefKey, interface: InterfaceId) {
        self.send_or_die(
            key.node,
            Message::RefFetch {
                key,
                interface,
                requester: self.node_id(),
            },
        );
    }

    fn update_ref(&self, key: RefKey, interface: InterfaceId, delta: i32) {
        self.send_or_die(
            key.node,
            Message::RefUpdate {
                key,
                interface,
                delta,
            },
        );
    }

    fn send_data(&self, key: RefKey, interface: InterfaceId, data: &FieldValue, to: NodeId) {
        let sent = message::encode_ref_set(key, interface, data, &self.interfaces)
            .map_err(DistribError::from)
            .and_then(|frame| self.transport.send(to, frame));
        if let Err(e) = sent {
            fatal(format!("sending value of {key} to node {to} failed: {e}"));
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("node", &self.node_id())
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceTable;

    fn link(node: usize, nodes: &mut Vec<Option<MemoryTransport>>) -> Link {
        let transport = nodes[node].take().unwrap();
        Link::new(
            Arc::new(transport),
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        )
    }

    #[test]
    fn test_destination_display() {
        let dest = Destination {
            node: 1,
            dest: 2,
            ..Destination::default()
        };
        assert_eq!(dest.to_string(), "1/2 (parent 0@0, dyn 0@0)");
    }

    #[test]
    fn test_global_stop_reaches_every_node() {
        let mut nodes: Vec<_> = MemoryFabric::build(2).into_iter().map(Some).collect();
        let a = link(0, &mut nodes);
        let b = link(1, &mut nodes);
        a.global_stop().unwrap();

        let table = ReferenceTable::local(
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        );
        for link in [&a, &b] {
            let (from, frame) = link.transport().recv().unwrap();
            assert_eq!(from, 0);
            assert!(matches!(
                message::decode(from, frame, &table).unwrap(),
                Message::Stop
            ));
        }
    }

    #[test]
    fn test_fetch_goes_to_origin() {
        let mut nodes: Vec<_> = MemoryFabric::build(2).into_iter().map(Some).collect();
        let a = link(0, &mut nodes);
        let b = link(1, &mut nodes);
        a.fetch_ref(RefKey { node: 1, id: 4 }, 0);

        let (from, frame) = b.transport().recv().unwrap();
        let table = ReferenceTable::local(
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        );
        assert!(matches!(
            message::decode(from, frame, &table).unwrap(),
            Message::RefFetch { requester: 0, .. }
        ));
    }
}
