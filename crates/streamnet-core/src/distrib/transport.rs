//! Physical transports between nodes.
//!
//! The runtime only needs to push a frame to a node and pull the next frame
//! addressed to this node. [`MemoryFabric`] connects any number of nodes
//! living in one process over crossbeam channels.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{DistribError, NodeId};

/// Frame delivery between nodes.
pub trait Transport: Send + Sync {
    /// Returns the id of the local node.
    fn node_id(&self) -> NodeId;

    /// Returns the number of nodes in the run.
    fn node_count(&self) -> usize;

    /// Sends `frame` to node `to`. Sending to the local node is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError`] if `to` is unknown or unreachable.
    fn send(&self, to: NodeId, frame: Bytes) -> Result<(), DistribError>;

    /// Blocks until a frame for this node arrives.
    ///
    /// # Errors
    ///
    /// Returns [`DistribError::Disconnected`] once no sender is left.
    fn recv(&self) -> Result<(NodeId, Bytes), DistribError>;
}

/// Builds in-process transports for a fixed number of nodes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryFabric;

impl MemoryFabric {
    /// Creates one connected transport per node, indexed by node id.
    #[must_use]
    pub fn build(nodes: usize) -> Vec<MemoryTransport> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..nodes).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(node, inbox)| MemoryTransport {
                node: NodeId::try_from(node).unwrap_or(NodeId::MAX),
                inbox,
                peers: senders.clone(),
            })
            .collect()
    }
}

/// One node's end of a [`MemoryFabric`].
pub struct MemoryTransport {
    node: NodeId,
    inbox: Receiver<(NodeId, Bytes)>,
    peers: Vec<Sender<(NodeId, Bytes)>>,
}

impl Transport for MemoryTransport {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn node_count(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, to: NodeId, frame: Bytes) -> Result<(), DistribError> {
        let peer = usize::try_from(to)
            .ok()
            .and_then(|idx| self.peers.get(idx))
            .ok_or(DistribError::UnknownNode(to))?;
        peer.send((self.node, frame))
            .map_err(|_| DistribError::Transport {
                node: to,
                message: "inbox closed".to_string(),
            })
    }

    fn recv(&self) -> Result<(NodeId, Bytes), DistribError> {
        self.inbox.recv().map_err(|_| DistribError::Disconnected)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("node", &self.node)
            .field("nodes", &self.peers.len())
            .field("pending", &self.inbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_delivers_with_sender_id() {
        let nodes = MemoryFabric::build(3);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[2].node_id(), 2);
        assert_eq!(nodes[0].node_count(), 3);

        nodes[0].send(2, Bytes::from_static(b"hi")).unwrap();
        nodes[1].send(2, Bytes::from_static(b"yo")).unwrap();
        assert_eq!(nodes[2].recv().unwrap(), (0, Bytes::from_static(b"hi")));
        assert_eq!(nodes[2].recv().unwrap(), (1, Bytes::from_static(b"yo")));
    }

    #[test]
    fn test_send_to_self() {
        let nodes = MemoryFabric::build(1);
        nodes[0].send(0, Bytes::from_static(b"loop")).unwrap();
        assert_eq!(nodes[0].recv().unwrap().0, 0);
    }

    #[test]
    fn test_unknown_node() {
        let nodes = MemoryFabric::build(2);
        assert!(matches!(
            nodes[0].send(5, Bytes::new()),
            Err(DistribError::UnknownNode(5))
        ));
        assert!(matches!(
            nodes[0].send(-1, Bytes::new()),
            Err(DistribError::UnknownNode(-1))
        ));
    }
}
