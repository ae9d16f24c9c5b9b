//! # References
//!
//! A [`Reference`] stands in for a record field whose value may live on
//! another node. Its wire form is `{node, interface, id}`; the value itself
//! only travels when a consumer asks for it with [`Reference::get_data`].
//!
//! ## Ownership
//!
//! Every reference is an owned handle. A local reference holds its value
//! directly. A remote reference holds nothing: its node keeps an import
//! entry in the [`ReferenceTable`] counting local holders, and the origin
//! keeps an export entry counting remote holders. Dropping a reference is
//! the `Destroy` operation and adjusts those counts.
//!
//! ```text
//!   origin node                          holder node
//!   ───────────                          ───────────
//!   export {count, data}   ◀─ update ──  import {count, cache, waiters}
//!                          ◀─ fetch ───  first GetData
//!                          ── set ────▶  every waiter gets a copy
//! ```
//!
//! ## Module Structure
//!
//! - [`interface`]: Box-language value operations and their registry
//! - [`table`]: The per-node export and import maps

pub mod interface;
pub mod table;

use std::fmt;
use std::sync::Arc;

use crate::distrib::NodeId;
use crate::error::fatal;

pub use interface::{
    BytesInterface, FieldValue, Interface, InterfaceId, InterfaceRegistry, BYTES_INTERFACE,
};
pub use table::ReferenceTable;

/// Identity of a referenced value: its origin node and a per-node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefKey {
    /// Node owning the value.
    pub node: NodeId,
    /// Id unique within `node`.
    pub id: u64,
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.id)
    }
}

/// Outbound side of the reference protocol.
///
/// Implemented by the distribution layer; the table calls it to talk to
/// the node owning a value.
pub trait RefChannel: Send + Sync {
    /// Asks the owner of `key` to send its value to this node.
    fn fetch_ref(&self, key: RefKey, interface: InterfaceId);

    /// Adjusts the owner's holder count for `key` by `delta`.
    fn update_ref(&self, key: RefKey, interface: InterfaceId, delta: i32);

    /// Sends the value of an exported reference to node `to`.
    fn send_data(&self, key: RefKey, interface: InterfaceId, data: &FieldValue, to: NodeId);
}

/// Channel for single-node runtimes, where every reference is local.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDistribution;

impl RefChannel for NoDistribution {
    fn fetch_ref(&self, key: RefKey, _interface: InterfaceId) {
        fatal(format!("fetch of remote reference {key} without distribution"));
    }

    fn update_ref(&self, key: RefKey, _interface: InterfaceId, _delta: i32) {
        fatal(format!("update of remote reference {key} without distribution"));
    }

    fn send_data(&self, key: RefKey, _interface: InterfaceId, _data: &FieldValue, _to: NodeId) {
        fatal(format!("send of reference {key} without distribution"));
    }
}

pub(crate) enum RefState {
    Local(FieldValue),
    Remote,
    Released,
}

/// Handle to a field value that may live on another node.
pub struct Reference {
    key: RefKey,
    interface: InterfaceId,
    state: RefState,
    table: Arc<ReferenceTable>,
}

impl Reference {
    pub(crate) fn from_parts(
        key: RefKey,
        interface: InterfaceId,
        state: RefState,
        table: Arc<ReferenceTable>,
    ) -> Self {
        Self {
            key,
            interface,
            state,
            table,
        }
    }

    /// Returns the identity of the referenced value.
    #[inline]
    #[must_use]
    pub fn key(&self) -> RefKey {
        self.key
    }

    /// Returns the interface owning the value.
    #[inline]
    #[must_use]
    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    /// Returns true if the value is held by this handle.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.state, RefState::Local(_))
    }

    /// Returns a new reference to an independent copy of the value.
    ///
    /// Copying an unresolved remote reference does not fetch anything; it
    /// registers one more holder with the origin.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.table.copy(self)
    }

    /// Resolves the reference and returns its value.
    ///
    /// A remote value is fetched at most once per node no matter how many
    /// threads ask for it concurrently; this call blocks until it arrives.
    pub fn get_data(&mut self) -> &FieldValue {
        if matches!(self.state, RefState::Remote) {
            let data = self.table.remote_data(self.key, self.interface);
            self.key = self.table.next_key();
            self.state = RefState::Local(data);
        }
        match &self.state {
            RefState::Local(data) => data,
            RefState::Remote | RefState::Released => {
                fatal(format!("reference {} used after release", self.key))
            }
        }
    }

    /// Resolves the reference and returns its value, consuming the handle.
    #[must_use]
    pub fn take_data(mut self) -> FieldValue {
        self.get_data();
        match std::mem::replace(&mut self.state, RefState::Released) {
            RefState::Local(data) => data,
            RefState::Remote | RefState::Released => {
                fatal(format!("reference {} used after release", self.key))
            }
        }
    }

    /// Downcasts the resolved value.
    pub fn downcast_ref<T: 'static>(&mut self) -> Option<&T> {
        self.get_data().downcast_ref::<T>()
    }

    /// Hands the reference to the table for serialization.
    ///
    /// Runs the outgoing hook exactly once and returns the wire identity.
    pub(crate) fn into_wire(mut self) -> (RefKey, InterfaceId) {
        let state = std::mem::replace(&mut self.state, RefState::Released);
        self.table.outgoing(self.key, self.interface, state);
        (self.key, self.interface)
    }

    pub(crate) fn state(&self) -> &RefState {
        &self.state
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        if matches!(self.state, RefState::Remote) {
            self.state = RefState::Released;
            self.table.destroy_remote(self.key, self.interface);
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            RefState::Local(_) => "local",
            RefState::Remote => "remote",
            RefState::Released => "released",
        };
        f.debug_struct("Reference")
            .field("key", &self.key)
            .field("interface", &self.interface)
            .field("state", &state)
            .finish()
    }
}
