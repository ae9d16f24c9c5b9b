//! Per-node reference bookkeeping.
//!
//! The table keeps two maps, each behind its own mutex. They are never
//! locked together.
//!
//! - **exports**: values owned by this node that remote nodes hold
//!   references to, with the number of remote holders.
//! - **imports**: values owned elsewhere that local references point at,
//!   with the number of local holders, an optional cached copy, and the
//!   threads waiting for an outstanding fetch.
//!
//! An entry exists only while its count is positive or a fetch is pending.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    FieldValue, InterfaceId, InterfaceRegistry, NoDistribution, RefChannel, RefKey, RefState,
    Reference,
};
use crate::config::FETCH_STREAM_CAPACITY;
use crate::distrib::NodeId;
use crate::error::fatal;
use crate::metrics::RuntimeMetrics;
use crate::stream::{Stream, StreamWriter};

/// Value exported to remote holders.
struct ExportEntry {
    count: i64,
    data: FieldValue,
}

/// Value imported from another node.
struct ImportEntry {
    count: i64,
    cache: Option<FieldValue>,
    waiters: Vec<StreamWriter<FieldValue>>,
}

/// Export and import maps of one node.
pub struct ReferenceTable {
    node: NodeId,
    next_id: AtomicU64,
    exports: Mutex<FxHashMap<RefKey, ExportEntry>>,
    imports: Mutex<FxHashMap<RefKey, ImportEntry>>,
    interfaces: Arc<InterfaceRegistry>,
    channel: Arc<dyn RefChannel>,
    metrics: Arc<RuntimeMetrics>,
}

impl ReferenceTable {
    /// Creates the table of node `node`.
    #[must_use]
    pub fn new(
        node: NodeId,
        interfaces: Arc<InterfaceRegistry>,
        channel: Arc<dyn RefChannel>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            next_id: AtomicU64::new(1),
            exports: Mutex::new(FxHashMap::default()),
            imports: Mutex::new(FxHashMap::default()),
            interfaces,
            channel,
            metrics,
        })
    }

    /// Creates a table for a single-node runtime.
    #[must_use]
    pub fn local(interfaces: Arc<InterfaceRegistry>, metrics: Arc<RuntimeMetrics>) -> Arc<Self> {
        Self::new(0, interfaces, Arc::new(NoDistribution), metrics)
    }

    /// Returns the node this table belongs to.
    #[inline]
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns the interface registry.
    #[must_use]
    pub fn interfaces(&self) -> &Arc<InterfaceRegistry> {
        &self.interfaces
    }

    /// Wraps a local value in a new reference.
    #[must_use]
    pub fn create(self: &Arc<Self>, data: FieldValue, interface: InterfaceId) -> Reference {
        Reference::from_parts(
            self.next_key(),
            interface,
            RefState::Local(data),
            Arc::clone(self),
        )
    }

    pub(crate) fn next_key(&self) -> RefKey {
        RefKey {
            node: self.node,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn local_ref(self: &Arc<Self>, interface: InterfaceId, data: FieldValue) -> Reference {
        self.create(data, interface)
    }

    pub(crate) fn copy(self: &Arc<Self>, reference: &Reference) -> Reference {
        let interface = reference.interface();
        match reference.state() {
            RefState::Local(data) => {
                let copy = self.interfaces.expect(interface).copy(data);
                self.local_ref(interface, copy)
            }
            RefState::Remote => {
                let key = reference.key();
                let mut imports = self.imports.lock();
                let entry = import_entry(&mut imports, key);
                if let Some(cache) = &entry.cache {
                    let copy = self.interfaces.expect(interface).copy(cache);
                    drop(imports);
                    return self.local_ref(interface, copy);
                }
                entry.count += 1;
                self.send_update(key, interface, 1);
                drop(imports);
                Reference::from_parts(key, interface, RefState::Remote, Arc::clone(self))
            }
            RefState::Released => fatal(format!("copy of released reference {}", reference.key())),
        }
    }

    /// Returns a private copy of an imported value, fetching it if needed.
    pub(crate) fn remote_data(&self, key: RefKey, interface: InterfaceId) -> FieldValue {
        let mut imports = self.imports.lock();
        let entry = import_entry(&mut imports, key);

        if entry.cache.is_none() {
            let stream = Stream::new(FETCH_STREAM_CAPACITY);
            let reader = stream.open_reader();
            entry.waiters.push(stream.open_writer());
            if entry.waiters.len() == 1 {
                RuntimeMetrics::incr(&self.metrics.fetches_issued);
                trace!(%key, "fetching remote reference");
                self.channel.fetch_ref(key, interface);
            }
            // The holder count is settled by `set`, which runs on the
            // input manager once the value arrives.
            drop(imports);
            return reader.read();
        }

        self.send_update(key, interface, -1);
        entry.count -= 1;
        if entry.count == 0 {
            let data = imports.remove(&key).and_then(|e| e.cache);
            drop(imports);
            match data {
                Some(data) => data,
                None => fatal(format!("import entry {key} lost its cached value")),
            }
        } else {
            let copy = match &entry.cache {
                Some(cache) => self.interfaces.expect(interface).copy(cache),
                None => fatal(format!("import entry {key} lost its cached value")),
            };
            drop(imports);
            copy
        }
    }

    /// Drops one local holder of an imported value.
    pub(crate) fn destroy_remote(&self, key: RefKey, interface: InterfaceId) {
        let mut imports = self.imports.lock();
        let entry = import_entry(&mut imports, key);
        self.send_update(key, interface, -1);
        entry.count -= 1;
        if entry.count == 0 {
            let removed = imports.remove(&key);
            drop(imports);
            drop(removed);
        }
    }

    /// Deserialization hook: a reference arrived from another node.
    pub fn incoming(self: &Arc<Self>, key: RefKey, interface: InterfaceId) -> Reference {
        if key.node == self.node {
            let mut exports = self.exports.lock();
            let Some(entry) = exports.get_mut(&key) else {
                fatal(format!("returning reference {key} has no export entry"));
            };
            entry.count -= 1;
            if entry.count == 0 {
                let data = exports.remove(&key).map(|e| e.data);
                drop(exports);
                return match data {
                    Some(data) => Reference::from_parts(
                        key,
                        interface,
                        RefState::Local(data),
                        Arc::clone(self),
                    ),
                    None => fatal(format!("export entry {key} vanished")),
                };
            }
            let copy = self.interfaces.expect(interface).copy(&entry.data);
            drop(exports);
            return self.local_ref(interface, copy);
        }

        let mut imports = self.imports.lock();
        imports
            .entry(key)
            .and_modify(|e| e.count += 1)
            .or_insert_with(|| ImportEntry {
                count: 1,
                cache: None,
                waiters: Vec::new(),
            });
        drop(imports);
        Reference::from_parts(key, interface, RefState::Remote, Arc::clone(self))
    }

    /// Serialization hook: a reference is leaving this node.
    pub(crate) fn outgoing(&self, key: RefKey, interface: InterfaceId, state: RefState) {
        match state {
            RefState::Local(data) => {
                let mut exports = self.exports.lock();
                if let Some(entry) = exports.get_mut(&key) {
                    entry.count += 1;
                    drop(exports);
                    drop(data);
                } else {
                    exports.insert(key, ExportEntry { count: 1, data });
                }
            }
            RefState::Remote => {
                let mut imports = self.imports.lock();
                let entry = import_entry(&mut imports, key);
                entry.count -= 1;
                if entry.count == 0 {
                    let removed = imports.remove(&key);
                    drop(imports);
                    drop(removed);
                }
            }
            RefState::Released => fatal(format!(
                "serialization of released reference {key} (interface {interface})"
            )),
        }
    }

    /// Applies a holder-count update from a remote node to an export.
    pub fn update(&self, key: RefKey, delta: i32) {
        let mut exports = self.exports.lock();
        let Some(entry) = exports.get_mut(&key) else {
            fatal(format!("count update {delta:+} for unknown export {key}"));
        };
        entry.count += i64::from(delta);
        if entry.count < 0 {
            let count = entry.count;
            drop(exports);
            fatal(format!("export {key} count dropped to {count}"));
        }
        if entry.count == 0 {
            let removed = exports.remove(&key);
            drop(exports);
            RuntimeMetrics::incr(&self.metrics.exported_data_freed);
            debug!(%key, "exported value freed");
            drop(removed);
        }
    }

    /// Delivers a fetched value to every waiter.
    ///
    /// Each waiter consumes one local holder. The origin only accounts for
    /// one of them when it serves the fetch, so the others are reported
    /// back in a single update.
    pub fn set(&self, key: RefKey, interface: InterfaceId, data: FieldValue) {
        let iface = Arc::clone(self.interfaces.expect(interface));
        let mut imports = self.imports.lock();
        let Some(entry) = imports.get_mut(&key) else {
            fatal(format!("fetched value for unknown import {key}"));
        };

        let waiters = std::mem::take(&mut entry.waiters);
        let released = waiters.len();
        for writer in waiters {
            writer.write(iface.copy(&data));
            entry.count -= 1;
        }
        RuntimeMetrics::add(&self.metrics.fetch_waiters_released, released as u64);
        if released > 1 {
            let extra = i32::try_from(released - 1).unwrap_or(i32::MAX);
            self.send_update(key, interface, -extra);
        }

        if entry.count > 0 {
            entry.cache = Some(data);
        } else {
            let removed = imports.remove(&key);
            drop(imports);
            drop(removed);
            drop(data);
        }
    }

    /// Answers a fetch from node `requester` and drops its holder.
    pub fn serve_fetch(&self, key: RefKey, interface: InterfaceId, requester: NodeId) {
        {
            let exports = self.exports.lock();
            let Some(entry) = exports.get(&key) else {
                fatal(format!("fetch from node {requester} for unknown export {key}"));
            };
            self.channel.send_data(key, interface, &entry.data, requester);
        }
        self.update(key, -1);
    }

    fn send_update(&self, key: RefKey, interface: InterfaceId, delta: i32) {
        RuntimeMetrics::incr(&self.metrics.ref_updates_sent);
        self.channel.update_ref(key, interface, delta);
    }

    /// Remote holder count of an exported value.
    #[must_use]
    pub fn export_count(&self, key: RefKey) -> Option<i64> {
        self.exports.lock().get(&key).map(|e| e.count)
    }

    /// Local holder count of an imported value.
    #[must_use]
    pub fn import_count(&self, key: RefKey) -> Option<i64> {
        self.imports.lock().get(&key).map(|e| e.count)
    }

    /// Number of threads waiting on an outstanding fetch of `key`.
    #[must_use]
    pub fn pending_waiters(&self, key: RefKey) -> usize {
        self.imports.lock().get(&key).map_or(0, |e| e.waiters.len())
    }

    /// Number of export entries.
    #[must_use]
    pub fn export_len(&self) -> usize {
        self.exports.lock().len()
    }

    /// Number of import entries.
    #[must_use]
    pub fn import_len(&self) -> usize {
        self.imports.lock().len()
    }
}

fn import_entry(imports: &mut FxHashMap<RefKey, ImportEntry>, key: RefKey) -> &mut ImportEntry {
    match imports.get_mut(&key) {
        Some(entry) => entry,
        None => fatal(format!("remote reference {key} has no import entry")),
    }
}

impl std::fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("node", &self.node)
            .field("exports", &self.export_len())
            .field("imports", &self.import_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::BYTES_INTERFACE;

    #[derive(Default)]
    struct RecordingChannel {
        fetches: Mutex<Vec<RefKey>>,
        updates: Mutex<Vec<(RefKey, i32)>>,
        sent: Mutex<Vec<(RefKey, NodeId, Vec<u8>)>>,
    }

    impl RefChannel for RecordingChannel {
        fn fetch_ref(&self, key: RefKey, _interface: InterfaceId) {
            self.fetches.lock().push(key);
        }

        fn update_ref(&self, key: RefKey, _interface: InterfaceId, delta: i32) {
            self.updates.lock().push((key, delta));
        }

        fn send_data(&self, key: RefKey, _interface: InterfaceId, data: &FieldValue, to: NodeId) {
            let bytes = data.downcast_ref::<Vec<u8>>().unwrap().clone();
            self.sent.lock().push((key, to, bytes));
        }
    }

    fn table(node: NodeId) -> (Arc<ReferenceTable>, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let table = ReferenceTable::new(
            node,
            Arc::new(InterfaceRegistry::new()),
            Arc::clone(&channel) as Arc<dyn RefChannel>,
            Arc::new(RuntimeMetrics::new()),
        );
        (table, channel)
    }

    fn bytes(value: &[u8]) -> FieldValue {
        Box::new(value.to_vec())
    }

    fn remote_key() -> RefKey {
        RefKey { node: 1, id: 77 }
    }

    #[test]
    fn test_local_copy_is_independent() {
        let (table, _) = table(0);
        let a = table.create(bytes(b"abc"), BYTES_INTERFACE);
        let mut b = a.copy();
        assert_ne!(a.key(), b.key());
        assert_eq!(b.downcast_ref::<Vec<u8>>().unwrap(), b"abc");
        assert_eq!(a.take_data().downcast_ref::<Vec<u8>>().unwrap(), b"abc");
    }

    #[test]
    fn test_outgoing_then_incoming_local() {
        let (table, _) = table(0);
        let reference = table.create(bytes(b"x"), BYTES_INTERFACE);
        let (key, iface) = reference.into_wire();
        assert_eq!(table.export_count(key), Some(1));

        let mut back = table.incoming(key, iface);
        assert_eq!(back.key(), key);
        assert!(back.is_local());
        assert_eq!(back.downcast_ref::<Vec<u8>>().unwrap(), b"x");
        assert_eq!(table.export_len(), 0);
    }

    #[test]
    fn test_incoming_local_with_other_holders_copies() {
        let (table, _) = table(0);
        let reference = table.create(bytes(b"shared"), BYTES_INTERFACE);
        let (key, iface) = reference.into_wire();
        table.update(key, 1);

        let back = table.incoming(key, iface);
        assert_ne!(back.key(), key);
        assert_eq!(table.export_count(key), Some(1));
    }

    #[test]
    fn test_update_frees_at_zero() {
        let (table, _) = table(0);
        let (key, _) = table.create(bytes(b"y"), BYTES_INTERFACE).into_wire();
        table.update(key, 2);
        assert_eq!(table.export_count(key), Some(3));
        table.update(key, -3);
        assert_eq!(table.export_count(key), None);
        assert_eq!(table.metrics.snapshot().exported_data_freed, 1);
    }

    #[test]
    fn test_serve_fetch_sends_and_decrements() {
        let (table, channel) = table(0);
        let (key, iface) = table.create(bytes(b"data"), BYTES_INTERFACE).into_wire();
        table.update(key, 1);

        table.serve_fetch(key, iface, 3);
        assert_eq!(channel.sent.lock()[0], (key, 3, b"data".to_vec()));
        assert_eq!(table.export_count(key), Some(1));
    }

    #[test]
    fn test_remote_copy_registers_holder() {
        let (table, channel) = table(0);
        let key = remote_key();
        let remote = table.incoming(key, BYTES_INTERFACE);
        assert!(!remote.is_local());
        assert_eq!(table.import_count(key), Some(1));

        let copy = remote.copy();
        assert_eq!(copy.key(), key);
        assert_eq!(table.import_count(key), Some(2));
        assert_eq!(channel.updates.lock().as_slice(), &[(key, 1)]);

        drop(copy);
        drop(remote);
        assert_eq!(table.import_count(key), None);
        assert_eq!(channel.updates.lock().as_slice(), &[(key, 1), (key, -1), (key, -1)]);
    }

    #[test]
    fn test_set_caches_for_remaining_holders() {
        let (table, channel) = table(0);
        let key = remote_key();
        let first = table.incoming(key, BYTES_INTERFACE);
        let mut second = table.incoming(key, BYTES_INTERFACE);
        assert_eq!(table.import_count(key), Some(2));

        let fetcher = std::thread::spawn(move || {
            let mut first = first;
            first.downcast_ref::<Vec<u8>>().unwrap().clone()
        });
        while table.pending_waiters(key) == 0 {
            std::thread::yield_now();
        }
        assert_eq!(channel.fetches.lock().len(), 1);

        table.set(key, BYTES_INTERFACE, bytes(b"remote"));
        assert_eq!(fetcher.join().unwrap(), b"remote");
        assert_eq!(table.import_count(key), Some(1));

        // Cached: no second fetch, the last holder takes the cache.
        assert_eq!(second.downcast_ref::<Vec<u8>>().unwrap(), b"remote");
        assert_eq!(channel.fetches.lock().len(), 1);
        assert_eq!(table.import_len(), 0);
        assert_eq!(channel.updates.lock().as_slice(), &[(key, -1)]);
    }

    #[test]
    fn test_copy_of_cached_remote_is_local() {
        let (table, _) = table(0);
        let key = remote_key();
        let a = table.incoming(key, BYTES_INTERFACE);
        let b = table.incoming(key, BYTES_INTERFACE);
        let c = table.incoming(key, BYTES_INTERFACE);

        let fetcher = std::thread::spawn(move || a.take_data());
        while table.pending_waiters(key) == 0 {
            std::thread::yield_now();
        }
        table.set(key, BYTES_INTERFACE, bytes(b"v"));
        fetcher.join().unwrap();

        let copy = b.copy();
        assert!(copy.is_local());
        assert_eq!(table.import_count(key), Some(2));
        drop(b);
        drop(c);
        assert_eq!(table.import_len(), 0);
    }

    #[test]
    fn test_outgoing_remote_drops_holder() {
        let (table, channel) = table(0);
        let key = remote_key();
        let remote = table.incoming(key, BYTES_INTERFACE);
        let (wire_key, _) = remote.into_wire();
        assert_eq!(wire_key, key);
        assert_eq!(table.import_len(), 0);
        assert!(channel.updates.lock().is_empty());
    }

    #[test]
    #[should_panic(expected = "unknown export")]
    fn test_update_unknown_export_is_fatal() {
        let (table, _) = table(0);
        table.update(RefKey { node: 0, id: 9 }, -1);
    }
}
