//! Output manager: drains the streams that leave this node.
//!
//! The manager polls every outgoing stream together with a private wakeup
//! stream. Other threads register new streams and block or unblock
//! destinations through [`OutputControl`], which queues the change and
//! pokes the wakeup stream.
//!
//! Streams whose destination is blocked move to a separate set that is not
//! polled until the receiver unblocks them.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Destination, Link};
use crate::error::fatal;
use crate::metrics::RuntimeMetrics;
use crate::record::Record;
use crate::stream::{DescId, Stream, StreamSet};

#[derive(Default)]
struct Pending {
    running: bool,
    new_streams: Vec<(Destination, Stream<Record>)>,
    /// Block (`true`) and unblock (`false`) requests in arrival order.
    flow: Vec<(Destination, bool)>,
}

/// Shared handle for feeding the output manager.
pub struct OutputControl {
    pending: Mutex<Pending>,
    wakeup: Stream<Record>,
}

impl OutputControl {
    /// Creates the control block with a wakeup stream of `wakeup_capacity`.
    #[must_use]
    pub fn new(wakeup_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending {
                running: true,
                ..Pending::default()
            }),
            wakeup: Stream::new(wakeup_capacity.max(1)),
        })
    }

    /// Registers an outgoing stream for `dest`.
    pub fn new_out(&self, dest: Destination, stream: Stream<Record>) {
        let mut pending = self.pending.lock();
        pending.new_streams.push((dest, stream));
        self.poke();
    }

    /// Stops polling the stream of `dest`.
    pub fn block(&self, dest: Destination) {
        let mut pending = self.pending.lock();
        pending.flow.push((dest, true));
        self.poke();
    }

    /// Resumes polling the stream of `dest`.
    pub fn unblock(&self, dest: Destination) {
        let mut pending = self.pending.lock();
        pending.flow.push((dest, false));
        self.poke();
    }

    /// Asks the manager to exit.
    pub fn stop(&self) {
        let mut pending = self.pending.lock();
        pending.running = false;
        self.poke();
    }

    fn running(&self) -> bool {
        self.pending.lock().running
    }

    /// Writes a wake token unless one is already pending.
    ///
    /// Called with `pending` locked, which serializes the writers.
    fn poke(&self) {
        let writer = self.wakeup.open_writer();
        // A full wakeup stream already holds an unread token.
        let _ = writer.try_write(Record::Terminate { local: true });
    }
}

impl std::fmt::Debug for OutputControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputControl")
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

/// The output manager entity.
pub struct OutputManager {
    control: Arc<OutputControl>,
    link: Arc<Link>,
    metrics: Arc<RuntimeMetrics>,
    waiting: StreamSet<Record>,
    blocked: StreamSet<Record>,
    dests: FxHashMap<DescId, Destination>,
}

impl OutputManager {
    /// Creates the manager.
    #[must_use]
    pub fn new(control: Arc<OutputControl>, link: Arc<Link>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            control,
            link,
            metrics,
            waiting: StreamSet::new(),
            blocked: StreamSet::new(),
            dests: FxHashMap::default(),
        }
    }

    /// Runs until [`OutputControl::stop`] is called.
    pub fn run(mut self) {
        let wakeup = self.control.wakeup.open_reader();
        let wakeup_id = wakeup.id();
        self.waiting.put(wakeup);
        debug!(node = self.link.node_id(), "output manager started");

        self.update_outgoing();
        while self.control.running() {
            let id = self.waiting.poll();

            if id == wakeup_id {
                if let Some(reader) = self.waiting.get(id) {
                    reader.read();
                }
                self.update_outgoing();
                self.update_blocked();
                continue;
            }

            let Some(reader) = self.waiting.get_mut(id) else {
                fatal(format!("output manager polled unknown descriptor {id}"));
            };
            match reader.read() {
                Record::Sync { stream } => reader.replace(stream),
                record @ Record::Terminate { .. } => {
                    let dest = self.take_dest(id);
                    self.waiting.remove(id);
                    self.send(dest, record);
                }
                record => {
                    let dest = self.dest_of(id);
                    self.send(dest, record);
                }
            }
        }

        self.waiting.remove(wakeup_id);
        if !self.dests.is_empty() {
            warn!(
                streams = self.dests.len(),
                "output manager stopped with open outgoing streams"
            );
        }
        debug!(node = self.link.node_id(), "output manager stopped");
    }

    fn send(&self, dest: Destination, record: Record) {
        if let Err(e) = self.link.send_record(dest, record) {
            fatal(format!("sending record to {dest} failed: {e}"));
        }
    }

    fn dest_of(&self, id: DescId) -> Destination {
        match self.dests.get(&id) {
            Some(dest) => *dest,
            None => fatal(format!("outgoing stream {id} has no destination")),
        }
    }

    fn take_dest(&mut self, id: DescId) -> Destination {
        match self.dests.remove(&id) {
            Some(dest) => dest,
            None => fatal(format!("outgoing stream {id} has no destination")),
        }
    }

    fn find(&self, dest: Destination) -> Option<DescId> {
        self.dests
            .iter()
            .find_map(|(id, d)| (*d == dest).then_some(*id))
    }

    fn update_outgoing(&mut self) {
        let new_streams = std::mem::take(&mut self.control.pending.lock().new_streams);
        for (dest, stream) in new_streams {
            let reader = stream.open_reader();
            debug!(%dest, "new outgoing stream");
            self.dests.insert(reader.id(), dest);
            self.waiting.put(reader);
        }
    }

    fn update_blocked(&mut self) {
        let flow = std::mem::take(&mut self.control.pending.lock().flow);
        for (dest, block) in flow {
            let Some(id) = self.find(dest) else {
                continue;
            };
            if block {
                if let Some(reader) = self.waiting.remove(id) {
                    RuntimeMetrics::incr(&self.metrics.destinations_blocked);
                    debug!(%dest, "destination blocked");
                    self.blocked.put(reader);
                }
            } else if let Some(reader) = self.blocked.remove(id) {
                debug!(%dest, "destination unblocked");
                self.waiting.put(reader);
            }
        }
    }
}
