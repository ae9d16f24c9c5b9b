//! Input manager: the single consumer of this node's inbound traffic.
//!
//! Records are routed to the incoming stream registered for their
//! destination. Each destination has an [`InputBuffer`] that implements
//! flow control:
//!
//! 1. A record is written with `try_write`. If that fails, or older records
//!    are still queued, it is queued instead and the sending node is told
//!    to block the destination.
//! 2. A read callback on the stream counts consumed records. Once everything
//!    written has been read and records are still queued, the buffer is put
//!    on the unblocked list and an `update` message is sent to this node.
//! 3. On `update` the manager retries queued records and unblocks the
//!    destination once its queue is empty.
//!
//! A `terminate` removes the destination from the routing map. If records
//! are still queued behind it, the manager keeps the buffer among its
//! draining buffers until the queue has been written out.
//!
//! Reference traffic (`ref_set`, `ref_update`, `ref_fetch`) is applied to
//! the node's [`ReferenceTable`]; `block` and `unblock` are forwarded to the
//! output manager.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::message::{self, Message};
use super::output::OutputControl;
use super::{Destination, Link};
use crate::error::fatal;
use crate::metrics::RuntimeMetrics;
use crate::record::Record;
use crate::reference::ReferenceTable;
use crate::stream::{Stream, StreamWriter};

/// Called for records addressed to a destination nobody registered yet.
///
/// The router is expected to instantiate the dynamic network owning the
/// destination, which registers its incoming stream with
/// [`InputShared::new_in`].
pub type DynamicRouter = Box<dyn Fn(Destination) + Send>;

struct BufferState {
    done: bool,
    /// Records written to the stream and not yet read.
    in_flight: usize,
    queue: VecDeque<Record>,
    writer: Option<StreamWriter<Record>>,
}

/// Flow-control state of one incoming destination.
pub struct InputBuffer {
    dest: Destination,
    state: Mutex<BufferState>,
}

impl InputBuffer {
    /// Returns the destination served by this buffer.
    #[must_use]
    pub fn dest(&self) -> Destination {
        self.dest
    }

    /// Number of records waiting for room in the stream.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn on_read(self: &Arc<Self>, shared: &InputShared) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight != 0 {
            return;
        }
        if !state.queue.is_empty() {
            drop(state);
            shared.push_unblocked(Arc::clone(self));
        } else if state.done {
            let writer = state.writer.take();
            drop(state);
            drop(writer);
        }
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuffer")
            .field("dest", &self.dest)
            .field("queued", &self.queued())
            .finish()
    }
}

/// State shared between the input manager, read callbacks and routing.
pub struct InputShared {
    new_streams: Mutex<Vec<(Destination, Stream<Record>)>>,
    unblocked: Mutex<Vec<Arc<InputBuffer>>>,
    link: Arc<Link>,
}

impl InputShared {
    /// Creates the shared state.
    #[must_use]
    pub fn new(link: Arc<Link>) -> Arc<Self> {
        Arc::new(Self {
            new_streams: Mutex::new(Vec::new()),
            unblocked: Mutex::new(Vec::new()),
            link,
        })
    }

    /// Registers the incoming stream of `dest`.
    pub fn new_in(&self, dest: Destination, stream: Stream<Record>) {
        self.new_streams.lock().push((dest, stream));
    }

    fn push_unblocked(&self, buffer: Arc<InputBuffer>) {
        let mut unblocked = self.unblocked.lock();
        unblocked.push(buffer);
        if unblocked.len() == 1 {
            drop(unblocked);
            if let Err(e) = self.link.update_blocked() {
                fatal(format!("waking the input manager failed: {e}"));
            }
        }
    }
}

impl std::fmt::Debug for InputShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputShared")
            .field("new_streams", &self.new_streams.lock().len())
            .field("unblocked", &self.unblocked.lock().len())
            .finish_non_exhaustive()
    }
}

/// The input manager entity.
pub struct InputManager {
    shared: Arc<InputShared>,
    table: Arc<ReferenceTable>,
    output: Arc<OutputControl>,
    metrics: Arc<RuntimeMetrics>,
    router: Option<DynamicRouter>,
    dests: FxHashMap<Destination, Arc<InputBuffer>>,
    /// Terminated buffers with records still queued.
    draining: Vec<Arc<InputBuffer>>,
}

impl InputManager {
    /// Creates the manager.
    #[must_use]
    pub fn new(
        shared: Arc<InputShared>,
        table: Arc<ReferenceTable>,
        output: Arc<OutputControl>,
        metrics: Arc<RuntimeMetrics>,
        router: Option<DynamicRouter>,
    ) -> Self {
        Self {
            shared,
            table,
            output,
            metrics,
            router,
            dests: FxHashMap::default(),
            draining: Vec::new(),
        }
    }

    /// Runs until a `stop` message arrives, then stops the output manager.
    pub fn run(mut self) {
        let node = self.shared.link.node_id();
        debug!(node, "input manager started");
        loop {
            let (from, frame) = match self.shared.link.transport().recv() {
                Ok(received) => received,
                Err(e) => fatal(format!("input manager receive failed: {e}")),
            };
            let msg = match message::decode(from, frame, &self.table) {
                Ok(msg) => msg,
                Err(e) => fatal(format!("undecodable message from node {from}: {e}")),
            };
            match msg {
                Message::Record { dest, record } => {
                    RuntimeMetrics::incr(&self.metrics.records_received);
                    self.handle_record(dest, record);
                }
                Message::Update => self.update_blocked(),
                Message::Block { dest } => self.output.block(dest),
                Message::Unblock { dest } => self.output.unblock(dest),
                Message::RefSet {
                    key,
                    interface,
                    data,
                } => self.table.set(key, interface, data),
                Message::RefUpdate { key, delta, .. } => self.table.update(key, delta),
                Message::RefFetch {
                    key,
                    interface,
                    requester,
                } => self.table.serve_fetch(key, interface, requester),
                Message::Stop => break,
            }
        }

        if !self.dests.is_empty() || !self.draining.is_empty() {
            warn!(
                node,
                streams = self.dests.len(),
                draining = self.draining.len(),
                "input manager stopped with open incoming streams"
            );
        }
        self.output.stop();
        debug!(node, "input manager stopped");
    }

    fn update_incoming(&mut self) {
        let new_streams = std::mem::take(&mut *self.shared.new_streams.lock());
        for (dest, stream) in new_streams {
            let buffer = Arc::new(InputBuffer {
                dest,
                state: Mutex::new(BufferState {
                    done: false,
                    in_flight: 0,
                    queue: VecDeque::new(),
                    writer: Some(stream.open_writer()),
                }),
            });
            let weak_buffer = Arc::downgrade(&buffer);
            let weak_shared: Weak<InputShared> = Arc::downgrade(&self.shared);
            stream.register_read_callback(Arc::new(move || {
                if let (Some(buffer), Some(shared)) = (weak_buffer.upgrade(), weak_shared.upgrade())
                {
                    buffer.on_read(&shared);
                }
            }));
            debug!(%dest, "new incoming stream");
            self.dests.insert(dest, buffer);
        }
    }

    fn handle_record(&mut self, dest: Destination, record: Record) {
        self.update_incoming();
        if !self.dests.contains_key(&dest) {
            if let Some(router) = &self.router {
                debug!(%dest, "routing unknown destination");
                router(dest);
                self.update_incoming();
            }
        }

        let terminate = record.is_terminate();
        let buffer = if terminate {
            self.dests.remove(&dest)
        } else {
            self.dests.get(&dest).cloned()
        };
        let Some(buffer) = buffer else {
            fatal(format!("record for unknown destination {dest}"));
        };

        let mut state = buffer.state.lock();
        if terminate {
            state.done = true;
        }
        let mut block = false;
        if state.queue.is_empty() {
            let Some(writer) = state.writer.as_ref() else {
                fatal(format!("record for closed destination {dest}"));
            };
            match writer.try_write(record) {
                Ok(()) => state.in_flight += 1,
                Err(e) if e.is_closed() => {
                    warn!(%dest, "dropping record for closed incoming stream");
                }
                Err(e) => {
                    state.queue.push_back(e.into_inner());
                    block = true;
                }
            }
        } else {
            state.queue.push_back(record);
        }
        let backlogged = !state.queue.is_empty();
        drop(state);

        if terminate && backlogged {
            debug!(%dest, "draining terminated destination");
            self.draining.push(Arc::clone(&buffer));
        }
        if block {
            RuntimeMetrics::incr(&self.metrics.destinations_blocked);
            if let Err(e) = self.shared.link.block_dest(dest) {
                fatal(format!("blocking {dest} failed: {e}"));
            }
        }
    }

    fn update_blocked(&mut self) {
        let pending = std::mem::take(&mut *self.shared.unblocked.lock());
        for buffer in pending {
            let mut state = buffer.state.lock();
            while let Some(record) = state.queue.pop_front() {
                let Some(writer) = state.writer.as_ref() else {
                    fatal(format!("queued records for closed destination {}", buffer.dest));
                };
                match writer.try_write(record) {
                    Ok(()) => state.in_flight += 1,
                    Err(e) if e.is_closed() => {
                        warn!(dest = %buffer.dest, "dropping queued records for closed stream");
                        state.queue.clear();
                        break;
                    }
                    Err(e) => {
                        state.queue.push_front(e.into_inner());
                        break;
                    }
                }
            }
            let drained = state.queue.is_empty();
            let resume = drained && !state.done;
            let finished = drained && state.done;
            drop(state);
            if finished {
                self.draining.retain(|b| !Arc::ptr_eq(b, &buffer));
            }
            if resume {
                if let Err(e) = self.shared.link.unblock_dest(buffer.dest) {
                    fatal(format!("unblocking {} failed: {e}", buffer.dest));
                }
            }
        }
    }
}

impl std::fmt::Debug for InputManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputManager")
            .field("dests", &self.dests.len())
            .finish_non_exhaustive()
    }
}
