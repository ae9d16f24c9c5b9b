//! Collectors merge several input streams into one output stream.
//!
//! A collector forwards data records from whichever input has one ready.
//! `sort_end` records act as a barrier: an input that delivers one is parked
//! in the waiting set until every live input has reached the barrier, at
//! which point the barrier is released and forwarded one level down.
//!
//! ```text
//!   ready ──sort_end──▶ waiting
//!     ▲                    │
//!     └──── release ───────┘   (ready empty)
//! ```
//!
//! `terminate` removes an input. The collector exits after its last input
//! is gone and forwards a single `terminate`.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::fatal;
use crate::metrics::RuntimeMetrics;
use crate::record::Record;
use crate::stream::{StreamReader, StreamSet, StreamWriter};

/// How a collector learns about its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorMode {
    /// The input set is fixed at construction, as after a parallel split.
    ///
    /// When a barrier release leaves a single input, the collector hands
    /// that input to its successor with a `sync` record and exits.
    Static,
    /// Inputs are added by `collect` records, as for star and split.
    Dynamic,
}

/// The collector entity.
pub struct Collector {
    mode: CollectorMode,
    ready: StreamSet<Record>,
    waiting: StreamSet<Record>,
    output: StreamWriter<Record>,
    barrier: Option<(i32, i32)>,
    terminate: Option<Record>,
    metrics: Arc<RuntimeMetrics>,
}

impl Collector {
    /// Creates a collector reading `inputs` and writing to `output`.
    #[must_use]
    pub fn new(
        mode: CollectorMode,
        inputs: Vec<StreamReader<Record>>,
        output: StreamWriter<Record>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let mut ready = StreamSet::new();
        for input in inputs {
            ready.put(input);
        }
        Self {
            mode,
            ready,
            waiting: StreamSet::new(),
            output,
            barrier: None,
            terminate: None,
            metrics,
        }
    }

    /// Runs the merge loop until every input has terminated or, for a
    /// static collector, the last input has been handed off.
    pub fn run(mut self) {
        debug!(mode = ?self.mode, inputs = self.ready.len(), "collector started");
        loop {
            if self.ready.is_empty() {
                if self.waiting.is_empty() {
                    let record = self.terminate.take().unwrap_or_else(Record::terminate);
                    self.output.write(record);
                    debug!(mode = ?self.mode, "collector finished");
                    return;
                }
                self.release();
                if self.mode == CollectorMode::Static && self.ready.len() == 1 {
                    let last = self.ready.remove_at(0);
                    debug!(input = %last.id(), "collector handing off last input");
                    self.output.write(Record::sync(last.into_stream()));
                    return;
                }
                continue;
            }

            let id = self.ready.poll();
            let Some(reader) = self.ready.get_mut(id) else {
                fatal(format!("collector polled unknown descriptor {id}"));
            };
            match reader.read() {
                record @ (Record::Data(_) | Record::TriggerInitialiser) => {
                    self.output.write(record);
                    RuntimeMetrics::incr(&self.metrics.records_forwarded);
                }
                Record::Sync { stream } => reader.replace(stream),
                Record::Collect { stream } => {
                    if self.mode == CollectorMode::Static {
                        fatal("collect record reached a static collector");
                    }
                    self.drop_terminated_waiting();
                    self.ready.put(stream.open_reader());
                }
                Record::SortEnd { level, num } => {
                    if let Some(reader) = self.ready.remove(id) {
                        self.waiting.put(reader);
                    }
                    self.arrive(level, num);
                }
                record @ Record::Terminate { .. } => {
                    self.ready.remove(id);
                    if self.terminate.is_none() {
                        self.terminate = Some(record);
                    }
                    if !self.waiting.is_empty() {
                        warn!(
                            waiting = self.waiting.len(),
                            "collector input terminated while a barrier is pending"
                        );
                    }
                }
            }
        }
    }

    fn arrive(&mut self, level: i32, num: i32) {
        match self.barrier {
            None => self.barrier = Some((level, num)),
            Some(current) if current == (level, num) => {}
            Some((expected_level, expected_num)) => {
                warn!(
                    expected_level,
                    expected_num, level, num, "mismatched sort_end at collector"
                );
                RuntimeMetrics::incr(&self.metrics.barrier_mismatches);
            }
        }
    }

    fn release(&mut self) {
        self.ready.append(&mut self.waiting);
        if let Some((level, num)) = self.barrier.take() {
            if level > 0 {
                self.output.write(Record::sort_end(level - 1, num));
            }
            debug!(level, num, inputs = self.ready.len(), "barrier released");
        }
        RuntimeMetrics::incr(&self.metrics.barriers_released);
    }

    /// Drops parked inputs whose next record is `terminate`.
    fn drop_terminated_waiting(&mut self) {
        let mut idx = 0;
        while idx < self.waiting.len() {
            let terminated = self
                .waiting
                .get_at(idx)
                .is_some_and(|reader| reader.peek(|next| next.is_some_and(Record::is_terminate)));
            if terminated {
                let reader = self.waiting.remove_at(idx);
                let record = reader.read();
                if self.terminate.is_none() {
                    self.terminate = Some(record);
                }
            } else {
                idx += 1;
            }
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("mode", &self.mode)
            .field("ready", &self.ready.len())
            .field("waiting", &self.waiting.len())
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}
