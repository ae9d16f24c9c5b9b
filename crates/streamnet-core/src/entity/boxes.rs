//! Box entities: user code between two streams.

use std::sync::Arc;

use tracing::trace;

use crate::error::fatal;
use crate::metrics::RuntimeMetrics;
use crate::record::{DataRecord, Record};
use crate::reference::{FieldValue, InterfaceId, Reference, ReferenceTable};
use crate::stream::{StreamReader, StreamWriter};

/// User code run by a box for every data record.
///
/// Implemented for any `FnMut(&mut BoxContext)` closure.
pub trait BoxFn: Send + 'static {
    /// Handles the current record.
    fn invoke(&mut self, ctx: &mut BoxContext<'_>);
}

impl<F> BoxFn for F
where
    F: FnMut(&mut BoxContext<'_>) + Send + 'static,
{
    fn invoke(&mut self, ctx: &mut BoxContext<'_>) {
        self(ctx);
    }
}

/// Handle passed to a box invocation.
///
/// Gives access to the record being processed and lets the box emit
/// records downstream.
pub struct BoxContext<'a> {
    record: Option<DataRecord>,
    interface_id: InterfaceId,
    output: &'a StreamWriter<Record>,
    table: &'a Arc<ReferenceTable>,
    emitted: usize,
}

impl BoxContext<'_> {
    /// Returns the record being processed, unless it was taken.
    #[must_use]
    pub fn record(&self) -> Option<&DataRecord> {
        self.record.as_ref()
    }

    /// Mutable access to the record being processed.
    pub fn record_mut(&mut self) -> Option<&mut DataRecord> {
        self.record.as_mut()
    }

    /// Takes ownership of the record being processed.
    pub fn take_record(&mut self) -> Option<DataRecord> {
        self.record.take()
    }

    /// Creates an empty record of the same interface as the input.
    #[must_use]
    pub fn new_record(&self) -> DataRecord {
        DataRecord::new(self.interface_id)
    }

    /// Wraps `data` in a new reference owned by this node.
    #[must_use]
    pub fn create_ref(&self, data: FieldValue, interface: InterfaceId) -> Reference {
        self.table.create(data, interface)
    }

    /// Writes `record` to the box output, blocking while it is full.
    pub fn emit(&mut self, record: DataRecord) {
        self.output.write(Record::Data(record));
        self.emitted += 1;
    }

    /// Returns the number of records emitted so far in this invocation.
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Returns the node's reference table.
    #[must_use]
    pub fn table(&self) -> &Arc<ReferenceTable> {
        self.table
    }
}

/// The box entity.
pub struct BoxEntity<F> {
    name: String,
    input: StreamReader<Record>,
    output: StreamWriter<Record>,
    func: F,
    table: Arc<ReferenceTable>,
    metrics: Arc<RuntimeMetrics>,
}

impl<F: BoxFn> BoxEntity<F> {
    /// Creates a box running `func` between `input` and `output`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        input: StreamReader<Record>,
        output: StreamWriter<Record>,
        func: F,
        table: Arc<ReferenceTable>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            func,
            table,
            metrics,
        }
    }

    /// Runs until a `terminate` record has been forwarded.
    ///
    /// Data records and `trigger_initialiser` invoke the box; `sync`
    /// switches the input stream; `sort_end` and `terminate` are forwarded
    /// unchanged.
    ///
    /// # Panics
    ///
    /// A `collect` record on a box input is a fatal protocol violation.
    pub fn run(mut self) {
        loop {
            match self.input.read() {
                Record::Data(record) => self.invoke(record),
                Record::TriggerInitialiser => self.invoke(DataRecord::default()),
                Record::Sync { stream } => self.input.replace(stream),
                record @ Record::SortEnd { .. } => self.output.write(record),
                record @ Record::Terminate { .. } => {
                    self.output.write(record);
                    return;
                }
                Record::Collect { .. } => {
                    fatal(format!("collect record reached box {}", self.name));
                }
            }
        }
    }

    fn invoke(&mut self, record: DataRecord) {
        let mut ctx = BoxContext {
            interface_id: record.interface_id(),
            record: Some(record),
            output: &self.output,
            table: &self.table,
            emitted: 0,
        };
        self.func.invoke(&mut ctx);
        trace!(name = %self.name, emitted = ctx.emitted, "box invoked");
        RuntimeMetrics::incr(&self.metrics.box_invocations);
    }
}

impl<F> std::fmt::Debug for BoxEntity<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxEntity")
            .field("name", &self.name)
            .field("input", &self.input.id())
            .finish_non_exhaustive()
    }
}
