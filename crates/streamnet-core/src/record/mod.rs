//! # Records
//!
//! Records are the unit of communication between entities. A record is
//! either a data record (fields, tags and binding tags keyed by integer
//! names) or a control record steering the network:
//!
//! | Kind | Payload | Meaning |
//! |------|---------|---------|
//! | `data` | fields, tags, btags | user data |
//! | `sync` | stream | replace the stream this record arrived on |
//! | `collect` | stream | add a stream to a dynamic collector |
//! | `sort_end` | level, num | barrier marker for collectors |
//! | `terminate` | local flag | end of stream |
//! | `trigger_initialiser` | none | run a box once without input |
//!
//! ## Module Structure
//!
//! - [`codec`]: Wire form of records

pub mod codec;

use std::fmt;

use fxhash::FxHashMap;

use crate::reference::{InterfaceId, Reference, BYTES_INTERFACE};
use crate::stream::Stream;

/// Integer name of a field, tag or binding tag.
pub type Label = i32;

/// Discriminant of a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// User data.
    Data,
    /// Stream replacement.
    Sync,
    /// Stream addition.
    Collect,
    /// Collector barrier marker.
    SortEnd,
    /// End of stream.
    Terminate,
    /// One-shot box trigger.
    TriggerInitialiser,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Sync => write!(f, "sync"),
            Self::Collect => write!(f, "collect"),
            Self::SortEnd => write!(f, "sort_end"),
            Self::Terminate => write!(f, "terminate"),
            Self::TriggerInitialiser => write!(f, "trigger_initialiser"),
        }
    }
}

/// Encoding mode of a data record's box-language values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Human-readable values.
    Textual,
    /// Native binary values.
    #[default]
    Binary,
}

/// A record travelling on a stream.
#[derive(Debug)]
pub enum Record {
    /// User data.
    Data(DataRecord),
    /// Replace the stream this record arrived on with `stream`.
    Sync {
        /// The replacement stream.
        stream: Stream<Record>,
    },
    /// Add `stream` to the receiving dynamic collector.
    Collect {
        /// The stream to add.
        stream: Stream<Record>,
    },
    /// Collector barrier marker.
    SortEnd {
        /// Nesting level; collectors forward it with `level - 1`.
        level: i32,
        /// Sequence number of the barrier.
        num: i32,
    },
    /// End of stream.
    Terminate {
        /// Set for runtime-internal terminations that never leave the node.
        local: bool,
    },
    /// Run the receiving box once without an input record.
    TriggerInitialiser,
}

impl Record {
    /// Creates a `sync` record.
    #[must_use]
    pub fn sync(stream: Stream<Record>) -> Self {
        Self::Sync { stream }
    }

    /// Creates a `collect` record.
    #[must_use]
    pub fn collect(stream: Stream<Record>) -> Self {
        Self::Collect { stream }
    }

    /// Creates a `sort_end` record.
    #[must_use]
    pub fn sort_end(level: i32, num: i32) -> Self {
        Self::SortEnd { level, num }
    }

    /// Creates a network-visible `terminate` record.
    #[must_use]
    pub fn terminate() -> Self {
        Self::Terminate { local: false }
    }

    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Data(_) => RecordKind::Data,
            Self::Sync { .. } => RecordKind::Sync,
            Self::Collect { .. } => RecordKind::Collect,
            Self::SortEnd { .. } => RecordKind::SortEnd,
            Self::Terminate { .. } => RecordKind::Terminate,
            Self::TriggerInitialiser => RecordKind::TriggerInitialiser,
        }
    }

    /// Returns true for `terminate` records.
    #[must_use]
    pub fn is_terminate(&self) -> bool {
        matches!(self, Self::Terminate { .. })
    }

    /// Returns the data record, if this is one.
    #[must_use]
    pub fn as_data(&self) -> Option<&DataRecord> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Consumes the record, returning the data record if this is one.
    #[must_use]
    pub fn into_data(self) -> Option<DataRecord> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl From<DataRecord> for Record {
    fn from(data: DataRecord) -> Self {
        Self::Data(data)
    }
}

/// A data record.
///
/// Field, tag and binding-tag names are unique within their own namespace.
#[derive(Debug)]
pub struct DataRecord {
    fields: FxHashMap<Label, Reference>,
    tags: FxHashMap<Label, i32>,
    btags: FxHashMap<Label, i32>,
    interface_id: InterfaceId,
    mode: Mode,
}

impl Default for DataRecord {
    fn default() -> Self {
        Self::new(BYTES_INTERFACE)
    }
}

impl DataRecord {
    /// Creates an empty data record produced by box-language `interface_id`.
    #[must_use]
    pub fn new(interface_id: InterfaceId) -> Self {
        Self {
            fields: FxHashMap::default(),
            tags: FxHashMap::default(),
            btags: FxHashMap::default(),
            interface_id,
            mode: Mode::default(),
        }
    }

    /// Sets the encoding mode.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the box-language interface id.
    #[must_use]
    pub fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    /// Sets the box-language interface id.
    pub fn set_interface_id(&mut self, interface_id: InterfaceId) {
        self.interface_id = interface_id;
    }

    /// Returns the encoding mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns a deep copy. Every field reference is copied.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .map(|(name, reference)| (*name, reference.copy()))
                .collect(),
            tags: self.tags.clone(),
            btags: self.btags.clone(),
            interface_id: self.interface_id,
            mode: self.mode,
        }
    }

    // ---------------------------------------------------------------
    // Fields
    // ---------------------------------------------------------------

    /// Sets a field, returning the reference it replaces.
    pub fn set_field(&mut self, name: Label, reference: Reference) -> Option<Reference> {
        self.fields.insert(name, reference)
    }

    /// Returns a field.
    #[must_use]
    pub fn field(&self, name: Label) -> Option<&Reference> {
        self.fields.get(&name)
    }

    /// Returns a field, mutably. Needed to resolve a remote value in place.
    pub fn field_mut(&mut self, name: Label) -> Option<&mut Reference> {
        self.fields.get_mut(&name)
    }

    /// Removes a field.
    pub fn take_field(&mut self, name: Label) -> Option<Reference> {
        self.fields.remove(&name)
    }

    /// Returns true if the field exists.
    #[must_use]
    pub fn has_field(&self, name: Label) -> bool {
        self.fields.contains_key(&name)
    }

    /// Renames a field. Returns false if `from` does not exist.
    pub fn rename_field(&mut self, from: Label, to: Label) -> bool {
        match self.fields.remove(&from) {
            Some(reference) => {
                self.fields.insert(to, reference);
                true
            }
            None => false,
        }
    }

    /// Field names in ascending order.
    #[must_use]
    pub fn field_names(&self) -> Vec<Label> {
        sorted_keys(&self.fields)
    }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    // ---------------------------------------------------------------
    // Tags
    // ---------------------------------------------------------------

    /// Sets a tag, returning the previous value.
    pub fn set_tag(&mut self, name: Label, value: i32) -> Option<i32> {
        self.tags.insert(name, value)
    }

    /// Returns a tag value.
    #[must_use]
    pub fn tag(&self, name: Label) -> Option<i32> {
        self.tags.get(&name).copied()
    }

    /// Removes a tag.
    pub fn take_tag(&mut self, name: Label) -> Option<i32> {
        self.tags.remove(&name)
    }

    /// Returns true if the tag exists.
    #[must_use]
    pub fn has_tag(&self, name: Label) -> bool {
        self.tags.contains_key(&name)
    }

    /// Renames a tag. Returns false if `from` does not exist.
    pub fn rename_tag(&mut self, from: Label, to: Label) -> bool {
        match self.tags.remove(&from) {
            Some(value) => {
                self.tags.insert(to, value);
                true
            }
            None => false,
        }
    }

    /// Tag names in ascending order.
    #[must_use]
    pub fn tag_names(&self) -> Vec<Label> {
        sorted_keys(&self.tags)
    }

    // ---------------------------------------------------------------
    // Binding tags
    // ---------------------------------------------------------------

    /// Sets a binding tag, returning the previous value.
    pub fn set_btag(&mut self, name: Label, value: i32) -> Option<i32> {
        self.btags.insert(name, value)
    }

    /// Returns a binding tag value.
    #[must_use]
    pub fn btag(&self, name: Label) -> Option<i32> {
        self.btags.get(&name).copied()
    }

    /// Removes a binding tag.
    pub fn take_btag(&mut self, name: Label) -> Option<i32> {
        self.btags.remove(&name)
    }

    /// Returns true if the binding tag exists.
    #[must_use]
    pub fn has_btag(&self, name: Label) -> bool {
        self.btags.contains_key(&name)
    }

    /// Renames a binding tag. Returns false if `from` does not exist.
    pub fn rename_btag(&mut self, from: Label, to: Label) -> bool {
        match self.btags.remove(&from) {
            Some(value) => {
                self.btags.insert(to, value);
                true
            }
            None => false,
        }
    }

    /// Binding tag names in ascending order.
    #[must_use]
    pub fn btag_names(&self) -> Vec<Label> {
        sorted_keys(&self.btags)
    }

    pub(crate) fn into_parts(self) -> DataParts {
        DataParts {
            fields: self.fields,
            tags: self.tags,
            btags: self.btags,
            interface_id: self.interface_id,
            mode: self.mode,
        }
    }
}

/// Destructured data record, used by the codec.
pub(crate) struct DataParts {
    pub(crate) fields: FxHashMap<Label, Reference>,
    pub(crate) tags: FxHashMap<Label, i32>,
    pub(crate) btags: FxHashMap<Label, i32>,
    pub(crate) interface_id: InterfaceId,
    pub(crate) mode: Mode,
}

fn sorted_keys<V>(map: &FxHashMap<Label, V>) -> Vec<Label> {
    let mut keys: Vec<Label> = map.keys().copied().collect();
    keys.sort_unstable();
    keys
}
