//! Wire form of records.
//!
//! All integers are big-endian. A record starts with a one-byte kind:
//!
//! ```text
//! data:      0 | btags | tags | fields | mode:u8 | interface:i32
//! sort_end:  3 | level:i32 | num:i32
//! terminate: 4 | local:u8
//! trigger:   5
//!
//! btags, tags: count:u32 (name:i32 value:i32)*
//! fields:      count:u32 (name:i32 node:i32 interface:i32 id:u64)*
//! ```
//!
//! `sync` and `collect` carry node-local streams and never cross a node
//! boundary. Encoding a field runs the outgoing reference hook and decoding
//! runs the incoming hook, each exactly once per reference.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DataRecord, Label, Mode, Record, RecordKind};
use crate::error::fatal;
use crate::reference::{RefKey, ReferenceTable};

const KIND_DATA: u8 = 0;
const KIND_SORT_END: u8 = 3;
const KIND_TERMINATE: u8 = 4;
const KIND_TRIGGER: u8 = 5;

const MODE_TEXTUAL: u8 = 0;
const MODE_BINARY: u8 = 1;

/// Bytes per encoded tag entry.
const TAG_WIRE_SIZE: usize = 8;
/// Bytes per encoded field entry.
const FIELD_WIRE_SIZE: usize = 20;

/// Errors from decoding (or packing values into) the wire form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended early.
    #[error("truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the decoder needed.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Unknown message tag.
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    /// Unknown record kind byte.
    #[error("unknown record kind {0}")]
    UnknownRecordKind(u8),

    /// Unknown mode byte.
    #[error("unknown record mode {0}")]
    UnknownMode(u8),

    /// No interface registered under this id.
    #[error("unknown interface {0}")]
    UnknownInterface(i32),

    /// A value could not be packed or unpacked.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Bytes left over after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

impl CodecError {
    /// Checks that `buf` holds at least `needed` more bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] otherwise.
    pub fn ensure(buf: &impl Buf, needed: usize) -> Result<(), Self> {
        let remaining = buf.remaining();
        if remaining < needed {
            return Err(Self::Truncated { needed, remaining });
        }
        Ok(())
    }
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    CodecError::ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32, CodecError> {
    CodecError::ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    CodecError::ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_count(buf: &mut Bytes, entry_size: usize) -> Result<usize, CodecError> {
    CodecError::ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    CodecError::ensure(buf, count.saturating_mul(entry_size))?;
    Ok(count)
}

pub(crate) fn put_ref_key(buf: &mut BytesMut, key: RefKey, interface: i32) {
    buf.put_i32(key.node);
    buf.put_i32(interface);
    buf.put_u64(key.id);
}

pub(crate) fn get_ref_key(buf: &mut Bytes) -> Result<(RefKey, i32), CodecError> {
    let node = get_i32(buf)?;
    let interface = get_i32(buf)?;
    let id = get_u64(buf)?;
    Ok((RefKey { node, id }, interface))
}

fn put_tags(buf: &mut BytesMut, tags: &fxhash::FxHashMap<Label, i32>) {
    let mut entries: Vec<_> = tags.iter().map(|(k, v)| (*k, *v)).collect();
    entries.sort_unstable();
    buf.put_u32(u32::try_from(entries.len()).unwrap_or(u32::MAX));
    for (name, value) in entries {
        buf.put_i32(name);
        buf.put_i32(value);
    }
}

fn get_tags(buf: &mut Bytes) -> Result<Vec<(Label, i32)>, CodecError> {
    let count = get_count(buf, TAG_WIRE_SIZE)?;
    (0..count)
        .map(|_| Ok((get_i32(buf)?, get_i32(buf)?)))
        .collect()
}

/// Appends the wire form of `record` to `buf`.
///
/// References in data records are handed to their table's outgoing hook.
///
/// # Panics
///
/// `sync` and `collect` records cannot leave their node; encoding one is a
/// fatal violation.
pub fn encode_record(record: Record, buf: &mut BytesMut) {
    match record {
        Record::Data(data) => {
            let parts = data.into_parts();
            buf.put_u8(KIND_DATA);
            put_tags(buf, &parts.btags);
            put_tags(buf, &parts.tags);

            let mut fields: Vec<_> = parts.fields.into_iter().collect();
            fields.sort_unstable_by_key(|(name, _)| *name);
            buf.put_u32(u32::try_from(fields.len()).unwrap_or(u32::MAX));
            for (name, reference) in fields {
                buf.put_i32(name);
                let (key, interface) = reference.into_wire();
                put_ref_key(buf, key, interface);
            }

            buf.put_u8(match parts.mode {
                Mode::Textual => MODE_TEXTUAL,
                Mode::Binary => MODE_BINARY,
            });
            buf.put_i32(parts.interface_id);
        }
        Record::SortEnd { level, num } => {
            buf.put_u8(KIND_SORT_END);
            buf.put_i32(level);
            buf.put_i32(num);
        }
        Record::Terminate { local } => {
            buf.put_u8(KIND_TERMINATE);
            buf.put_u8(u8::from(local));
        }
        Record::TriggerInitialiser => buf.put_u8(KIND_TRIGGER),
        Record::Sync { .. } | Record::Collect { .. } => {
            fatal(format!(
                "{} record cannot be sent to another node",
                record.kind()
            ));
        }
    }
}

/// Reads one record from the front of `buf`.
///
/// Field references are registered with `table` through its incoming hook.
///
/// # Errors
///
/// Returns [`CodecError`] if the buffer is truncated or carries an unknown
/// kind or mode.
pub fn decode_record(buf: &mut Bytes, table: &Arc<ReferenceTable>) -> Result<Record, CodecError> {
    match get_u8(buf)? {
        KIND_DATA => {
            let btags = get_tags(buf)?;
            let tags = get_tags(buf)?;

            let count = get_count(buf, FIELD_WIRE_SIZE)?;
            let mut wire_fields = Vec::with_capacity(count);
            for _ in 0..count {
                let name = get_i32(buf)?;
                let (key, interface) = get_ref_key(buf)?;
                wire_fields.push((name, key, interface));
            }

            let mode = match get_u8(buf)? {
                MODE_TEXTUAL => Mode::Textual,
                MODE_BINARY => Mode::Binary,
                other => return Err(CodecError::UnknownMode(other)),
            };
            let interface_id = get_i32(buf)?;

            // Run the incoming hooks only once the frame is known to be whole.
            let mut data = DataRecord::new(interface_id).with_mode(mode);
            for (name, value) in btags {
                data.set_btag(name, value);
            }
            for (name, value) in tags {
                data.set_tag(name, value);
            }
            for (name, key, interface) in wire_fields {
                data.set_field(name, table.incoming(key, interface));
            }
            Ok(Record::Data(data))
        }
        KIND_SORT_END => {
            let level = get_i32(buf)?;
            let num = get_i32(buf)?;
            Ok(Record::SortEnd { level, num })
        }
        KIND_TERMINATE => Ok(Record::Terminate {
            local: get_u8(buf)? != 0,
        }),
        KIND_TRIGGER => Ok(Record::TriggerInitialiser),
        other => Err(CodecError::UnknownRecordKind(other)),
    }
}

/// Returns true if `kind` may be sent to another node.
#[must_use]
pub fn is_transferable(kind: RecordKind) -> bool {
    !matches!(kind, RecordKind::Sync | RecordKind::Collect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RuntimeMetrics;
    use crate::reference::{InterfaceRegistry, BYTES_INTERFACE};
    use crate::stream::Stream;

    fn table() -> Arc<ReferenceTable> {
        ReferenceTable::local(
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        )
    }

    #[test]
    fn test_control_records() {
        let table = table();
        let mut buf = BytesMut::new();
        encode_record(Record::sort_end(2, 7), &mut buf);
        encode_record(Record::Terminate { local: true }, &mut buf);
        encode_record(Record::TriggerInitialiser, &mut buf);

        let mut bytes = buf.freeze();
        assert!(matches!(
            decode_record(&mut bytes, &table).unwrap(),
            Record::SortEnd { level: 2, num: 7 }
        ));
        assert!(matches!(
            decode_record(&mut bytes, &table).unwrap(),
            Record::Terminate { local: true }
        ));
        assert!(matches!(
            decode_record(&mut bytes, &table).unwrap(),
            Record::TriggerInitialiser
        ));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_data_record_runs_reference_hooks() {
        let table = table();
        let mut data = DataRecord::new(BYTES_INTERFACE).with_mode(Mode::Textual);
        data.set_tag(1, 100);
        data.set_btag(2, 200);
        let reference = table.create(Box::new(b"field".to_vec()), BYTES_INTERFACE);
        let key = reference.key();
        data.set_field(5, reference);

        let mut buf = BytesMut::new();
        encode_record(Record::Data(data), &mut buf);
        assert_eq!(table.export_count(key), Some(1));

        let mut bytes = buf.freeze();
        let decoded = decode_record(&mut bytes, &table).unwrap();
        let mut data = decoded.into_data().unwrap();
        assert_eq!(data.tag(1), Some(100));
        assert_eq!(data.btag(2), Some(200));
        assert_eq!(data.mode(), Mode::Textual);
        assert_eq!(table.export_len(), 0);

        let field = data.field_mut(5).unwrap();
        assert_eq!(field.key(), key);
        assert_eq!(field.downcast_ref::<Vec<u8>>().unwrap(), b"field");
    }

    #[test]
    fn test_truncated_and_unknown() {
        let table = table();
        let mut bytes = Bytes::from_static(&[KIND_SORT_END, 0, 0]);
        assert!(matches!(
            decode_record(&mut bytes, &table),
            Err(CodecError::Truncated { .. })
        ));

        let mut bytes = Bytes::from_static(&[42]);
        assert_eq!(
            decode_record(&mut bytes, &table).unwrap_err(),
            CodecError::UnknownRecordKind(42)
        );

        // A huge field count must not allocate.
        let mut bytes = Bytes::from_static(&[KIND_DATA, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_record(&mut bytes, &table),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_transferable_kinds() {
        assert!(is_transferable(RecordKind::Data));
        assert!(is_transferable(RecordKind::Terminate));
        assert!(!is_transferable(RecordKind::Sync));
        assert!(!is_transferable(RecordKind::Collect));
    }

    #[test]
    #[should_panic(expected = "cannot be sent")]
    fn test_sync_is_not_transferable() {
        let mut buf = BytesMut::new();
        encode_record(Record::sync(Stream::new(1)), &mut buf);
    }
}
