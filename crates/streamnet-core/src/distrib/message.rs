//! Distribution messages and their wire form.
//!
//! Every frame starts with a one-byte [`CommTag`]:
//!
//! | Tag | Body |
//! |-----|------|
//! | `record` | destination, record |
//! | `block` / `unblock` | destination |
//! | `ref_set` | reference, packed value |
//! | `ref_fetch` | reference |
//! | `ref_update` | reference, delta:i32 |
//! | `update` | none (local only) |
//! | `stop` | none |
//!
//! A destination travels as `dest, parent, dynamic_index, parent_node,
//! dynamic_loc`; its `node` is filled in from the sender on receipt.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Destination, NodeId};
use crate::record::codec::{
    decode_record, encode_record, get_i32, get_ref_key, get_u8, put_ref_key, CodecError,
};
use crate::record::Record;
use crate::reference::{FieldValue, InterfaceId, InterfaceRegistry, RefKey, ReferenceTable};

/// One-byte message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommTag {
    /// A record for a destination.
    Record = 0,
    /// Stop sending to a destination.
    Block = 1,
    /// Resume sending to a destination.
    Unblock = 2,
    /// A fetched value.
    RefSet = 3,
    /// Request for a value.
    RefFetch = 4,
    /// Holder count update.
    RefUpdate = 5,
    /// Retry buffered records (sent to the local node only).
    Update = 6,
    /// Shut the input manager down.
    Stop = 7,
}

impl TryFrom<u8> for CommTag {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Record,
            1 => Self::Block,
            2 => Self::Unblock,
            3 => Self::RefSet,
            4 => Self::RefFetch,
            5 => Self::RefUpdate,
            6 => Self::Update,
            7 => Self::Stop,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// A decoded distribution message.
#[derive(Debug)]
pub enum Message {
    /// A record for `dest`.
    Record {
        /// Consumer-side endpoint.
        dest: Destination,
        /// The record.
        record: Record,
    },
    /// The receiver of `dest` is backed up.
    Block {
        /// Blocked endpoint.
        dest: Destination,
    },
    /// The receiver of `dest` drained its backlog.
    Unblock {
        /// Unblocked endpoint.
        dest: Destination,
    },
    /// The value of a fetched reference.
    RefSet {
        /// Reference identity.
        key: RefKey,
        /// Owning interface.
        interface: InterfaceId,
        /// The value.
        data: FieldValue,
    },
    /// A request for a reference's value.
    RefFetch {
        /// Reference identity.
        key: RefKey,
        /// Owning interface.
        interface: InterfaceId,
        /// Node asking for the value.
        requester: NodeId,
    },
    /// A holder count adjustment.
    RefUpdate {
        /// Reference identity.
        key: RefKey,
        /// Owning interface.
        interface: InterfaceId,
        /// Count delta.
        delta: i32,
    },
    /// Retry buffered records.
    Update,
    /// Stop the input manager.
    Stop,
}

impl Message {
    /// Returns the tag of this message.
    #[must_use]
    pub fn tag(&self) -> CommTag {
        match self {
            Self::Record { .. } => CommTag::Record,
            Self::Block { .. } => CommTag::Block,
            Self::Unblock { .. } => CommTag::Unblock,
            Self::RefSet { .. } => CommTag::RefSet,
            Self::RefFetch { .. } => CommTag::RefFetch,
            Self::RefUpdate { .. } => CommTag::RefUpdate,
            Self::Update => CommTag::Update,
            Self::Stop => CommTag::Stop,
        }
    }
}

fn put_dest(buf: &mut BytesMut, dest: &Destination) {
    buf.put_i32(dest.dest);
    buf.put_i32(dest.parent);
    buf.put_i32(dest.dynamic_index);
    buf.put_i32(dest.parent_node);
    buf.put_i32(dest.dynamic_loc);
}

fn get_dest(buf: &mut Bytes, from: NodeId) -> Result<Destination, CodecError> {
    Ok(Destination {
        node: from,
        dest: get_i32(buf)?,
        parent: get_i32(buf)?,
        dynamic_index: get_i32(buf)?,
        parent_node: get_i32(buf)?,
        dynamic_loc: get_i32(buf)?,
    })
}

/// Encodes a `ref_set` frame from a borrowed value.
///
/// # Errors
///
/// Returns [`CodecError`] if the interface is unknown or cannot pack the value.
pub fn encode_ref_set(
    key: RefKey,
    interface: InterfaceId,
    data: &FieldValue,
    interfaces: &InterfaceRegistry,
) -> Result<Bytes, CodecError> {
    let iface = interfaces
        .get(interface)
        .ok_or(CodecError::UnknownInterface(interface))?;
    let mut buf = BytesMut::new();
    buf.put_u8(CommTag::RefSet as u8);
    put_ref_key(&mut buf, key, interface);
    iface.pack(data, &mut buf)?;
    Ok(buf.freeze())
}

/// Encodes a message.
///
/// Encoding a record runs the outgoing hook of each of its references.
/// The `requester` of a `ref_fetch` is implied by the sender and not
/// written.
///
/// # Errors
///
/// Returns [`CodecError`] if a `ref_set` value cannot be packed.
pub fn encode(message: Message, interfaces: &InterfaceRegistry) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    buf.put_u8(message.tag() as u8);
    match message {
        Message::Record { dest, record } => {
            put_dest(&mut buf, &dest);
            encode_record(record, &mut buf);
        }
        Message::Block { dest } | Message::Unblock { dest } => put_dest(&mut buf, &dest),
        Message::RefSet {
            key,
            interface,
            data,
        } => return encode_ref_set(key, interface, &data, interfaces),
        Message::RefFetch { key, interface, .. } => put_ref_key(&mut buf, key, interface),
        Message::RefUpdate {
            key,
            interface,
            delta,
        } => {
            put_ref_key(&mut buf, key, interface);
            buf.put_i32(delta);
        }
        Message::Update | Message::Stop => {}
    }
    Ok(buf.freeze())
}

/// Decodes a frame received from node `from`.
///
/// # Errors
///
/// Returns [`CodecError`] for unknown tags, truncated frames, unknown
/// interfaces or trailing bytes.
pub fn decode(
    from: NodeId,
    mut frame: Bytes,
    table: &Arc<ReferenceTable>,
) -> Result<Message, CodecError> {
    let tag = CommTag::try_from(get_u8(&mut frame)?)?;
    let message = match tag {
        CommTag::Record => {
            let dest = get_dest(&mut frame, from)?;
            let record = decode_record(&mut frame, table)?;
            Message::Record { dest, record }
        }
        CommTag::Block => Message::Block {
            dest: get_dest(&mut frame, from)?,
        },
        CommTag::Unblock => Message::Unblock {
            dest: get_dest(&mut frame, from)?,
        },
        CommTag::RefSet => {
            let (key, interface) = get_ref_key(&mut frame)?;
            let iface = table
                .interfaces()
                .get(interface)
                .ok_or(CodecError::UnknownInterface(interface))?;
            let data = iface.unpack(&mut frame)?;
            Message::RefSet {
                key,
                interface,
                data,
            }
        }
        CommTag::RefFetch => {
            let (key, interface) = get_ref_key(&mut frame)?;
            Message::RefFetch {
                key,
                interface,
                requester: from,
            }
        }
        CommTag::RefUpdate => {
            let (key, interface) = get_ref_key(&mut frame)?;
            let delta = get_i32(&mut frame)?;
            Message::RefUpdate {
                key,
                interface,
                delta,
            }
        }
        CommTag::Update => Message::Update,
        CommTag::Stop => Message::Stop,
    };
    if !frame.is_empty() {
        return Err(CodecError::TrailingBytes(frame.len()));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RuntimeMetrics;
    use crate::reference::BYTES_INTERFACE;

    fn table() -> Arc<ReferenceTable> {
        ReferenceTable::local(
            Arc::new(InterfaceRegistry::new()),
            Arc::new(RuntimeMetrics::new()),
        )
    }

    fn dest() -> Destination {
        Destination {
            node: 1,
            dest: 4,
            parent: 2,
            parent_node: 0,
            dynamic_index: 3,
            dynamic_loc: 1,
        }
    }

    #[test]
    fn test_destination_node_comes_from_sender() {
        let table = table();
        let frame = encode(Message::Block { dest: dest() }, table.interfaces()).unwrap();
        let Message::Block { dest: got } = decode(7, frame, &table).unwrap() else {
            panic!("expected block");
        };
        assert_eq!(got, Destination { node: 7, ..dest() });
    }

    #[test]
    fn test_record_message() {
        let table = table();
        let frame = encode(
            Message::Record {
                dest: dest(),
                record: Record::sort_end(1, 9),
            },
            table.interfaces(),
        )
        .unwrap();
        match decode(1, frame, &table).unwrap() {
            Message::Record { dest: got, record } => {
                assert_eq!(got.dest, 4);
                assert!(matches!(record, Record::SortEnd { level: 1, num: 9 }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ref_messages() {
        let table = table();
        let key = RefKey { node: 3, id: 12 };

        let frame = encode_ref_set(key, BYTES_INTERFACE, &(Box::new(b"v".to_vec()) as FieldValue), table.interfaces()).unwrap();
        match decode(3, frame, &table).unwrap() {
            Message::RefSet { key: k, data, .. } => {
                assert_eq!(k, key);
                assert_eq!(data.downcast_ref::<Vec<u8>>().unwrap(), b"v");
            }
            other => panic!("unexpected {other:?}"),
        }

        let frame = encode(
            Message::RefFetch {
                key,
                interface: BYTES_INTERFACE,
                requester: 99,
            },
            table.interfaces(),
        )
        .unwrap();
        assert!(matches!(
            decode(5, frame, &table).unwrap(),
            Message::RefFetch { requester: 5, .. }
        ));

        let frame = encode(
            Message::RefUpdate {
                key,
                interface: BYTES_INTERFACE,
                delta: -2,
            },
            table.interfaces(),
        )
        .unwrap();
        assert!(matches!(
            decode(5, frame, &table).unwrap(),
            Message::RefUpdate { delta: -2, .. }
        ));
    }

    #[test]
    fn test_bad_frames() {
        let table = table();
        assert_eq!(
            decode(0, Bytes::from_static(&[200]), &table).unwrap_err(),
            CodecError::UnknownTag(200)
        );
        assert_eq!(
            decode(0, Bytes::from_static(&[CommTag::Stop as u8, 1]), &table).unwrap_err(),
            CodecError::TrailingBytes(1)
        );
        assert!(matches!(
            decode(0, Bytes::from_static(&[CommTag::Block as u8, 0]), &table),
            Err(CodecError::Truncated { .. })
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(CommTag::RefSet as u8);
        put_ref_key(&mut buf, RefKey { node: 1, id: 1 }, 55);
        assert_eq!(
            decode(1, buf.freeze(), &table).unwrap_err(),
            CodecError::UnknownInterface(55)
        );
    }
}
