//! Box-language interfaces.
//!
//! Field values are opaque to the runtime. Each box language registers an
//! [`Interface`] that knows how to copy its values and how to move them
//! across a node boundary. References carry the id of the interface that
//! owns their value.

use std::any::Any;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fxhash::FxHashMap;

use crate::error::fatal;
use crate::record::codec::CodecError;

/// An opaque field value owned by the runtime.
pub type FieldValue = Box<dyn Any + Send>;

/// Identifies a box-language interface.
pub type InterfaceId = i32;

/// Id of the built-in [`BytesInterface`].
pub const BYTES_INTERFACE: InterfaceId = 0;

/// Operations a box language provides for its field values.
pub trait Interface: Send + Sync {
    /// Human-readable name used in diagnostics.
    fn name(&self) -> &str;

    /// Returns an independent copy of `data`.
    fn copy(&self, data: &FieldValue) -> FieldValue;

    /// Appends the wire form of `data` to `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidPayload`] if `data` is not a value of
    /// this interface.
    fn pack(&self, data: &FieldValue, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Reads one value from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if `buf` is truncated or malformed.
    fn unpack(&self, buf: &mut Bytes) -> Result<FieldValue, CodecError>;

    /// Size of `data` in bytes, if the interface can tell.
    fn size(&self, _data: &FieldValue) -> Option<usize> {
        None
    }
}

/// Interface for plain byte vectors (`Vec<u8>`).
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesInterface;

impl BytesInterface {
    fn bytes(data: &FieldValue) -> Option<&Vec<u8>> {
        data.downcast_ref::<Vec<u8>>()
    }
}

impl Interface for BytesInterface {
    fn name(&self) -> &str {
        "bytes"
    }

    fn copy(&self, data: &FieldValue) -> FieldValue {
        match Self::bytes(data) {
            Some(bytes) => Box::new(bytes.clone()),
            None => fatal("bytes interface asked to copy a non-byte value"),
        }
    }

    fn pack(&self, data: &FieldValue, buf: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = Self::bytes(data)
            .ok_or_else(|| CodecError::InvalidPayload("expected Vec<u8>".to_string()))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| CodecError::InvalidPayload("byte field exceeds 4 GiB".to_string()))?;
        buf.put_u32(len);
        buf.put_slice(bytes);
        Ok(())
    }

    fn unpack(&self, buf: &mut Bytes) -> Result<FieldValue, CodecError> {
        CodecError::ensure(buf, 4)?;
        let len = buf.get_u32() as usize;
        CodecError::ensure(buf, len)?;
        Ok(Box::new(buf.split_to(len).to_vec()))
    }

    fn size(&self, data: &FieldValue) -> Option<usize> {
        Self::bytes(data).map(Vec::len)
    }
}

/// Registry of interfaces keyed by [`InterfaceId`].
#[derive(Clone)]
pub struct InterfaceRegistry {
    interfaces: FxHashMap<InterfaceId, Arc<dyn Interface>>,
}

impl InterfaceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            interfaces: FxHashMap::default(),
        }
    }

    /// Creates a registry holding the built-in interfaces.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(BYTES_INTERFACE, Arc::new(BytesInterface));
        registry
    }

    /// Registers `interface` under `id`, returning the one it replaces.
    pub fn register(
        &mut self,
        id: InterfaceId,
        interface: Arc<dyn Interface>,
    ) -> Option<Arc<dyn Interface>> {
        self.interfaces.insert(id, interface)
    }

    /// Looks up an interface.
    #[must_use]
    pub fn get(&self, id: InterfaceId) -> Option<&Arc<dyn Interface>> {
        self.interfaces.get(&id)
    }

    /// Looks up an interface that must exist.
    ///
    /// # Panics
    ///
    /// An unknown interface id is a fatal violation.
    #[must_use]
    pub fn expect(&self, id: InterfaceId) -> &Arc<dyn Interface> {
        match self.interfaces.get(&id) {
            Some(interface) => interface,
            None => fatal(format!("unknown box-language interface {id}")),
        }
    }

    /// Returns the number of registered interfaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    /// Returns true if no interface is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self
            .interfaces
            .iter()
            .map(|(id, i)| (*id, i.name().to_string()))
            .collect();
        names.sort_unstable();
        f.debug_struct("InterfaceRegistry")
            .field("interfaces", &names)
            .finish()
    }
}
