//! Serializer hook used by storage snapshots.
//!
//! A [`Serializer`] is a byte stream that either writes (`is_serialize`) or
//! reads. The same `stream` call is used in both directions so a component's
//! serialize callback can be written once.

use thiserror::Error;

use crate::{entity::Entity, type_registry::Guid};

/// Bidirectional byte stream.
pub trait Serializer {
    /// `true` when writing, `false` when reading.
    fn is_serialize(&self) -> bool;

    /// Write `data` when serializing, fill it when deserializing.
    fn stream(&mut self, data: &mut [u8]);

    /// Fill `data` with upcoming bytes without consuming them.
    fn peek(&mut self, data: &mut [u8]);

    /// Check if a read ran past the end of the input.
    fn failed(&self) -> bool {
        false
    }

    fn stream_u8(&mut self, value: &mut u8) {
        let mut bytes = [*value];
        self.stream(&mut bytes);
        *value = bytes[0];
    }

    fn stream_u32(&mut self, value: &mut u32) {
        let mut bytes = value.to_le_bytes();
        self.stream(&mut bytes);
        *value = u32::from_le_bytes(bytes);
    }

    fn stream_u128(&mut self, value: &mut u128) {
        let mut bytes = value.to_le_bytes();
        self.stream(&mut bytes);
        *value = u128::from_le_bytes(bytes);
    }
}

/// Serializer writing into a growable buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Serializer for ByteWriter {
    fn is_serialize(&self) -> bool {
        true
    }

    fn stream(&mut self, data: &mut [u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn peek(&mut self, data: &mut [u8]) {
        data.fill(0);
    }
}

/// Serializer reading from a byte slice.
///
/// Reads past the end yield zeroes and set [`Serializer::failed`].
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn copy_out(&mut self, out: &mut [u8]) -> bool {
        match self.data.get(self.pos..self.pos + out.len()) {
            Some(bytes) => {
                out.copy_from_slice(bytes);
                true
            }
            None => {
                out.fill(0);
                self.failed = true;
                false
            }
        }
    }
}

impl Serializer for ByteReader<'_> {
    fn is_serialize(&self) -> bool {
        false
    }

    fn stream(&mut self, data: &mut [u8]) {
        if self.copy_out(data) {
            self.pos += data.len();
        }
    }

    fn peek(&mut self, data: &mut [u8]) {
        self.copy_out(data);
    }

    fn failed(&self) -> bool {
        self.failed
    }
}

/// Errors returned by storage serialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializeError {
    #[error("deserialize target storage is not empty")]
    NotEmpty,
    #[error("bad snapshot header")]
    InvalidHeader,
    #[error("snapshot references unknown type {0}")]
    UnknownGuid(Guid),
    #[error("type {0} was written with a custom serializer but has none registered")]
    MissingCallback(Guid),
    #[error("type {0} was written as raw bytes but is not registered as plain old data")]
    NotPod(Guid),
    #[error("snapshot contains invalid or duplicate entity {0:?}")]
    InvalidEntity(Entity),
    #[error("snapshot is truncated")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader() {
        let mut writer = ByteWriter::new();
        let mut a = 7u32;
        let mut b = u128::MAX - 3;
        writer.stream_u32(&mut a);
        writer.stream_u128(&mut b);

        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);

        let mut peeked = [0u8; 4];
        reader.peek(&mut peeked);
        assert_eq!(u32::from_le_bytes(peeked), 7);

        let (mut a2, mut b2) = (0u32, 0u128);
        reader.stream_u32(&mut a2);
        reader.stream_u128(&mut b2);
        assert_eq!((a2, b2), (7, u128::MAX - 3));
        assert!(!reader.failed());

        let mut extra = 0u32;
        reader.stream_u32(&mut extra);
        assert!(reader.failed());
        assert_eq!(extra, 0);
    }
}
