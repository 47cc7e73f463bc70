//! Side buffer holding variable-length column payloads.

use serde::{Deserialize, Serialize};

use crate::compare::DataError;

/// Reference to a payload stored in a [`SideBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRef {
    pub offset: usize,
    pub len: usize,
}

/// Append-only byte buffer limited by its size in bytes.
/// Payloads are addressed by offset from the start of the buffer, never by pointer,
/// so a chunk and its side buffer can be moved or spilled as a unit.
#[derive(Debug, Clone, Default)]
pub struct SideBuffer {
    limit: usize,
    inner: Vec<u8>,
}

impl SideBuffer {
    pub fn new(limit: usize) -> Self {
        SideBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    /// Creates a buffer with no byte limit.
    pub fn unbounded() -> Self {
        SideBuffer::new(usize::MAX)
    }

    pub(crate) fn from_parts(limit: usize, inner: Vec<u8>) -> Self {
        SideBuffer { limit, inner }
    }

    /// Returns the number of bytes in use.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the number of bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.inner.len())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Drops every payload, keeping the limit.
    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }

    /// Appends a payload. Returns [`None`] if the payload does not fit into the limit.
    pub fn push(&mut self, bytes: &[u8]) -> Option<VarRef> {
        if bytes.len() > self.remaining() {
            return None;
        }

        let offset = self.inner.len();
        self.inner.extend_from_slice(bytes);

        return Some(VarRef {
            offset,
            len: bytes.len(),
        });
    }

    /// Resolves a payload reference.
    pub fn get(&self, var: VarRef) -> Result<&[u8], DataError> {
        var.offset
            .checked_add(var.len)
            .and_then(|end| self.inner.get(var.offset..end))
            .ok_or(DataError::SideBufferOutOfRange {
                offset: var.offset,
                len: var.len,
                size: self.inner.len(),
            })
    }
}
