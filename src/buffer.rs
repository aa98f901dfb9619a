//! Growable code buffer with absolute-offset patching.
//!
//! The buffer is an ordered sequence of immutable filled chunks plus one
//! mutable open chunk. Emission always appends to the open chunk; when it
//! runs out of room a new chunk of at least [`CHUNK_SIZE`] bytes is opened.
//! Labels and relocations patch previously emitted bytes through
//! [`CodeBuffer::write_at`], which locates the owning chunk (common case:
//! still the open one).

use alloc::vec::Vec;

use crate::error::AsmError;

/// Minimum chunk allocation, in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Append-only byte store for machine code.
///
/// Owned exclusively by one assembler context; flattened with
/// [`to_bytes`](CodeBuffer::to_bytes) when the context is compiled.
#[derive(Debug)]
pub struct CodeBuffer {
    /// Immutable filled chunks, in emission order.
    filled: Vec<Vec<u8>>,
    /// Total byte length of all filled chunks.
    filled_len: usize,
    /// The open chunk; `current.capacity()` never changes after creation.
    current: Vec<u8>,
}

impl CodeBuffer {
    /// Create an empty buffer with one open chunk.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filled: Vec::new(),
            filled_len: 0,
            current: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    /// Global write cursor: total bytes emitted so far.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.filled_len + self.current.len()
    }

    /// Make sure the open chunk can take `n` more bytes, rolling over to a
    /// fresh chunk of `max(n, CHUNK_SIZE)` bytes when it cannot. Filled
    /// chunks are never shrunk or reallocated.
    fn reserve(&mut self, n: usize) {
        if self.current.len() + n <= self.current.capacity() {
            return;
        }
        let cap = n.max(CHUNK_SIZE);
        let full = core::mem::replace(&mut self.current, Vec::with_capacity(cap));
        self.filled_len += full.len();
        self.filled.push(full);
    }

    /// Append one byte.
    pub fn emit8(&mut self, byte: u8) {
        self.reserve(1);
        self.current.push(byte);
    }

    /// Append a 16-bit value, little-endian.
    pub fn emit16(&mut self, word: u16) {
        self.reserve(2);
        self.current.extend_from_slice(&word.to_le_bytes());
    }

    /// Append a 32-bit value, little-endian.
    pub fn emit32(&mut self, long: u32) {
        self.reserve(4);
        self.current.extend_from_slice(&long.to_le_bytes());
    }

    /// Append a 64-bit value, little-endian.
    pub fn emit64(&mut self, quad: u64) {
        self.reserve(8);
        self.current.extend_from_slice(&quad.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.current.extend_from_slice(bytes);
    }

    /// Overwrite `size` bytes at a previously emitted global `offset` with
    /// the low bytes of `value`, little-endian.
    ///
    /// # Errors
    ///
    /// [`AsmError::PatchOutOfBounds`] if `offset + size` exceeds the bytes
    /// emitted so far — retroactive writes may only target already-written
    /// bytes.
    pub fn write_at(&mut self, size: u8, value: i64, offset: usize) -> Result<(), AsmError> {
        let written = self.offset();
        if offset + size as usize > written {
            return Err(AsmError::PatchOutOfBounds {
                offset,
                size,
                written,
            });
        }

        let bytes = value.to_le_bytes();
        for (i, &b) in bytes.iter().take(size as usize).enumerate() {
            *self.byte_at_mut(offset + i) = b;
        }
        Ok(())
    }

    /// Locate the byte at a global offset. The caller has bounds-checked.
    fn byte_at_mut(&mut self, offset: usize) -> &mut u8 {
        if offset >= self.filled_len {
            return &mut self.current[offset - self.filled_len];
        }
        let mut start = 0;
        for chunk in &mut self.filled {
            if offset < start + chunk.len() {
                return &mut chunk[offset - start];
            }
            start += chunk.len();
        }
        unreachable!("offset {} below filled_len {} but not found", offset, self.filled_len)
    }

    /// Flatten all chunks into one contiguous machine-code image.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.offset());
        for chunk in &self.filled {
            out.extend_from_slice(chunk);
        }
        out.extend_from_slice(&self.current);
        out
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Numeric-range predicates ───────────────────────────────────────────────
//
// Used by the encoders to pick compact immediate forms and by relocation
// resolution to assert a computed value fits its slot before writing it.

/// Whether `num` fits a one-byte slot.
#[inline]
#[must_use]
pub fn fits_byte(num: i64) -> bool {
    (-0x7f..=0x7f).contains(&num)
}

/// Whether `num` fits a two-byte slot.
#[inline]
#[must_use]
pub fn fits_word(num: i64) -> bool {
    (-0x7fff..=0x7fff).contains(&num)
}

/// Whether `num` fits a four-byte slot.
#[inline]
#[must_use]
pub fn fits_long(num: i64) -> bool {
    (-0x7fff_ffff..=0x7fff_ffff).contains(&num)
}

/// Whether `num` fits an eight-byte slot. Always true for `i64` values.
#[inline]
#[must_use]
pub fn fits_quad(_num: i64) -> bool {
    true
}

/// Whether `num` fits a slot of `size` bytes.
#[inline]
#[must_use]
pub fn fits(size: u8, num: i64) -> bool {
    match size {
        1 => fits_byte(num),
        2 => fits_word(num),
        4 => fits_long(num),
        _ => fits_quad(num),
    }
}
