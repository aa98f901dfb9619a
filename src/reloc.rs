//! Deferred-value resolution: labels and relocations.
//!
//! A label records future "uses" — byte positions that need a value the
//! emitter does not know yet — and, once resolved, rewrites all of them.
//! Uses come in three kinds: `Direct` (write the value as-is, e.g. a
//! procedure's deferred stack reservation), `Relative` (write
//! `value − use offset`, the displacement form jumps need) and `Absolute`
//! (the final value is a post-placement memory address; the use is recorded
//! in the context's external relocation list instead of being written
//! in-buffer).
//!
//! Entries live in an arena owned by the assembler context; the public
//! handle is the copyable [`Label`] id.

use alloc::string::String;
use alloc::vec::Vec;

use crate::buffer::{self, CodeBuffer};
use crate::error::AsmError;

/// Handle to a label/relocation entry in its owning assembler context.
///
/// Handles are only meaningful for the context that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) usize);

/// How a queued use turns the resolved value into patch bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UseKind {
    /// Write the resolved value verbatim.
    Direct,
    /// Write `value + delta − use offset` (signed relative displacement).
    Relative(i64),
    /// Record `{size, use offset, value + delta}` in the external
    /// relocation list; nothing is written in-buffer.
    Absolute(i64),
}

/// One queued use of an unresolved entry.
#[derive(Debug, Clone, Copy)]
struct Use {
    size: u8,
    offset: usize,
    kind: UseKind,
}

#[derive(Debug)]
struct Entry {
    name: Option<String>,
    value: Option<i64>,
    uses: Vec<Use>,
}

/// An absolute-address patch to apply after the code image is placed in
/// executable memory.
///
/// `target` is an offset into the compiled image; the placer overwrites
/// `size` bytes at `offset` with the absolute address of `target` once the
/// image's base address is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelocationEntry {
    /// Patch width in bytes (1, 2, 4 or 8).
    pub size: u8,
    /// Byte offset of the patch slot within the compiled image.
    pub offset: usize,
    /// Symbolic target: an offset within the compiled image whose absolute
    /// address is wanted.
    pub target: u64,
}

/// Arena of label/relocation entries for one assembler context.
#[derive(Debug, Default)]
pub(crate) struct RelocTable {
    entries: Vec<Entry>,
}

impl RelocTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Create a fresh unresolved entry.
    pub(crate) fn create(&mut self, name: Option<String>) -> Label {
        let id = self.entries.len();
        self.entries.push(Entry {
            name,
            value: None,
            uses: Vec::new(),
        });
        Label(id)
    }

    pub(crate) fn is_resolved(&self, label: Label) -> bool {
        self.entries[label.0].value.is_some()
    }

    pub(crate) fn name(&self, label: Label) -> Option<&str> {
        self.entries[label.0].name.as_deref()
    }

    /// Record a use of `label` covering the `size` placeholder bytes that
    /// were just emitted. Resolves on the spot if the value is known.
    pub(crate) fn add_use(
        &mut self,
        buf: &mut CodeBuffer,
        abs: &mut Vec<RelocationEntry>,
        label: Label,
        size: u8,
        kind: UseKind,
    ) -> Result<(), AsmError> {
        let offset = buf.offset() - size as usize;
        let use_ = Use { size, offset, kind };

        if let Some(value) = self.entries[label.0].value {
            apply_use(buf, abs, use_, value)
        } else {
            self.entries[label.0].uses.push(use_);
            Ok(())
        }
    }

    /// Resolve `label` with `value`, flushing every queued use exactly once.
    ///
    /// The use list is snapshot and cleared before any write, so resolution
    /// stays idempotent even if patching re-enters this entry.
    pub(crate) fn resolve(
        &mut self,
        buf: &mut CodeBuffer,
        abs: &mut Vec<RelocationEntry>,
        label: Label,
        value: i64,
    ) -> Result<(), AsmError> {
        let entry = &mut self.entries[label.0];
        if entry.value.is_some() {
            return Err(AsmError::AlreadyResolved {
                label: entry.name.clone(),
            });
        }
        entry.value = Some(value);

        let uses = core::mem::take(&mut entry.uses);
        for use_ in uses {
            apply_use(buf, abs, use_, value)?;
        }
        Ok(())
    }

    /// First entry that still has pending uses or is an unbound named
    /// label, if any. Called at compile time to reject half-finished code.
    pub(crate) fn find_dangling(&self) -> Option<Option<String>> {
        self.entries
            .iter()
            .find(|e| !e.uses.is_empty())
            .map(|e| e.name.clone())
    }
}

fn apply_use(
    buf: &mut CodeBuffer,
    abs: &mut Vec<RelocationEntry>,
    use_: Use,
    value: i64,
) -> Result<(), AsmError> {
    let patch = match use_.kind {
        UseKind::Direct => value,
        UseKind::Relative(delta) => value + delta - use_.offset as i64,
        UseKind::Absolute(delta) => {
            abs.push(RelocationEntry {
                size: use_.size,
                offset: use_.offset,
                target: (value + delta) as u64,
            });
            return Ok(());
        }
    };

    if !buffer::fits(use_.size, patch) {
        return Err(AsmError::DisplacementOverflow {
            value: patch,
            width: use_.size,
        });
    }
    buf.write_at(use_.size, patch, use_.offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (CodeBuffer, Vec<RelocationEntry>, RelocTable) {
        (CodeBuffer::new(), Vec::new(), RelocTable::new())
    }

    #[test]
    fn backward_use_resolves_immediately() {
        let (mut buf, mut abs, mut table) = setup();
        let label = table.create(None);
        table.resolve(&mut buf, &mut abs, label, 0).unwrap();

        buf.emit8(0xeb);
        buf.emit8(0xaa);
        table
            .add_use(&mut buf, &mut abs, label, 1, UseKind::Relative(-1))
            .unwrap();

        // rel8 = 0 + (−1) − 1 = −2: jump back to offset 0.
        assert_eq!(buf.to_bytes(), [0xeb, 0xfe]);
    }

    #[test]
    fn forward_use_patches_on_resolve() {
        let (mut buf, mut abs, mut table) = setup();
        let label = table.create(None);

        buf.emit8(0xeb);
        buf.emit8(0xaa);
        table
            .add_use(&mut buf, &mut abs, label, 1, UseKind::Relative(-1))
            .unwrap();
        buf.emit8(0x90);
        buf.emit8(0x90);

        table.resolve(&mut buf, &mut abs, label, 4).unwrap();
        // rel8 = 4 − 1 − 1 = 2: skip the two nops.
        assert_eq!(buf.to_bytes(), [0xeb, 0x02, 0x90, 0x90]);
    }

    #[test]
    fn round_trip_all_widths() {
        for size in [1u8, 2, 4, 8] {
            let (mut buf, mut abs, mut table) = setup();
            let label = table.create(None);

            for _ in 0..size {
                buf.emit8(0xaa);
            }
            let use_offset = buf.offset() - size as usize;
            table
                .add_use(&mut buf, &mut abs, label, size, UseKind::Relative(0))
                .unwrap();

            let bound = 100i64;
            table.resolve(&mut buf, &mut abs, label, bound).unwrap();

            let bytes = buf.to_bytes();
            let mut patched = [0u8; 8];
            patched[..size as usize]
                .copy_from_slice(&bytes[use_offset..use_offset + size as usize]);
            let value = i64::from_le_bytes(patched);
            assert_eq!(value, bound - use_offset as i64);
        }
    }

    #[test]
    fn direct_use_writes_value() {
        let (mut buf, mut abs, mut table) = setup();
        let reloc = table.create(None);
        buf.emit32(0xdead_beef);
        table
            .add_use(&mut buf, &mut abs, reloc, 4, UseKind::Direct)
            .unwrap();
        table.resolve(&mut buf, &mut abs, reloc, 0x20).unwrap();
        assert_eq!(buf.to_bytes(), [0x20, 0, 0, 0]);
    }

    #[test]
    fn absolute_use_records_relocation() {
        let (mut buf, mut abs, mut table) = setup();
        let label = table.create(None);
        buf.emit64(0xdead_beef_dead_beef);
        table
            .add_use(&mut buf, &mut abs, label, 8, UseKind::Absolute(0))
            .unwrap();
        table.resolve(&mut buf, &mut abs, label, 0x40).unwrap();

        // Placeholder untouched; the patch happens post-placement.
        assert_eq!(buf.to_bytes(), 0xdead_beef_dead_beef_u64.to_le_bytes());
        assert_eq!(
            abs,
            [RelocationEntry {
                size: 8,
                offset: 0,
                target: 0x40
            }]
        );
    }

    #[test]
    fn resolve_twice_is_an_error() {
        let (mut buf, mut abs, mut table) = setup();
        let label = table.create(Some("done".into()));
        table.resolve(&mut buf, &mut abs, label, 0).unwrap();
        let err = table.resolve(&mut buf, &mut abs, label, 4).unwrap_err();
        assert_eq!(
            err,
            AsmError::AlreadyResolved {
                label: Some("done".into())
            }
        );
    }

    #[test]
    fn displacement_overflow_is_fatal() {
        let (mut buf, mut abs, mut table) = setup();
        let label = table.create(None);
        buf.emit8(0xeb);
        buf.emit8(0xaa);
        table
            .add_use(&mut buf, &mut abs, label, 1, UseKind::Relative(-1))
            .unwrap();
        let err = table.resolve(&mut buf, &mut abs, label, 4096).unwrap_err();
        assert!(matches!(err, AsmError::DisplacementOverflow { width: 1, .. }));
    }

    #[test]
    fn dangling_detection() {
        let (mut buf, mut abs, mut table) = setup();
        assert!(table.find_dangling().is_none());

        let label = table.create(Some("skip".into()));
        buf.emit8(0xeb);
        buf.emit8(0xaa);
        table
            .add_use(&mut buf, &mut abs, label, 1, UseKind::Relative(-1))
            .unwrap();
        assert_eq!(table.find_dangling(), Some(Some("skip".into())));

        table.resolve(&mut buf, &mut abs, label, 2).unwrap();
        assert!(table.find_dangling().is_none());
    }
}
