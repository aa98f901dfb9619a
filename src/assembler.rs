//! Compile pipeline: context options, compiled-code results, and the
//! placement boundary.
//!
//! The pipeline is: [`generate`] creates a context, runs the caller's
//! emission body and flattens the buffer into a [`CompiledCode`] — machine
//! code plus the relocations that need absolute addresses. An external
//! allocator (anything implementing [`Placer`]) then copies the code into
//! an executable region and [`place`] patches every relocation with the
//! region's addresses. [`compile`] chains the two.
//!
//! Executable-memory management itself is deliberately out of this crate:
//! [`Placer`] is the whole interface boundary. [`VecPlacer`] is a plain
//! byte-array implementation for tests and dry runs.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::buffer;
use crate::error::AsmError;
use crate::ir::{Arch, Operand};
use crate::masm::{Helper, Masm};
use crate::reloc::RelocationEntry;
use crate::stubs::Stubs;

/// Context-creation options.
///
/// `helpers` are additional named operations merged into the macro
/// assembler's operation set, letting callers extend the instruction
/// vocabulary without modifying the core (invoked via
/// [`Masm::helper`]).
#[derive(Clone)]
pub struct Options {
    /// Target architecture.
    pub arch: Arch,
    /// Shared stub registry, if stub/runtime calls are wanted.
    pub stubs: Option<Stubs>,
    /// Named helper operations.
    pub helpers: BTreeMap<String, Helper>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            arch: Arch::X64,
            stubs: None,
            helpers: BTreeMap::new(),
        }
    }
}

impl core::fmt::Debug for Options {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Options")
            .field("arch", &self.arch)
            .field("stubs", &self.stubs.is_some())
            .field("helpers", &self.helpers.len())
            .finish()
    }
}

/// Host-runtime callback descriptor: the addresses the generated code
/// needs to call back into host-language logic through the native
/// trampoline. Produced by the (out-of-scope) host binding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeBinding {
    /// Address of the native shim invoked by the trampoline.
    pub call_address: u64,
    /// Opaque argument handed to the shim (usually a state struct).
    pub call_argument: u64,
}

impl RuntimeBinding {
    /// Create a binding from raw addresses.
    #[must_use]
    pub fn new(call_address: u64, call_argument: u64) -> Rc<Self> {
        Rc::new(Self {
            call_address,
            call_argument,
        })
    }
}

/// Objects the generated code still points at; the caller must keep them
/// alive as long as the placed code is callable.
#[derive(Debug, Clone, Default)]
pub struct References {
    /// Names of every stub referenced by the compiled code.
    pub stubs: Vec<String>,
    /// Runtime bindings embedded into the compiled code.
    pub runtime: Vec<Rc<RuntimeBinding>>,
}

/// Result of compiling one assembler context.
#[derive(Debug, Clone)]
#[must_use]
pub struct CompiledCode {
    /// The machine-code image.
    pub code: Vec<u8>,
    /// Absolute-address patches to apply after placement.
    pub relocations: Vec<RelocationEntry>,
    /// Retained references.
    pub references: References,
}

/// The delegated executable-memory boundary.
///
/// Implementations copy a code image into memory that can eventually be
/// executed and support patching the placed copy (relocation resolution
/// happens after placement by definition).
pub trait Placer {
    /// Copy `code` into its final region and return the region's base
    /// address.
    ///
    /// # Errors
    ///
    /// Implementation-defined allocation failures.
    fn place(&mut self, code: &[u8]) -> Result<u64, AsmError>;

    /// Overwrite `bytes` at `offset` within the region based at `base`.
    ///
    /// # Errors
    ///
    /// [`AsmError::PatchOutOfBounds`] when the write leaves the region.
    fn patch(&mut self, base: u64, offset: usize, bytes: &[u8]) -> Result<(), AsmError>;
}

/// Place a compiled image and resolve its relocations: copy the code,
/// then overwrite each relocation slot with the absolute address of its
/// in-image target. Returns the image's base address (the entry point of
/// code emitted at offset zero).
///
/// # Errors
///
/// Placement failures, plus [`AsmError::DisplacementOverflow`] if an
/// address does not fit a sub-8-byte relocation slot.
pub fn place(compiled: &CompiledCode, placer: &mut dyn Placer) -> Result<u64, AsmError> {
    let base = placer.place(&compiled.code)?;
    for reloc in &compiled.relocations {
        let address = base + reloc.target;
        if reloc.size < 8 && !buffer::fits(reloc.size, address as i64) {
            return Err(AsmError::DisplacementOverflow {
                value: address as i64,
                width: reloc.size,
            });
        }
        let bytes = address.to_le_bytes();
        placer.patch(base, reloc.offset, &bytes[..reloc.size as usize])?;
    }
    Ok(base)
}

/// Run `body` against a fresh context and compile the result.
///
/// # Errors
///
/// Whatever the body or compilation raises.
pub fn generate<F>(options: Options, body: F) -> Result<CompiledCode, AsmError>
where
    F: FnOnce(&mut Masm) -> Result<(), AsmError>,
{
    let mut masm = Masm::new(options)?;
    body(&mut masm)?;
    masm.compile()
}

/// [`generate`] + [`place`]: compile and place in one step, returning the
/// entry address.
///
/// # Errors
///
/// Whatever generation or placement raises.
pub fn compile<F>(options: Options, placer: &mut dyn Placer, body: F) -> Result<u64, AsmError>
where
    F: FnOnce(&mut Masm) -> Result<(), AsmError>,
{
    let compiled = generate(options, body)?;
    place(&compiled, placer)
}

/// Absolute-address operand for an in-process byte buffer (+ offset):
/// embeds the buffer's memory address into emitted code or relocation
/// targets.
#[must_use]
pub fn ptr(buf: &[u8], offset: usize) -> Operand {
    Operand::Raw64((buf.as_ptr() as usize as u64 + offset as u64).to_le_bytes())
}

// ─── VecPlacer ──────────────────────────────────────────────────────────────

/// A [`Placer`] that "places" images into plain byte vectors at synthetic
/// page-aligned addresses. Nothing is executable; this exists for tests,
/// dry runs and inspecting fully patched images.
#[derive(Debug, Default)]
pub struct VecPlacer {
    images: Vec<(u64, Vec<u8>)>,
}

/// First synthetic base address handed out by [`VecPlacer`].
const VEC_PLACER_BASE: u64 = 0x1000_0000;

impl VecPlacer {
    /// Create an empty placer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The placed image based at `base`, if any.
    #[must_use]
    pub fn image(&self, base: u64) -> Option<&[u8]> {
        self.images
            .iter()
            .find(|(b, _)| *b == base)
            .map(|(_, image)| image.as_slice())
    }

    /// All placed images, in placement order.
    #[must_use]
    pub fn images(&self) -> &[(u64, Vec<u8>)] {
        &self.images
    }
}

impl Placer for VecPlacer {
    fn place(&mut self, code: &[u8]) -> Result<u64, AsmError> {
        let base = match self.images.last() {
            Some((base, image)) => {
                let end = base + image.len() as u64;
                // Next page boundary.
                (end | 0xfff) + 1
            }
            None => VEC_PLACER_BASE,
        };
        self.images.push((base, code.to_vec()));
        Ok(base)
    }

    fn patch(&mut self, base: u64, offset: usize, bytes: &[u8]) -> Result<(), AsmError> {
        let image = self
            .images
            .iter_mut()
            .find(|(b, _)| *b == base)
            .map(|(_, image)| image)
            .ok_or(AsmError::PatchOutOfBounds {
                offset,
                size: bytes.len() as u8,
                written: 0,
            })?;
        let end = offset + bytes.len();
        if end > image.len() {
            return Err(AsmError::PatchOutOfBounds {
                offset,
                size: bytes.len() as u8,
                written: image.len(),
            });
        }
        image[offset..end].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_placer_places_at_page_boundaries() {
        let mut placer = VecPlacer::new();
        let a = placer.place(&[1, 2, 3]).unwrap();
        let b = placer.place(&[4]).unwrap();
        assert_eq!(a % 0x1000, 0);
        assert_eq!(b % 0x1000, 0);
        assert!(b > a);
        assert_eq!(placer.image(a), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn vec_placer_patches_in_bounds_only() {
        let mut placer = VecPlacer::new();
        let base = placer.place(&[0; 8]).unwrap();
        placer.patch(base, 4, &[9, 9, 9, 9]).unwrap();
        assert_eq!(placer.image(base).unwrap()[4..], [9, 9, 9, 9]);

        let err = placer.patch(base, 6, &[0; 4]).unwrap_err();
        assert!(matches!(err, AsmError::PatchOutOfBounds { .. }));
    }

    #[test]
    fn place_resolves_relocations_against_base() {
        let compiled = CompiledCode {
            code: alloc::vec![0; 16],
            relocations: alloc::vec![RelocationEntry {
                size: 8,
                offset: 4,
                target: 12,
            }],
            references: References::default(),
        };
        let mut placer = VecPlacer::new();
        let base = place(&compiled, &mut placer).unwrap();

        let image = placer.image(base).unwrap();
        let mut patched = [0u8; 8];
        patched.copy_from_slice(&image[4..12]);
        assert_eq!(u64::from_le_bytes(patched), base + 12);
    }

    #[test]
    fn ptr_embeds_buffer_address() {
        let data = [1u8, 2, 3, 4];
        let op = ptr(&data, 2);
        let Operand::Raw64(bytes) = op else {
            panic!("expected raw 8-byte operand");
        };
        assert_eq!(
            u64::from_le_bytes(bytes),
            data.as_ptr() as usize as u64 + 2
        );
    }
}
