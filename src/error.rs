//! Error types for code generation failures.

use alloc::string::String;
use core::fmt;

use crate::ir::Arch;

/// Code-generation error.
///
/// Every error is fatal and raised synchronously at the offending call:
/// encoding errors indicate an instruction/operand combination that cannot
/// be expressed, protocol errors indicate a malformed emission program, and
/// architecture-support errors indicate a porting gap. Nothing is retried
/// internally; the whole compilation attempt is aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AsmError {
    /// Operand combination is not legal for the instruction.
    InvalidOperands {
        /// Description of why the operands are invalid.
        detail: String,
    },

    /// Immediate value exceeds the width of its target slot.
    ImmediateOverflow {
        /// The immediate value that overflowed.
        value: i64,
        /// Width of the slot in bytes (1, 2, 4 or 8).
        width: u8,
    },

    /// A resolved label/relocation value does not fit the patch slot.
    ///
    /// Indicates an unreachable branch target or a conceptually wrong
    /// instruction choice (e.g. a short jump to a far label).
    DisplacementOverflow {
        /// The computed displacement or address.
        value: i64,
        /// Width of the patch slot in bytes.
        width: u8,
    },

    /// Register does not belong to the active architecture.
    WrongArchRegister {
        /// Name of the offending register.
        reg: &'static str,
        /// The active architecture.
        arch: Arch,
    },

    /// Condition-code name was not recognized.
    UnknownCondition {
        /// The name that failed to parse.
        name: String,
    },

    /// Architecture name was not recognized by the backend registry.
    UnknownArch {
        /// The name that failed to resolve.
        name: String,
    },

    /// Operation has not been ported to the active architecture.
    NotSupported {
        /// Name of the unported operation.
        op: &'static str,
        /// The active architecture.
        arch: Arch,
    },

    /// A label or relocation was resolved twice.
    AlreadyResolved {
        /// Label name, if it had one.
        label: Option<String>,
    },

    /// A label still had pending uses (or was never bound) when its scope
    /// ended or the context was compiled.
    DanglingLabel {
        /// Label name, if it had one.
        label: Option<String>,
    },

    /// A spill slot was requested outside an active procedure.
    SpillOutsideProc,

    /// Referenced stub was never defined.
    UnknownStub {
        /// The undefined stub name.
        name: String,
    },

    /// A stub name was defined twice.
    DuplicateStub {
        /// The duplicated stub name.
        name: String,
    },

    /// A stub was invoked with the wrong number of arguments.
    ArgcMismatch {
        /// The stub name.
        stub: String,
        /// The stub's declared argument count.
        expected: usize,
        /// The argument count supplied at the call site.
        got: usize,
    },

    /// `stub()`/`runtime()` was called on a context created without a stub
    /// registry.
    StubsNotConfigured,

    /// Named helper operation was not supplied at context creation.
    UnknownHelper {
        /// The helper name.
        name: String,
    },

    /// A retroactive write targeted bytes that were never emitted.
    PatchOutOfBounds {
        /// Requested write offset.
        offset: usize,
        /// Requested write width in bytes.
        size: u8,
        /// Number of bytes emitted so far.
        written: usize,
    },
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsmError::InvalidOperands { detail } => {
                write!(f, "invalid operand combination: {}", detail)
            }
            AsmError::ImmediateOverflow { value, width } => {
                write!(f, "immediate {} does not fit {} byte(s)", value, width)
            }
            AsmError::DisplacementOverflow { value, width } => {
                write!(
                    f,
                    "relocation value {} does not fit {} byte(s)",
                    value, width
                )
            }
            AsmError::WrongArchRegister { reg, arch } => {
                write!(f, "register {} is not available on {}", reg, arch)
            }
            AsmError::UnknownCondition { name } => {
                write!(f, "unknown condition code '{}'", name)
            }
            AsmError::UnknownArch { name } => {
                write!(f, "architecture '{}' isn't supported", name)
            }
            AsmError::NotSupported { op, arch } => {
                write!(f, "{} not supported on {}", op, arch)
            }
            AsmError::AlreadyResolved { label } => match label {
                Some(name) => write!(f, "label '{}' already resolved", name),
                None => write!(f, "relocation already resolved"),
            },
            AsmError::DanglingLabel { label } => match label {
                Some(name) => write!(f, "dangling label '{}'", name),
                None => write!(f, "dangling anonymous label"),
            },
            AsmError::SpillOutsideProc => {
                write!(f, "can't get spill outside a procedure")
            }
            AsmError::UnknownStub { name } => {
                write!(f, "unknown stub: {}", name)
            }
            AsmError::DuplicateStub { name } => {
                write!(f, "stub '{}' is already defined", name)
            }
            AsmError::ArgcMismatch {
                stub,
                expected,
                got,
            } => {
                write!(
                    f,
                    "incorrect number of arguments for stub '{}': expected {}, got {}",
                    stub, expected, got
                )
            }
            AsmError::StubsNotConfigured => {
                write!(f, "assembler was created without a stub registry")
            }
            AsmError::UnknownHelper { name } => {
                write!(f, "unknown helper operation '{}'", name)
            }
            AsmError::PatchOutOfBounds {
                offset,
                size,
                written,
            } => {
                write!(
                    f,
                    "patch of {} byte(s) at offset {} exceeds {} emitted byte(s)",
                    size, offset, written
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AsmError {}
