//! # jitasm-rs — In-Process x86-64 Macro-Assembler & JIT Code Generator
//!
//! `jitasm-rs` lets a host program describe machine instructions at a
//! symbolic level — typed registers, memory operands, labels — and
//! produces a contiguous machine-code image plus the relocation records
//! needed to patch absolute addresses once the image lands in executable
//! memory.
//!
//! ## Quick start
//!
//! ```rust
//! use jitasm_rs::{generate, Options, Reg};
//!
//! let code = generate(Options::default(), |m| {
//!     m.entry()?;
//!     m.mov(Reg::Rax, 42)?;
//!     m.exit()
//! })
//! .unwrap();
//! assert_eq!(
//!     code.code,
//!     [
//!         0x55, // push rbp
//!         0x48, 0x89, 0xe5, // mov rbp, rsp
//!         0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, // mov rax, 42
//!         0x48, 0x89, 0xec, // mov rsp, rbp
//!         0x5d, // pop rbp
//!         0xc3, // ret
//!     ]
//! );
//! ```
//!
//! ## What's here
//!
//! - **Pure Rust, `#![forbid(unsafe_code)]`** — executable-memory
//!   management is delegated through the [`Placer`] boundary; this crate
//!   only ever produces bytes and patch lists.
//! - **x86-64 encoder** — REX/ModRM/SIB computation, compact-form opcode
//!   selection, integer/floating-point/branch families.
//! - **Macro layer** — procedures with automatic spill-slot management,
//!   label scopes, stub invocation, host-runtime callbacks.
//! - **Stub registry** — named shared subroutines referenced before their
//!   code exists, compiled once in batches, call sites back-patched.
//! - **`no_std` + `alloc`** — the `std` feature (default) only adds
//!   `std::error::Error`.
//!
//! ## Pipeline
//!
//! [`generate`] runs an emission body against a fresh [`Masm`] context and
//! returns [`CompiledCode`]. An external allocator implementing [`Placer`]
//! copies the image into executable memory; [`place`] applies the
//! relocations against the placed copy. [`compile`] chains both and
//! returns the entry address.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An assembler intentionally performs many narrowing / sign-changing casts
// between integer widths and uses dense hex literals without separators.
// The lints below are expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc
)]

extern crate alloc;

/// Compile pipeline: options, results, placement boundary.
pub mod assembler;
/// Growable code buffer with absolute-offset patching.
pub mod buffer;
/// Error types for code generation failures.
pub mod error;
#[cfg(feature = "ia32")]
pub(crate) mod ia32;
/// Typed operands: architectures, registers, memory references, conditions.
pub mod ir;
/// The macro-assembler context and its structural operations.
pub mod masm;
/// Deferred-value resolution: labels and relocations.
pub mod reloc;
/// Stub registry: named shared subroutines compiled lazily, in batches.
pub mod stubs;
/// x86 instruction encoder (REX, ModR/M, SIB, opcode families).
pub(crate) mod x86;

// Re-exports
pub use assembler::{
    compile, generate, place, ptr, CompiledCode, Options, Placer, References, RuntimeBinding,
    VecPlacer,
};
pub use buffer::CodeBuffer;
pub use error::AsmError;
pub use ir::{Arch, Cond, Mem, Operand, Reg, RoundMode, Xmm};
pub use masm::{Helper, LabelRef, Masm};
pub use reloc::{Label, RelocationEntry};
pub use stubs::Stubs;
