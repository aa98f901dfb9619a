//! Macro assembler: the assembler context and its structural operations.
//!
//! [`Masm`] owns the code buffer, the label/relocation arena, the label
//! scopes, the spill bookkeeping and the stub/runtime hooks. Instruction
//! encoders live in the architecture modules as `impl Masm` blocks; this
//! module provides the structural layer on top of them: procedures, spill
//! slots, label scopes, stub invocation and host-runtime calls.
//!
//! Every operation that is architecture-specific dispatches on the context
//! architecture and fails with [`AsmError::NotSupported`] where the backend
//! has not been ported, so unported features fail loudly rather than
//! silently mis-assemble.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::assembler::{CompiledCode, Options, References, RuntimeBinding};
use crate::buffer::CodeBuffer;
use crate::error::AsmError;
use crate::ir::{Arch, Mem, Operand, Reg};
use crate::reloc::{Label, RelocTable, RelocationEntry, UseKind};
use crate::stubs::Stubs;

/// A caller-supplied named operation merged into the context's operation
/// set at construction time — the extension point for instruction
/// vocabulary beyond the built-in encoders.
pub type Helper = Rc<dyn Fn(&mut Masm, &[Operand]) -> Result<(), AsmError>>;

/// Placeholder pattern for not-yet-known 8-byte absolute addresses.
pub(crate) const PLACEHOLDER64: [u8; 8] = [0xde, 0xad, 0xbe, 0xef, 0xde, 0xad, 0xbe, 0xef];

/// Zap value pushed as stack padding; loud when read by mistake.
pub(crate) const ZAP: i32 = 0xdead_beef_u32 as i32;

/// Reference to a label: an id returned by [`Masm::label`] or a name keyed
/// in the innermost label scope.
#[derive(Debug, Clone, Copy)]
pub enum LabelRef<'a> {
    /// Anonymous label handle.
    Label(Label),
    /// Scope-local label name.
    Name(&'a str),
}

impl From<Label> for LabelRef<'_> {
    fn from(l: Label) -> Self {
        LabelRef::Label(l)
    }
}

impl<'a> From<&'a str> for LabelRef<'a> {
    fn from(name: &'a str) -> Self {
        LabelRef::Name(name)
    }
}

/// A call site waiting for a stub's absolute address.
#[derive(Debug, Clone)]
pub(crate) struct StubUse {
    pub(crate) name: String,
    /// Offset of the 8-byte placeholder within this context's buffer.
    pub(crate) at: usize,
}

/// Macro-assembler context.
///
/// Created through [`crate::generate`]/[`crate::compile`] (or
/// [`Masm::new`] directly), driven by an emission body, then flattened
/// with [`Masm::compile`] into a [`CompiledCode`].
pub struct Masm {
    pub(crate) arch: Arch,
    pub(crate) buf: CodeBuffer,
    pub(crate) relocs: RelocTable,
    pub(crate) abs_relocs: Vec<RelocationEntry>,
    /// Label scopes, innermost last. The root scope is always present.
    scopes: Vec<BTreeMap<String, Label>>,
    stubs: Option<Stubs>,
    helpers: BTreeMap<String, Helper>,
    /// Call sites queued for stubs that have not compiled yet.
    stub_uses: Vec<StubUse>,
    /// Names of stubs referenced by this context, in first-use order.
    stub_refs: Vec<String>,
    runtime_refs: Vec<Rc<RuntimeBinding>>,
    /// Spill-slot counter for the active procedure (`None` outside one).
    spill_count: Option<u32>,
    free_spills: Vec<Mem>,
    /// Active register-restore sets, innermost last.
    spill_restores: Vec<Vec<(Reg, Mem)>>,
    /// Offset right after the most recent return sequence; a restore set
    /// ending exactly here skips its trailing restore.
    last_spill_restore: Option<usize>,
    /// Declared argument count of the procedure being emitted.
    pub(crate) proc_argc: usize,
    /// Whether this context is a stub-batch compilation.
    batch: bool,
}

impl Masm {
    /// Create a context for the given options.
    ///
    /// # Errors
    ///
    /// Propagates stub-registry errors from registering the built-in
    /// runtime-call stub.
    pub fn new(options: Options) -> Result<Self, AsmError> {
        Self::with_batch(options, false)
    }

    pub(crate) fn new_batch(options: Options) -> Result<Self, AsmError> {
        Self::with_batch(options, true)
    }

    fn with_batch(options: Options, batch: bool) -> Result<Self, AsmError> {
        let masm = Self {
            arch: options.arch,
            buf: CodeBuffer::new(),
            relocs: RelocTable::new(),
            abs_relocs: Vec::new(),
            scopes: alloc::vec![BTreeMap::new()],
            stubs: options.stubs,
            helpers: options.helpers,
            stub_uses: Vec::new(),
            stub_refs: Vec::new(),
            runtime_refs: Vec::new(),
            spill_count: None,
            free_spills: Vec::new(),
            spill_restores: Vec::new(),
            last_spill_restore: None,
            proc_argc: 0,
            batch,
        };

        // The runtime-call trampoline is shared by every context on the
        // same registry; register it once.
        #[cfg(feature = "x64")]
        if masm.arch == Arch::X64 {
            if let Some(stubs) = &masm.stubs {
                if !stubs.has(crate::x86::RUNTIME_STUB) {
                    stubs.define(crate::x86::RUNTIME_STUB, 0, crate::x86::call_runtime_body)?;
                }
            }
        }

        Ok(masm)
    }

    /// Target architecture of this context.
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Current global write offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ─── Labels ─────────────────────────────────────────────────────────────

    /// Create an anonymous label.
    pub fn label(&mut self) -> Label {
        self.relocs.create(None)
    }

    /// Create an anonymous relocation (a deferred non-offset value, e.g. a
    /// procedure's stack reservation).
    pub(crate) fn reloc(&mut self) -> Label {
        self.relocs.create(None)
    }

    /// Resolve a label reference: ids pass through, names are found or
    /// created in the innermost label scope.
    pub fn lookup<'a>(&mut self, reference: impl Into<LabelRef<'a>>) -> Label {
        match reference.into() {
            LabelRef::Label(l) => l,
            LabelRef::Name(name) => {
                if let Some(l) = self.scopes.last().and_then(|s| s.get(name)) {
                    return *l;
                }
                let l = self.relocs.create(Some(name.into()));
                self.scopes
                    .last_mut()
                    .expect("root label scope always present")
                    .insert(name.into(), l);
                l
            }
        }
    }

    /// Bind a label at the current offset, patching all recorded uses.
    ///
    /// # Errors
    ///
    /// [`AsmError::AlreadyResolved`] when binding twice;
    /// [`AsmError::DisplacementOverflow`] when a queued use does not fit.
    pub fn bind<'a>(&mut self, reference: impl Into<LabelRef<'a>>) -> Result<(), AsmError> {
        let label = self.lookup(reference);
        let offset = self.offset() as i64;
        self.resolve_label(label, offset)
    }

    /// Run `body` inside a fresh named-label scope. Every label named in
    /// the scope must be bound before the scope ends.
    ///
    /// # Errors
    ///
    /// [`AsmError::DanglingLabel`] for scope labels left unbound.
    pub fn label_scope<F>(&mut self, body: F) -> Result<(), AsmError>
    where
        F: FnOnce(&mut Self) -> Result<(), AsmError>,
    {
        self.scopes.push(BTreeMap::new());
        let result = body(self);
        let scope = self.scopes.pop().expect("scope pushed above");
        result?;

        for (name, label) in &scope {
            if !self.relocs.is_resolved(*label) {
                return Err(AsmError::DanglingLabel {
                    label: Some(name.clone()),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn use_label(
        &mut self,
        label: Label,
        size: u8,
        kind: UseKind,
    ) -> Result<(), AsmError> {
        self.relocs
            .add_use(&mut self.buf, &mut self.abs_relocs, label, size, kind)
    }

    pub(crate) fn resolve_label(&mut self, label: Label, value: i64) -> Result<(), AsmError> {
        self.relocs
            .resolve(&mut self.buf, &mut self.abs_relocs, label, value)
    }

    // ─── Procedures ─────────────────────────────────────────────────────────

    /// Emit a procedure: align to 16 bytes (padding with a debug trap, so a
    /// misaligned fall-through is loud), bind the optional name, emit the
    /// frame setup with a deferred stack reservation, run `body` with a
    /// fresh spill counter and free list, then back-patch the reservation
    /// with the procedure's spill footprint rounded up to a 16-byte
    /// multiple.
    ///
    /// Returns the aligned offset of the procedure entry.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] on architectures without procedure
    /// support; otherwise whatever `body` raises.
    pub fn proc<F>(&mut self, name: Option<&str>, body: F) -> Result<usize, AsmError>
    where
        F: FnOnce(&mut Self) -> Result<(), AsmError>,
    {
        self.proc_with_argc(name, 0, body)
    }

    /// [`Masm::proc`] with a declared stack-argument count; the return
    /// sequence unrolls that many stack slots.
    pub(crate) fn proc_with_argc<F>(
        &mut self,
        name: Option<&str>,
        argc: usize,
        body: F,
    ) -> Result<usize, AsmError>
    where
        F: FnOnce(&mut Self) -> Result<(), AsmError>,
    {
        // Nested procedures must not share spill numbering with the outer
        // one: swap in fresh state, restore on the way out.
        let saved_count = self.spill_count.take();
        let saved_free = core::mem::take(&mut self.free_spills);
        let saved_argc = core::mem::replace(&mut self.proc_argc, argc);
        self.spill_count = Some(0);

        let result = match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.emit_proc_x64(name, body),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "proc",
                arch: self.arch,
            }),
        };

        self.spill_count = saved_count;
        self.free_spills = saved_free;
        self.proc_argc = saved_argc;
        result
    }

    /// Emit the bare frame prologue (push frame pointer, set frame
    /// pointer) for a manually managed frame.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] if the backend lacks frame support.
    pub fn entry(&mut self) -> Result<(), AsmError> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.emit_entry_x64(),
            #[cfg(feature = "ia32")]
            Arch::Ia32 => self.emit_entry_ia32(),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "entry",
                arch: self.arch,
            }),
        }
    }

    /// Emit the return sequence: replay every active spill restore
    /// (innermost first), restore the stack and frame pointers, and return,
    /// unrolling the procedure's declared stack arguments (rounded up to
    /// preserve 16-byte stack alignment).
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] if the backend lacks frame support.
    pub fn exit(&mut self) -> Result<(), AsmError> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.emit_exit_x64(),
            #[cfg(feature = "ia32")]
            Arch::Ia32 => self.emit_exit_ia32(),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "exit",
                arch: self.arch,
            }),
        }
    }

    /// Memory cell of the `i`-th incoming stack argument.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] if the backend lacks a calling
    /// convention.
    pub fn arg(&self, i: usize) -> Result<Mem, AsmError> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => Ok(Mem::disp(Reg::Rbp, 8 * (i as i32 + 2))),
            #[cfg(feature = "ia32")]
            Arch::Ia32 => Ok(Mem::disp(Reg::Ebp, 4 * (i as i32 + 2))),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "arg",
                arch: self.arch,
            }),
        }
    }

    // ─── Spill slots ────────────────────────────────────────────────────────

    /// Acquire a spill slot from the current procedure's free list, or
    /// synthesize a new one. The caller must release it with
    /// [`Masm::free_spill`].
    ///
    /// # Errors
    ///
    /// [`AsmError::SpillOutsideProc`] outside a procedure.
    pub fn spill_slot(&mut self) -> Result<Mem, AsmError> {
        let count = self.spill_count.ok_or(AsmError::SpillOutsideProc)?;
        if let Some(slot) = self.free_spills.pop() {
            return Ok(slot);
        }
        self.spill_count = Some(count + 1);
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => Ok(Mem::disp(Reg::Rbp, -8 * (count as i32 + 1))),
            #[cfg(feature = "ia32")]
            Arch::Ia32 => Ok(Mem::disp(Reg::Ebp, -4 * (count as i32 + 1))),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "spill",
                arch: self.arch,
            }),
        }
    }

    /// Return a slot obtained from [`Masm::spill_slot`] to the free list.
    ///
    /// # Errors
    ///
    /// [`AsmError::SpillOutsideProc`] outside a procedure.
    pub fn free_spill(&mut self, slot: Mem) -> Result<(), AsmError> {
        if self.spill_count.is_none() {
            return Err(AsmError::SpillOutsideProc);
        }
        self.free_spills.push(slot);
        Ok(())
    }

    /// Run `body` with one spill slot, releasing it afterwards.
    ///
    /// # Errors
    ///
    /// Whatever slot acquisition or `body` raises.
    pub fn spill<F>(&mut self, body: F) -> Result<(), AsmError>
    where
        F: FnOnce(&mut Self, Mem) -> Result<(), AsmError>,
    {
        let slot = self.spill_slot()?;
        let result = body(self, slot);
        self.free_spill(slot)?;
        result
    }

    /// Run `body` with `n` spill slots, releasing them afterwards.
    ///
    /// # Errors
    ///
    /// Whatever slot acquisition or `body` raises.
    pub fn spill_n<F>(&mut self, n: usize, body: F) -> Result<(), AsmError>
    where
        F: FnOnce(&mut Self, &[Mem]) -> Result<(), AsmError>,
    {
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(self.spill_slot()?);
        }
        let result = body(self, &slots);
        for slot in slots {
            self.free_spill(slot)?;
        }
        result
    }

    /// Save `reg` to a spill slot, run `body`, and restore it — including
    /// before every return sequence emitted inside `body`.
    ///
    /// # Errors
    ///
    /// Whatever slot acquisition, the moves or `body` raise.
    pub fn spill_reg<F>(&mut self, reg: Reg, body: F) -> Result<(), AsmError>
    where
        F: FnOnce(&mut Self) -> Result<(), AsmError>,
    {
        self.spill_regs(&[reg], body)
    }

    /// Plural form of [`Masm::spill_reg`].
    ///
    /// # Errors
    ///
    /// Whatever slot acquisition, the moves or `body` raise.
    pub fn spill_regs<F>(&mut self, regs: &[Reg], body: F) -> Result<(), AsmError>
    where
        F: FnOnce(&mut Self) -> Result<(), AsmError>,
    {
        self.spill_n(regs.len(), |m, slots| {
            let restores: Vec<(Reg, Mem)> =
                regs.iter().copied().zip(slots.iter().copied()).collect();
            for (reg, slot) in &restores {
                m.mov(*slot, *reg)?;
            }

            // The return sequence replays this set before its epilogue.
            m.spill_restores.push(restores);
            let result = body(m);
            let restores = m.spill_restores.pop().expect("pushed above");
            result?;

            // A body that just returned has already restored; re-emitting
            // here would be dead code after `ret`.
            if m.last_spill_restore != Some(m.offset()) {
                for (reg, slot) in &restores {
                    m.mov(*reg, *slot)?;
                }
            }
            Ok(())
        })
    }

    /// Spill footprint of the active procedure, in bytes, before rounding.
    pub(crate) fn spill_bytes(&self) -> u32 {
        self.spill_count.unwrap_or(0) * 8
    }

    /// Replay every active restore set, innermost first.
    pub(crate) fn restore_spills(&mut self) -> Result<(), AsmError> {
        let sets: Vec<Vec<(Reg, Mem)>> = self.spill_restores.iter().rev().cloned().collect();
        for set in sets {
            for (reg, slot) in set {
                self.mov(reg, slot)?;
            }
        }
        Ok(())
    }

    pub(crate) fn mark_spill_restore(&mut self) {
        self.last_spill_restore = Some(self.offset());
    }

    // ─── Stubs and runtime calls ────────────────────────────────────────────

    /// Invoke the named stub, loading its (possibly not yet known) absolute
    /// address into `dst` and calling through it. Arguments are passed on
    /// the stack, padded to keep 16-byte alignment.
    ///
    /// # Errors
    ///
    /// [`AsmError::StubsNotConfigured`] without a registry,
    /// [`AsmError::UnknownStub`] for undefined names and
    /// [`AsmError::ArgcMismatch`] when the argument count differs from the
    /// stub's declared arity — all before any bytes are emitted.
    pub fn stub(&mut self, dst: Reg, name: &str, args: &[Operand]) -> Result<(), AsmError> {
        let stubs = self.stubs.clone().ok_or(AsmError::StubsNotConfigured)?;
        let argc = stubs.argc(name)?;
        if argc != args.len() {
            return Err(AsmError::ArgcMismatch {
                stub: name.into(),
                expected: argc,
                got: args.len(),
            });
        }

        // Retain the stub so its code outlives every call site.
        if !self.stub_refs.iter().any(|n| n == name) {
            self.stub_refs.push(name.into());
        }

        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.emit_stub_x64(&stubs, dst, name, args),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "stub",
                arch: self.arch,
            }),
        }
    }

    pub(crate) fn queue_stub_use(&mut self, name: &str, at: usize) {
        self.stub_uses.push(StubUse {
            name: name.into(),
            at,
        });
    }

    /// Call back into the host runtime through the built-in trampoline
    /// stub. At most four arguments are supported; the trampoline loads
    /// them into the native calling-convention registers.
    ///
    /// # Errors
    ///
    /// [`AsmError::StubsNotConfigured`] without a registry;
    /// [`AsmError::InvalidOperands`] for more than four arguments.
    pub fn runtime(
        &mut self,
        binding: &Rc<RuntimeBinding>,
        args: &[Operand],
    ) -> Result<(), AsmError> {
        if self.stubs.is_none() {
            return Err(AsmError::StubsNotConfigured);
        }
        if args.len() > 4 {
            return Err(AsmError::InvalidOperands {
                detail: "at most 4 runtime-call arguments are supported".into(),
            });
        }
        self.runtime_refs.push(Rc::clone(binding));

        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.emit_runtime_x64(binding, args),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "runtime",
                arch: self.arch,
            }),
        }
    }

    // ─── Helpers and utilities ──────────────────────────────────────────────

    /// Invoke a named helper operation supplied at construction.
    ///
    /// # Errors
    ///
    /// [`AsmError::UnknownHelper`] for unknown names; otherwise whatever
    /// the helper raises.
    pub fn helper(&mut self, name: &str, args: &[Operand]) -> Result<(), AsmError> {
        let f = self
            .helpers
            .get(name)
            .cloned()
            .ok_or_else(|| AsmError::UnknownHelper { name: name.into() })?;
        (*f)(self, args)
    }

    /// Absolute-address operand for an in-process byte buffer.
    #[must_use]
    pub fn ptr(&self, buf: &[u8], offset: usize) -> Operand {
        crate::assembler::ptr(buf, offset)
    }

    /// Load the raw IEEE-754 bit pattern of a double into a register.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] if the backend lacks the transfer.
    pub fn load_double(&mut self, dst: Reg, value: f64) -> Result<(), AsmError> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.mov(dst, Operand::Raw64(value.to_le_bytes())),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "load_double",
                arch: self.arch,
            }),
        }
    }

    /// Load the raw IEEE-754 bit pattern of a float into a register
    /// (zero-extended).
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] if the backend lacks the transfer.
    pub fn load_float(&mut self, dst: Reg, value: f32) -> Result<(), AsmError> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => self.mov(dst, Operand::Raw32(value.to_le_bytes())),
            #[allow(unreachable_patterns)]
            _ => Err(AsmError::NotSupported {
                op: "load_float",
                arch: self.arch,
            }),
        }
    }

    // ─── Compilation ────────────────────────────────────────────────────────

    /// Flatten the context into a [`CompiledCode`]: compile pending stubs,
    /// patch every queued stub call site, verify no label dangles, and
    /// concatenate the buffer.
    ///
    /// # Errors
    ///
    /// [`AsmError::DanglingLabel`] for unbound labels with recorded uses;
    /// stub-registry errors from batch compilation.
    pub fn compile(self) -> Result<CompiledCode, AsmError> {
        let (code, leftover) = self.finish()?;
        if let Some(use_) = leftover.first() {
            // Unreachable after a successful compile_pending; defensive
            // for registries shared across half-finished contexts.
            return Err(AsmError::UnknownStub {
                name: use_.name.clone(),
            });
        }
        Ok(code)
    }

    /// [`Masm::compile`], but hands unresolved stub uses back to the
    /// caller instead of failing. Used by the stub registry for batch
    /// images whose sibling stubs compile in a later wave.
    pub(crate) fn finish(mut self) -> Result<(CompiledCode, Vec<StubUse>), AsmError> {
        if !self.batch {
            if let Some(stubs) = self.stubs.clone() {
                stubs.compile_pending()?;
            }
        }

        let leftover = self.resolve_stub_uses()?;

        for scope in &self.scopes {
            for (name, label) in scope {
                if !self.relocs.is_resolved(*label) {
                    return Err(AsmError::DanglingLabel {
                        label: Some(name.clone()),
                    });
                }
            }
        }
        if let Some(name) = self.relocs.find_dangling() {
            return Err(AsmError::DanglingLabel { label: name });
        }

        let code = CompiledCode {
            code: self.buf.to_bytes(),
            relocations: self.abs_relocs,
            references: References {
                stubs: self.stub_refs,
                runtime: self.runtime_refs,
            },
        };
        Ok((code, leftover))
    }

    /// Patch queued stub call sites whose address (or, for batch images,
    /// in-image offset) is now known.
    fn resolve_stub_uses(&mut self) -> Result<Vec<StubUse>, AsmError> {
        let uses = core::mem::take(&mut self.stub_uses);
        if uses.is_empty() {
            return Ok(Vec::new());
        }
        let stubs = self.stubs.clone().ok_or(AsmError::StubsNotConfigured)?;

        let mut leftover = Vec::new();
        for use_ in uses {
            if let Some(addr) = stubs.address(&use_.name) {
                self.buf.write_at(8, addr as i64, use_.at)?;
            } else if self.batch {
                if let Some(offset) = stubs.offset(&use_.name) {
                    // Sibling stub in the same batch image: its absolute
                    // address becomes known with the image's base, so defer
                    // to the post-placement relocation pass.
                    self.abs_relocs.push(RelocationEntry {
                        size: 8,
                        offset: use_.at,
                        target: offset as u64,
                    });
                } else {
                    leftover.push(use_);
                }
            } else {
                leftover.push(use_);
            }
        }
        Ok(leftover)
    }
}

impl core::fmt::Debug for Masm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Masm")
            .field("arch", &self.arch)
            .field("offset", &self.buf.offset())
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}
