//! x86 instruction encoder, x86-64 primary with the ia32 subset.
//!
//! Every method encodes one symbolic instruction into exact bytes: REX
//! prefix synthesis, ModRM/SIB addressing-mode bytes and displacement
//! selection, then the opcode-family dispatch. Families (binary ops, unary
//! ops, shifts, scalar floating point) are table-driven: each concrete
//! mnemonic differs only by its opcode bytes and digit, never by control
//! flow, and the dispatch always prefers the most compact legal encoding.
//!
//! On [`Arch::Ia32`] the REX machinery degrades to pure validation (no
//! prefix bytes exist there) and the 64-bit-only families refuse to
//! encode.

#[cfg(feature = "x64")]
use alloc::rc::Rc;

#[cfg(feature = "x64")]
use crate::assembler::RuntimeBinding;
use crate::buffer::{fits_byte, fits_long};
use crate::error::AsmError;
use crate::ir::{Arch, Cond, Mem, Operand, Reg, RoundMode, Xmm};
use crate::masm::{LabelRef, Masm, PLACEHOLDER64};
#[cfg(feature = "x64")]
use crate::masm::ZAP;
use crate::reloc::UseKind;
#[cfg(feature = "x64")]
use crate::stubs::Stubs;

/// Name of the auto-registered host-runtime trampoline stub.
pub(crate) const RUNTIME_STUB: &str = "__runtime__";

// ─── Opcode tables ──────────────────────────────────────────────────────────

/// Opcode table for a two-operand integer instruction.
///
/// Per operation the encoder picks among up to five legal encodings:
/// sign-extended imm8, accumulator-with-imm32 short form, generic imm32,
/// register-to-rm, and rm-to-register (when the operation has one).
struct BinOp {
    /// Accumulator short form, 32-bit immediate.
    rax_imm: u8,
    /// Generic immediate form, 32-bit immediate.
    imm: u8,
    /// Sign-extended 8-bit immediate form, if the operation has one.
    imm8: Option<u8>,
    /// ModRM digit for the immediate forms.
    digit: u8,
    /// Opcode for `op r/m, reg`.
    mr: u8,
    /// Opcode for `op reg, r/m`, if the operation has one.
    rm: Option<u8>,
}

const ADD: BinOp = BinOp { rax_imm: 0x05, imm: 0x81, imm8: Some(0x83), digit: 0, mr: 0x01, rm: Some(0x03) };
const OR: BinOp = BinOp { rax_imm: 0x0d, imm: 0x81, imm8: Some(0x83), digit: 1, mr: 0x09, rm: Some(0x0b) };
const AND: BinOp = BinOp { rax_imm: 0x25, imm: 0x81, imm8: Some(0x83), digit: 4, mr: 0x21, rm: Some(0x23) };
const SUB: BinOp = BinOp { rax_imm: 0x2d, imm: 0x81, imm8: Some(0x83), digit: 5, mr: 0x29, rm: Some(0x2b) };
const XOR: BinOp = BinOp { rax_imm: 0x35, imm: 0x81, imm8: Some(0x83), digit: 6, mr: 0x31, rm: Some(0x33) };
const CMP: BinOp = BinOp { rax_imm: 0x3d, imm: 0x81, imm8: Some(0x83), digit: 7, mr: 0x39, rm: Some(0x3b) };
const TEST: BinOp = BinOp { rax_imm: 0xa9, imm: 0xf7, imm8: None, digit: 0, mr: 0x85, rm: None };

impl Masm {
    // ─── Operand classification ─────────────────────────────────────────────

    fn check_reg(&self, reg: Reg) -> Result<(), AsmError> {
        if reg == Reg::Rip || reg.size_bits() != self.arch.word_bits() {
            return Err(AsmError::WrongArchRegister {
                reg: reg.name(),
                arch: self.arch,
            });
        }
        Ok(())
    }

    fn check_xmm(&self, xmm: Xmm) -> Result<(), AsmError> {
        if self.arch != Arch::X64 && xmm.is_extended() {
            return Err(AsmError::WrongArchRegister {
                reg: "xmm8+",
                arch: self.arch,
            });
        }
        Ok(())
    }

    fn check_mem(&self, mem: &Mem) -> Result<(), AsmError> {
        if mem.base == Reg::Rip {
            if self.arch != Arch::X64 {
                return Err(AsmError::WrongArchRegister {
                    reg: "rip",
                    arch: self.arch,
                });
            }
            if mem.index.is_some() {
                return Err(AsmError::InvalidOperands {
                    detail: "rip-relative addressing takes no index register".into(),
                });
            }
            return Ok(());
        }
        self.check_reg(mem.base)?;
        if let Some(index) = mem.index {
            self.check_reg(index)?;
            if index.low_bits() == 4 {
                return Err(AsmError::InvalidOperands {
                    detail: "stack pointer cannot be an index register".into(),
                });
            }
        }
        Ok(())
    }

    /// Extension bit of the register selected by `op` (validating the
    /// operand along the way).
    fn ext_of(&self, op: &Operand) -> Result<bool, AsmError> {
        match op {
            Operand::Reg(r) => {
                self.check_reg(*r)?;
                Ok(r.is_extended())
            }
            Operand::Xmm(x) => {
                self.check_xmm(*x)?;
                Ok(x.is_extended())
            }
            Operand::Mem(m) => {
                self.check_mem(m)?;
                Ok(m.base != Reg::Rip && m.base.is_extended())
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "immediate carries no register bits".into(),
            }),
        }
    }

    /// Low ModRM bits of a register operand.
    fn low_of(&self, op: &Operand) -> Result<u8, AsmError> {
        match op {
            Operand::Reg(r) => Ok(r.low_bits()),
            Operand::Xmm(x) => Ok(x.low_bits()),
            _ => Err(AsmError::InvalidOperands {
                detail: "register operand expected".into(),
            }),
        }
    }

    fn require_x64(&self, op: &'static str) -> Result<(), AsmError> {
        if self.arch == Arch::X64 {
            Ok(())
        } else {
            Err(AsmError::NotSupported {
                op,
                arch: self.arch,
            })
        }
    }

    fn accumulator(&self) -> Reg {
        match self.arch {
            Arch::X64 => Reg::Rax,
            Arch::Ia32 => Reg::Eax,
        }
    }

    // ─── Prefix computation ─────────────────────────────────────────────────

    /// REX.R/X/B bits for a (reg-field operand, rm operand) pair.
    fn rex_bits(&self, r: Option<&Operand>, rm: Option<&Operand>) -> Result<u8, AsmError> {
        let mut bits = 0u8;
        if let Some(op) = r {
            if self.ext_of(op)? {
                bits |= 0x4;
            }
        }
        if let Some(op) = rm {
            match op {
                Operand::Mem(m) => {
                    self.check_mem(m)?;
                    if m.base != Reg::Rip && m.base.is_extended() {
                        bits |= 0x1;
                    }
                    if let Some(index) = m.index {
                        if index.is_extended() {
                            bits |= 0x2;
                        }
                    }
                }
                _ => {
                    if self.ext_of(op)? {
                        bits |= 0x1;
                    }
                }
            }
        }
        Ok(bits)
    }

    /// Emit a mandatory `REX.W` prefix (64-bit operation width). On ia32
    /// this degenerates to operand validation; no byte exists there.
    fn rexw(&mut self, r: Option<&Operand>, rm: Option<&Operand>) -> Result<(), AsmError> {
        let bits = self.rex_bits(r, rm)?;
        if self.arch == Arch::X64 {
            self.buf.emit8(0x48 | bits);
        }
        Ok(())
    }

    /// Emit a prefix only when required: always when `wide` (on x64), else
    /// only when some operand needs an extension bit — keeping encodings
    /// minimal for low registers.
    fn rex_opt(
        &mut self,
        wide: bool,
        r: Option<&Operand>,
        rm: Option<&Operand>,
    ) -> Result<(), AsmError> {
        let bits = self.rex_bits(r, rm)?;
        if (wide && self.arch == Arch::X64) || bits != 0 {
            self.buf.emit8(0x40 | u8::from(wide) << 3 | bits);
        }
        Ok(())
    }

    // ─── Addressing-mode byte ───────────────────────────────────────────────

    /// Emit ModRM (+ SIB escape + displacement) for `reg_low` against `rm`.
    fn modrm(&mut self, reg_low: u8, rm: &Operand) -> Result<(), AsmError> {
        match rm {
            Operand::Reg(r) => {
                self.buf.emit8(0xc0 | reg_low << 3 | r.low_bits());
                Ok(())
            }
            Operand::Xmm(x) => {
                self.buf.emit8(0xc0 | reg_low << 3 | x.low_bits());
                Ok(())
            }
            Operand::Mem(m) => self.modrm_mem(reg_low, m),
            _ => Err(AsmError::InvalidOperands {
                detail: "immediate cannot be a ModRM operand".into(),
            }),
        }
    }

    fn modrm_mem(&mut self, reg_low: u8, m: &Mem) -> Result<(), AsmError> {
        // [rip + disp32]: reserved mod=00 r/m=101 pattern.
        if m.base == Reg::Rip {
            self.buf.emit8(reg_low << 3 | 0b101);
            self.buf.emit32(m.disp.unwrap_or(0) as u32);
            return Ok(());
        }

        let base_low = m.base.low_bits();
        match (m.index, m.disp) {
            (None, None) => {
                // Low bits 4/5 collide with the SIB-escape and
                // rip-relative patterns.
                if base_low == 4 || base_low == 5 {
                    return Err(AsmError::InvalidOperands {
                        detail: "[base] needs an explicit displacement for this base register"
                            .into(),
                    });
                }
                self.buf.emit8(reg_low << 3 | base_low);
                Ok(())
            }
            (None, Some(disp)) => {
                let byte = fits_byte(i64::from(disp));
                let mode = if byte { 0x40 } else { 0x80 };
                self.buf.emit8(mode | reg_low << 3 | base_low);
                if base_low == 4 {
                    // SIB escape: scale 1, no index, base as given.
                    self.buf.emit8(0x20 | base_low);
                }
                if byte {
                    self.buf.emit8(disp as u8);
                } else {
                    self.buf.emit32(disp as u32);
                }
                Ok(())
            }
            (Some(index), disp) => {
                let disp = disp.unwrap_or(0);
                let byte = fits_byte(i64::from(disp));
                let mode = if byte { 0x40 } else { 0x80 };
                self.buf.emit8(mode | reg_low << 3 | 0b100);
                self.buf.emit8(index.low_bits() << 3 | base_low);
                if byte {
                    self.buf.emit8(disp as u8);
                } else {
                    self.buf.emit32(disp as u32);
                }
                Ok(())
            }
        }
    }

    // ─── Data movement ──────────────────────────────────────────────────────

    /// `mov` — native word width. Combinations: `regOrMem ← imm32`
    /// (sign-extended), `reg ← raw 4/8-byte pattern`, `regOrMem ← reg`,
    /// `reg ← regOrMem`.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`]/[`AsmError::ImmediateOverflow`] for
    /// shapes `mov` cannot encode.
    pub fn mov(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        let (dst, src) = (dst.into(), src.into());
        match (&dst, &src) {
            (Operand::Reg(_) | Operand::Mem(_), Operand::Imm(v)) => {
                if !fits_long(*v) {
                    return Err(AsmError::ImmediateOverflow {
                        value: *v,
                        width: 4,
                    });
                }
                self.rexw(None, Some(&dst))?;
                self.buf.emit8(0xc7);
                self.modrm(0, &dst)?;
                self.buf.emit32(*v as u32);
                Ok(())
            }
            (Operand::Reg(r), Operand::Raw64(pattern)) => {
                self.require_x64("64-bit immediate mov")?;
                self.rexw(None, Some(&dst))?;
                self.buf.emit8(0xb8 | r.low_bits());
                self.buf.emit_bytes(pattern);
                Ok(())
            }
            (Operand::Reg(r), Operand::Raw32(pattern)) => {
                // The zero-extending 32-bit form; raw bit patterns must
                // not be sign-extended.
                self.rex_opt(false, None, Some(&dst))?;
                self.buf.emit8(0xb8 | r.low_bits());
                self.buf.emit_bytes(pattern);
                Ok(())
            }
            (Operand::Reg(_) | Operand::Mem(_), Operand::Reg(_)) => {
                self.rexw(Some(&src), Some(&dst))?;
                self.buf.emit8(0x89);
                let low = self.low_of(&src)?;
                self.modrm(low, &dst)
            }
            (Operand::Reg(_), Operand::Mem(_)) => {
                self.rexw(Some(&dst), Some(&src))?;
                self.buf.emit8(0x8b);
                let low = self.low_of(&dst)?;
                self.modrm(low, &src)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "unsupported mov combination".into(),
            }),
        }
    }

    /// `push` a register, memory cell or immediate.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`] for unencodable sources.
    pub fn push(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        let src = src.into();
        match &src {
            Operand::Reg(r) => {
                self.check_reg(*r)?;
                if r.is_extended() {
                    self.buf.emit8(0x41);
                }
                self.buf.emit8(0x50 | r.low_bits());
                Ok(())
            }
            Operand::Mem(_) => {
                self.rex_opt(false, None, Some(&src))?;
                self.buf.emit8(0xff);
                self.modrm(6, &src)
            }
            Operand::Imm(v) => {
                if fits_byte(*v) {
                    self.buf.emit8(0x6a);
                    self.buf.emit8(*v as u8);
                } else if fits_long(*v) {
                    self.buf.emit8(0x68);
                    self.buf.emit32(*v as u32);
                } else {
                    return Err(AsmError::ImmediateOverflow {
                        value: *v,
                        width: 4,
                    });
                }
                Ok(())
            }
            Operand::Raw32(pattern) => {
                self.buf.emit8(0x68);
                self.buf.emit_bytes(pattern);
                Ok(())
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "unsupported push source".into(),
            }),
        }
    }

    /// `pop` into a register or memory cell.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`] for unencodable destinations.
    pub fn pop(&mut self, dst: impl Into<Operand>) -> Result<(), AsmError> {
        let dst = dst.into();
        match &dst {
            Operand::Reg(r) => {
                self.check_reg(*r)?;
                if r.is_extended() {
                    self.buf.emit8(0x41);
                }
                self.buf.emit8(0x58 | r.low_bits());
                Ok(())
            }
            Operand::Mem(_) => {
                self.rex_opt(false, None, Some(&dst))?;
                self.buf.emit8(0x8f);
                self.modrm(0, &dst)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "pop destination must be a register or memory".into(),
            }),
        }
    }

    /// `xchg` two locations (at least one a register). The accumulator
    /// short form is used when possible.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`] for memory-to-memory shapes.
    pub fn xchg(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        let (dst, src) = (dst.into(), src.into());
        let acc = Operand::Reg(self.accumulator());

        // Canonical order: accumulator (or the register) first.
        if (src == acc && dst != acc) || (dst.is_mem() && !src.is_mem()) {
            return self.xchg(src, dst);
        }

        match (&dst, &src) {
            (Operand::Reg(_), Operand::Reg(r)) if dst == acc => {
                self.rexw(Some(&dst), Some(&src))?;
                self.buf.emit8(0x90 | r.low_bits());
                Ok(())
            }
            (Operand::Reg(_), Operand::Reg(_) | Operand::Mem(_)) => {
                self.rexw(Some(&dst), Some(&src))?;
                self.buf.emit8(0x87);
                let low = self.low_of(&dst)?;
                self.modrm(low, &src)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "xchg needs at least one register operand".into(),
            }),
        }
    }

    /// `lea` — load effective address of a memory reference.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`] unless `src` is a memory reference.
    pub fn lea(&mut self, dst: Reg, src: Mem) -> Result<(), AsmError> {
        let (dst, src) = (Operand::Reg(dst), Operand::Mem(src));
        self.rexw(Some(&dst), Some(&src))?;
        self.buf.emit8(0x8d);
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)
    }

    /// `ret`, optionally discarding `bytes` of stack arguments.
    pub fn ret(&mut self, bytes: u16) {
        if bytes == 0 {
            self.buf.emit8(0xc3);
        } else {
            self.buf.emit8(0xc2);
            self.buf.emit16(bytes);
        }
    }

    // ─── Integer families ───────────────────────────────────────────────────

    fn bin_op(
        &mut self,
        op: &BinOp,
        dst: Operand,
        src: Operand,
    ) -> Result<(), AsmError> {
        match (&dst, &src) {
            (Operand::Reg(_) | Operand::Mem(_), Operand::Imm(v)) => {
                if fits_byte(*v) && op.imm8.is_some() {
                    self.rexw(None, Some(&dst))?;
                    self.buf.emit8(op.imm8.expect("checked above"));
                    self.modrm(op.digit, &dst)?;
                    self.buf.emit8(*v as u8);
                } else if !fits_long(*v) {
                    return Err(AsmError::ImmediateOverflow {
                        value: *v,
                        width: 4,
                    });
                } else if dst == Operand::Reg(self.accumulator()) {
                    self.rexw(None, Some(&dst))?;
                    self.buf.emit8(op.rax_imm);
                    self.buf.emit32(*v as u32);
                } else {
                    self.rexw(None, Some(&dst))?;
                    self.buf.emit8(op.imm);
                    self.modrm(op.digit, &dst)?;
                    self.buf.emit32(*v as u32);
                }
                Ok(())
            }
            (Operand::Reg(_) | Operand::Mem(_), Operand::Reg(_)) => {
                self.rexw(Some(&src), Some(&dst))?;
                self.buf.emit8(op.mr);
                let low = self.low_of(&src)?;
                self.modrm(low, &dst)
            }
            (Operand::Reg(_), Operand::Mem(_)) => {
                let rm = op.rm.ok_or_else(|| AsmError::InvalidOperands {
                    detail: "operation has no reg ← mem form".into(),
                })?;
                self.rexw(Some(&dst), Some(&src))?;
                self.buf.emit8(rm);
                let low = self.low_of(&dst)?;
                self.modrm(low, &src)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "unsupported operand combination".into(),
            }),
        }
    }

    /// `add dst, src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`] for the error contract shared by the family.
    pub fn add(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&ADD, dst.into(), src.into())
    }

    /// `sub dst, src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn sub(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&SUB, dst.into(), src.into())
    }

    /// `and dst, src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn and(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&AND, dst.into(), src.into())
    }

    /// `or dst, src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn or(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&OR, dst.into(), src.into())
    }

    /// `xor dst, src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn xor(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&XOR, dst.into(), src.into())
    }

    /// `cmp dst, src` — compare and set flags.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cmp(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&CMP, dst.into(), src.into())
    }

    /// `test dst, src` — bitwise-and into flags only.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn test(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.bin_op(&TEST, dst.into(), src.into())
    }

    fn un_op(&mut self, opcode: u8, digit: u8, src: Operand) -> Result<(), AsmError> {
        self.rexw(None, Some(&src))?;
        self.buf.emit8(opcode);
        self.modrm(digit, &src)
    }

    /// `inc` a register or memory cell.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn inc(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xff, 0, src.into())
    }

    /// `dec` a register or memory cell.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn dec(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xff, 1, src.into())
    }

    /// Unsigned multiply of the accumulator by `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn mul(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xf7, 4, src.into())
    }

    /// Signed multiply of the accumulator by `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn imul(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xf7, 5, src.into())
    }

    /// Unsigned divide of the accumulator pair by `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn div(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xf7, 6, src.into())
    }

    /// Signed divide of the accumulator pair by `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn idiv(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xf7, 7, src.into())
    }

    /// Two's-complement negate.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn neg(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xf7, 3, src.into())
    }

    /// Bitwise complement.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn not(&mut self, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.un_op(0xf7, 2, src.into())
    }

    fn shift_op(&mut self, digit: u8, dst: Reg, src: Operand) -> Result<(), AsmError> {
        let dst = Operand::Reg(dst);
        match src {
            Operand::Imm(v) => {
                self.rexw(None, Some(&dst))?;
                self.buf.emit8(0xc1);
                self.modrm(digit, &dst)?;
                self.buf.emit8(v as u8);
                Ok(())
            }
            Operand::Reg(Reg::Rcx | Reg::Ecx) => {
                self.rexw(None, Some(&dst))?;
                self.buf.emit8(0xd3);
                self.modrm(digit, &dst)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "shift count must be an immediate or the count register".into(),
            }),
        }
    }

    /// `shl dst, count`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn shl(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.shift_op(4, dst, src.into())
    }

    /// `shr dst, count` (logical).
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn shr(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.shift_op(5, dst, src.into())
    }

    /// `sar dst, count` (arithmetic).
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn sar(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.shift_op(7, dst, src.into())
    }

    fn bit_count_op(&mut self, opcode: u8, dst: Reg, src: Operand) -> Result<(), AsmError> {
        self.require_x64("bit-count operation")?;
        let dst = Operand::Reg(dst);
        self.buf.emit8(0xf3);
        self.rexw(Some(&dst), Some(&src))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(opcode);
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)
    }

    /// Count set bits in `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn popcnt(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.bit_count_op(0xb8, dst, src.into())
    }

    /// Count leading zero bits in `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn lzcnt(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.bit_count_op(0xbd, dst, src.into())
    }

    /// Count trailing zero bits in `src`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn tzcnt(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.bit_count_op(0xbc, dst, src.into())
    }

    // ─── Control transfer ───────────────────────────────────────────────────

    /// Short conditional jump (1-byte displacement) to a label.
    ///
    /// # Errors
    ///
    /// [`AsmError::DisplacementOverflow`] at bind time if the target is
    /// out of the ±127-byte range.
    pub fn j<'a>(
        &mut self,
        cond: Cond,
        target: impl Into<LabelRef<'a>>,
    ) -> Result<(), AsmError> {
        let label = self.lookup(target);
        self.buf.emit8(0x70 + cond.code());
        self.buf.emit8(0xaa);
        self.use_label(label, 1, UseKind::Relative(-1))
    }

    /// Short unconditional jump to a label.
    ///
    /// # Errors
    ///
    /// See [`Masm::j`].
    pub fn jmp<'a>(&mut self, target: impl Into<LabelRef<'a>>) -> Result<(), AsmError> {
        let label = self.lookup(target);
        self.buf.emit8(0xeb);
        self.buf.emit8(0xaa);
        self.use_label(label, 1, UseKind::Relative(-1))
    }

    /// Long conditional jump (4-byte displacement) to a label.
    ///
    /// # Errors
    ///
    /// See [`Masm::j`].
    pub fn jl<'a>(
        &mut self,
        cond: Cond,
        target: impl Into<LabelRef<'a>>,
    ) -> Result<(), AsmError> {
        let label = self.lookup(target);
        self.buf.emit8(0x0f);
        self.buf.emit8(0x80 + cond.code());
        self.buf.emit32(0xdead_beef);
        self.use_label(label, 4, UseKind::Relative(-4))
    }

    /// Long unconditional jump to a label.
    ///
    /// # Errors
    ///
    /// See [`Masm::j`].
    pub fn jmpl<'a>(&mut self, target: impl Into<LabelRef<'a>>) -> Result<(), AsmError> {
        let label = self.lookup(target);
        self.buf.emit8(0xe9);
        self.buf.emit32(0xdead_beef);
        self.use_label(label, 4, UseKind::Relative(-4))
    }

    /// Set the low byte of `dst` to 1 if `cond` holds, else 0.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] on ia32.
    pub fn set(&mut self, cond: Cond, dst: Reg) -> Result<(), AsmError> {
        self.require_x64("set")?;
        self.check_reg(dst)?;
        // Byte access to sil/dil-class registers needs an empty REX.
        if dst.is_extended() || dst.low_bits() >= 4 {
            self.buf.emit8(0x40 | u8::from(dst.is_extended()));
        }
        self.buf.emit8(0x0f);
        self.buf.emit8(0x90 + cond.code());
        self.modrm(0, &Operand::Reg(dst))
    }

    /// Conditionally move `src` into `dst` when `cond` holds.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] on ia32.
    pub fn cmov(
        &mut self,
        cond: Cond,
        dst: Reg,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.require_x64("cmov")?;
        let (dst, src) = (Operand::Reg(dst), src.into());
        self.rexw(Some(&dst), Some(&src))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(0x40 + cond.code());
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)
    }

    /// Indirect `call` through a register or memory cell.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`] for immediate targets.
    pub fn call(&mut self, target: impl Into<Operand>) -> Result<(), AsmError> {
        let target = target.into();
        if target.is_imm() {
            return Err(AsmError::InvalidOperands {
                detail: "call target must be a register or memory".into(),
            });
        }
        self.rex_opt(false, None, Some(&target))?;
        self.buf.emit8(0xff);
        self.modrm(2, &target)
    }

    /// Load `dst` with the (deferred, absolute) address of a label, then
    /// `call` through it. The 8-byte placeholder becomes a relocation
    /// resolved after the code image is placed.
    ///
    /// # Errors
    ///
    /// [`AsmError::NotSupported`] on ia32.
    pub fn call_label<'a>(
        &mut self,
        dst: Reg,
        target: impl Into<LabelRef<'a>>,
    ) -> Result<(), AsmError> {
        self.require_x64("call via label")?;
        let label = self.lookup(target);
        self.mov(dst, Operand::Raw64(PLACEHOLDER64))?;
        self.use_label(label, 8, UseKind::Absolute(0))?;
        self.call(dst)
    }

    // ─── System ─────────────────────────────────────────────────────────────

    /// `nop`.
    pub fn nop(&mut self) {
        self.buf.emit8(0x90);
    }

    /// `int3` debug trap.
    pub fn int3(&mut self) {
        self.buf.emit8(0xcc);
    }

    /// `cpuid`.
    pub fn cpuid(&mut self) {
        self.buf.emit8(0x0f);
        self.buf.emit8(0xa2);
    }

    /// `rdtsc`.
    pub fn rdtsc(&mut self) {
        self.buf.emit8(0x0f);
        self.buf.emit8(0x31);
    }

    /// `mfence`.
    pub fn mfence(&mut self) {
        self.buf.emit8(0x0f);
        self.buf.emit8(0xae);
        self.buf.emit8(0xf0);
    }

    /// `lfence`.
    pub fn lfence(&mut self) {
        self.buf.emit8(0x0f);
        self.buf.emit8(0xae);
        self.buf.emit8(0xe8);
    }

    /// `clflush` a cache line.
    ///
    /// # Errors
    ///
    /// [`AsmError::InvalidOperands`] — only memory operands are flushable.
    pub fn clflush(&mut self, dst: Mem) -> Result<(), AsmError> {
        let dst = Operand::Mem(dst);
        self.buf.emit8(0x0f);
        self.buf.emit8(0xae);
        self.modrm(7, &dst)
    }

    // ─── Scalar floating point ──────────────────────────────────────────────

    /// Shared shape for the FP arithmetic family: mandatory prefix,
    /// optional REX, `0x0F` escape, one opcode byte, ModRM.
    fn fp_op(
        &mut self,
        prefix: u8,
        opcode: u8,
        dst: Operand,
        src: Operand,
    ) -> Result<(), AsmError> {
        self.require_x64("floating point")?;
        self.buf.emit8(prefix);
        self.rex_opt(false, Some(&dst), Some(&src))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(opcode);
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)
    }

    fn movs(&mut self, wide: bool, dst: Operand, src: Operand) -> Result<(), AsmError> {
        self.require_x64("movsd/movss")?;
        let prefix = if wide { 0xf2 } else { 0xf3 };
        match (&dst, &src) {
            (Operand::Mem(_), Operand::Xmm(_)) => {
                self.buf.emit8(prefix);
                self.rex_opt(false, Some(&src), Some(&dst))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0x11);
                let low = self.low_of(&src)?;
                self.modrm(low, &dst)
            }
            (Operand::Xmm(_), Operand::Mem(_)) => {
                self.buf.emit8(prefix);
                self.rex_opt(false, Some(&dst), Some(&src))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0x10);
                let low = self.low_of(&dst)?;
                self.modrm(low, &src)
            }
            (Operand::Xmm(_), Operand::Xmm(_)) => {
                self.buf.emit8(prefix);
                self.rex_opt(false, Some(&src), Some(&dst))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0x11);
                let low = self.low_of(&src)?;
                self.modrm(low, &dst)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "movsd/movss moves between xmm registers and memory".into(),
            }),
        }
    }

    /// `movsd` — move a scalar double between xmm locations.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn movsd(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.movs(true, dst.into(), src.into())
    }

    /// `movss` — move a scalar single between xmm locations.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn movss(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.movs(false, dst.into(), src.into())
    }

    /// Raw 64/32-bit bit-pattern transfer between general and floating
    /// registers (not a numeric conversion).
    fn movq_width(&mut self, wide: bool, dst: Operand, src: Operand) -> Result<(), AsmError> {
        self.require_x64("movq/movd")?;
        match (&dst, &src) {
            (Operand::Xmm(_), Operand::Reg(_)) => {
                self.buf.emit8(0x66);
                self.rex_opt(wide, Some(&dst), Some(&src))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0x6e);
                let low = self.low_of(&dst)?;
                self.modrm(low, &src)
            }
            (Operand::Reg(_), Operand::Xmm(_)) => {
                self.buf.emit8(0x66);
                self.rex_opt(wide, Some(&src), Some(&dst))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0x7e);
                let low = self.low_of(&src)?;
                self.modrm(low, &dst)
            }
            (Operand::Mem(_), Operand::Xmm(_)) => {
                self.buf.emit8(0x66);
                self.rex_opt(false, Some(&src), Some(&dst))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0xd6);
                let low = self.low_of(&src)?;
                self.modrm(low, &dst)
            }
            (Operand::Xmm(_), Operand::Xmm(_) | Operand::Mem(_)) => {
                self.buf.emit8(0xf3);
                self.rex_opt(false, Some(&dst), Some(&src))?;
                self.buf.emit8(0x0f);
                self.buf.emit8(0x7e);
                let low = self.low_of(&dst)?;
                self.modrm(low, &src)
            }
            _ => Err(AsmError::InvalidOperands {
                detail: "movq/movd transfers between xmm and general registers or memory".into(),
            }),
        }
    }

    /// `movq` — 64-bit raw transfer.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn movq(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.movq_width(true, dst.into(), src.into())
    }

    /// `movd` — 32-bit raw transfer.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn movd(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.movq_width(false, dst.into(), src.into())
    }

    /// `addsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn addsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x58, Operand::Xmm(dst), src.into())
    }

    /// `mulsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn mulsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x59, Operand::Xmm(dst), src.into())
    }

    /// `subsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn subsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x5c, Operand::Xmm(dst), src.into())
    }

    /// `divsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn divsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x5e, Operand::Xmm(dst), src.into())
    }

    /// `addss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn addss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x58, Operand::Xmm(dst), src.into())
    }

    /// `mulss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn mulss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x59, Operand::Xmm(dst), src.into())
    }

    /// `subss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn subss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x5c, Operand::Xmm(dst), src.into())
    }

    /// `divss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn divss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x5e, Operand::Xmm(dst), src.into())
    }

    /// `pcmpeqd` — packed doubleword compare-for-equality.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn pcmpeqd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0x66, 0x76, Operand::Xmm(dst), src.into())
    }

    /// `xorpd` — bitwise xor of packed doubles.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn xorpd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0x66, 0x57, Operand::Xmm(dst), src.into())
    }

    /// `andpd` — bitwise and of packed doubles.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn andpd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0x66, 0x54, Operand::Xmm(dst), src.into())
    }

    fn cvt(
        &mut self,
        prefix: u8,
        opcode: u8,
        wide: bool,
        dst: Operand,
        src: Operand,
    ) -> Result<(), AsmError> {
        self.require_x64("conversion")?;
        self.buf.emit8(prefix);
        self.rex_opt(wide, Some(&dst), Some(&src))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(opcode);
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)
    }

    /// `cvtsd2si` — double to 64-bit integer, rounded per MXCSR.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvtsd2si(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf2, 0x2d, true, Operand::Reg(dst), src.into())
    }

    /// `cvtss2si` — single to 64-bit integer, rounded per MXCSR.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvtss2si(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf3, 0x2d, true, Operand::Reg(dst), src.into())
    }

    /// `cvtsd2si` with a 32-bit integer destination.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvtsd2sil(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf2, 0x2d, false, Operand::Reg(dst), src.into())
    }

    /// `cvttsd2si` — double to 64-bit integer, truncating toward zero.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvttsd2si(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf2, 0x2c, true, Operand::Reg(dst), src.into())
    }

    /// `cvttss2si` — single to 64-bit integer, truncating toward zero.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvttss2si(&mut self, dst: Reg, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf3, 0x2c, true, Operand::Reg(dst), src.into())
    }

    /// `cvtsi2sd` — 64-bit integer to double.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf2, 0x2a, true, Operand::Xmm(dst), src.into())
    }

    /// `cvtsi2ss` — 64-bit integer to single.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvtsi2ss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf3, 0x2a, true, Operand::Xmm(dst), src.into())
    }

    /// `cvtsi2sd` with a 32-bit integer source.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn cvtsi2sdl(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.cvt(0xf2, 0x2a, false, Operand::Xmm(dst), src.into())
    }

    fn round(
        &mut self,
        wide: bool,
        mode: RoundMode,
        dst: Xmm,
        src: Operand,
    ) -> Result<(), AsmError> {
        self.require_x64("roundsd/roundss")?;
        let dst = Operand::Xmm(dst);
        self.buf.emit8(0x66);
        self.rex_opt(false, Some(&dst), Some(&src))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(0x3a);
        self.buf.emit8(if wide { 0x0b } else { 0x0a });
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)?;
        self.buf.emit8(mode.imm());
        Ok(())
    }

    /// `roundsd` — round a scalar double with an explicit mode.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn roundsd(
        &mut self,
        mode: RoundMode,
        dst: Xmm,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.round(true, mode, dst, src.into())
    }

    /// `roundss` — round a scalar single with an explicit mode.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn roundss(
        &mut self,
        mode: RoundMode,
        dst: Xmm,
        src: impl Into<Operand>,
    ) -> Result<(), AsmError> {
        self.round(false, mode, dst, src.into())
    }

    /// `sqrtsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn sqrtsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x51, Operand::Xmm(dst), src.into())
    }

    /// `sqrtss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn sqrtss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x51, Operand::Xmm(dst), src.into())
    }

    /// `maxsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn maxsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x5f, Operand::Xmm(dst), src.into())
    }

    /// `maxss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn maxss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x5f, Operand::Xmm(dst), src.into())
    }

    /// `minsd`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn minsd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf2, 0x5d, Operand::Xmm(dst), src.into())
    }

    /// `minss`.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn minss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0xf3, 0x5d, Operand::Xmm(dst), src.into())
    }

    /// `ucomisd` — unordered scalar-double compare into flags.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn ucomisd(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.fp_op(0x66, 0x2e, Operand::Xmm(dst), src.into())
    }

    /// `ucomiss` — unordered scalar-single compare into flags.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn ucomiss(&mut self, dst: Xmm, src: impl Into<Operand>) -> Result<(), AsmError> {
        self.require_x64("floating point")?;
        let (dst, src) = (Operand::Xmm(dst), src.into());
        self.rex_opt(false, Some(&dst), Some(&src))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(0x2e);
        let low = self.low_of(&dst)?;
        self.modrm(low, &src)
    }

    fn pshift(&mut self, digit: u8, dst: Xmm, shift: u8) -> Result<(), AsmError> {
        self.require_x64("packed shift")?;
        let dst = Operand::Xmm(dst);
        self.buf.emit8(0x66);
        self.rex_opt(false, None, Some(&dst))?;
        self.buf.emit8(0x0f);
        self.buf.emit8(0x73);
        self.modrm(digit, &dst)?;
        self.buf.emit8(shift);
        Ok(())
    }

    /// `psrlq` — shift packed quadwords right by an immediate.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn psrlq(&mut self, dst: Xmm, shift: u8) -> Result<(), AsmError> {
        self.pshift(2, dst, shift)
    }

    /// `psllq` — shift packed quadwords left by an immediate.
    ///
    /// # Errors
    ///
    /// See [`Masm::mov`].
    pub fn psllq(&mut self, dst: Xmm, shift: u8) -> Result<(), AsmError> {
        self.pshift(6, dst, shift)
    }

    // ─── x64 macro-layer bodies ─────────────────────────────────────────────

    #[cfg(feature = "x64")]
    pub(crate) fn emit_entry_x64(&mut self) -> Result<(), AsmError> {
        self.push(Reg::Rbp)?;
        self.mov(Reg::Rbp, Reg::Rsp)
    }

    #[cfg(feature = "x64")]
    pub(crate) fn emit_exit_x64(&mut self) -> Result<(), AsmError> {
        self.restore_spills()?;
        self.mov(Reg::Rsp, Reg::Rbp)?;
        self.pop(Reg::Rbp)?;

        // Unroll stack-passed arguments, keeping 16-byte alignment.
        let mut argc = self.proc_argc;
        if argc % 2 == 1 {
            argc += 1;
        }
        self.ret((argc * 8) as u16);

        self.mark_spill_restore();
        Ok(())
    }

    #[cfg(feature = "x64")]
    pub(crate) fn emit_proc_x64<F>(
        &mut self,
        name: Option<&str>,
        body: F,
    ) -> Result<usize, AsmError>
    where
        F: FnOnce(&mut Self) -> Result<(), AsmError>,
    {
        // Align with traps, not nops: falling through into padding traps.
        while self.buf.offset() % 16 != 0 {
            self.int3();
        }
        if let Some(name) = name {
            self.bind(name)?;
        }
        let offset = self.buf.offset();

        let reserve = self.reloc();
        self.push(Reg::Rbp)?;
        self.mov(Reg::Rbp, Reg::Rsp)?;
        self.sub(Reg::Rsp, ZAP)?;
        self.use_label(reserve, 4, UseKind::Direct)?;

        body(self)?;

        let mut spill_bytes = i64::from(self.spill_bytes());
        if spill_bytes % 16 != 0 {
            spill_bytes += 16 - spill_bytes % 16;
        }
        self.resolve_label(reserve, spill_bytes)?;
        Ok(offset)
    }

    #[cfg(feature = "x64")]
    pub(crate) fn emit_stub_x64(
        &mut self,
        stubs: &Stubs,
        dst: Reg,
        name: &str,
        args: &[Operand],
    ) -> Result<(), AsmError> {
        // Keep the stack 16-byte aligned across the call.
        if args.len() % 2 != 0 {
            self.push(ZAP)?;
        }
        for arg in args.iter().rev() {
            self.push(*arg)?;
        }

        self.mov(dst, Operand::Raw64(PLACEHOLDER64))?;
        let at = self.buf.offset() - 8;
        self.call(dst)?;

        match stubs.address(name) {
            Some(addr) => self.buf.write_at(8, addr as i64, at),
            None => {
                stubs.mark_pending(name);
                self.queue_stub_use(name, at);
                Ok(())
            }
        }
    }

    #[cfg(feature = "x64")]
    pub(crate) fn emit_runtime_x64(
        &mut self,
        binding: &Rc<RuntimeBinding>,
        args: &[Operand],
    ) -> Result<(), AsmError> {
        // Slots: call address, argument struct, argc, then the arguments,
        // padded to an even push count.
        let mut slots = 3 + args.len();
        if slots % 2 == 1 {
            self.push(ZAP)?;
            slots += 1;
        }
        for arg in args.iter().rev() {
            self.push(*arg)?;
        }
        self.push(args.len() as i32)?;

        self.mov(Reg::Rax, Operand::Raw64(binding.call_argument.to_le_bytes()))?;
        self.push(Reg::Rax)?;
        self.mov(Reg::Rax, Operand::Raw64(binding.call_address.to_le_bytes()))?;
        self.push(Reg::Rax)?;

        self.stub(Reg::Rax, RUNTIME_STUB, &[])?;
        self.add(Reg::Rsp, (slots * 8) as i32)
    }
}

/// Body of the built-in `__runtime__` trampoline stub: save every scratch
/// register, dispatch on the passed argument count to load the native
/// argument registers, call the host function pointer, restore and return.
#[cfg(feature = "x64")]
pub(crate) fn call_runtime_body(m: &mut Masm) -> Result<(), AsmError> {
    use Reg::{Rax, Rcx, Rdi, Rdx, Rsi, R10, R11, R8, R9};

    for reg in [Rdi, Rsi, Rcx, Rdx, R8, R9, R10, R11] {
        m.push(reg)?;
    }

    m.xor(Rsi, Rsi)?;
    m.xor(Rdx, Rdx)?;
    m.xor(Rcx, Rcx)?;
    m.xor(R8, R8)?;

    m.label_scope(|m| {
        let argc_cell = m.arg(2)?;
        m.mov(Rax, argc_cell)?;
        m.cmp(Rax, 0)?;
        m.j(Cond::E, "no args")?;
        m.cmp(Rax, 1)?;
        m.j(Cond::E, "1 arg")?;
        m.cmp(Rax, 2)?;
        m.j(Cond::E, "2 args")?;
        m.cmp(Rax, 3)?;
        m.j(Cond::E, "3 args")?;
        m.cmp(Rax, 4)?;
        m.j(Cond::E, "4 args")?;
        // More than four arguments is unreachable by construction.
        m.int3();

        m.bind("4 args")?;
        let cell = m.arg(6)?;
        m.mov(R8, cell)?;
        m.bind("3 args")?;
        let cell = m.arg(5)?;
        m.mov(Rcx, cell)?;
        m.bind("2 args")?;
        let cell = m.arg(4)?;
        m.mov(Rdx, cell)?;
        m.bind("1 arg")?;
        let cell = m.arg(3)?;
        m.mov(Rsi, cell)?;
        m.bind("no args")?;
        Ok(())
    })?;

    // fn(struct, arg0, arg1, arg2, arg3)
    let struct_cell = m.arg(1)?;
    m.mov(Rdi, struct_cell)?;
    let fn_cell = m.arg(0)?;
    m.mov(Rax, fn_cell)?;
    m.call(Rax)?;

    for reg in [R11, R10, R9, R8, Rdx, Rcx, Rsi, Rdi] {
        m.pop(reg)?;
    }
    m.exit()
}
