//! Typed operands: architectures, registers, memory references, conditions.

use core::fmt;

use crate::error::AsmError;

// ─── Architecture ───────────────────────────────────────────────────────────

/// Target architecture of an assembler context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Arch {
    /// x86-64 (primary backend).
    X64,
    /// 32-bit x86 (secondary, partially ported).
    Ia32,
}

impl Arch {
    /// Look up an architecture by name (`"x64"`, `"ia32"`).
    ///
    /// # Errors
    ///
    /// [`AsmError::UnknownArch`] for unknown names.
    pub fn from_name(name: &str) -> Result<Self, AsmError> {
        match name {
            "x64" | "x86_64" | "x86-64" => Ok(Arch::X64),
            "ia32" | "x86" => Ok(Arch::Ia32),
            _ => Err(AsmError::UnknownArch { name: name.into() }),
        }
    }

    /// Native word width in bits.
    #[must_use]
    pub fn word_bits(self) -> u16 {
        match self {
            Arch::X64 => 64,
            Arch::Ia32 => 32,
        }
    }

    /// Native word width in bytes.
    #[must_use]
    pub fn word_bytes(self) -> i32 {
        i32::from(self.word_bits() / 8)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X64 => write!(f, "x64"),
            Arch::Ia32 => write!(f, "ia32"),
        }
    }
}

// ─── General-purpose registers ──────────────────────────────────────────────

/// General-purpose register, both widths in one namespace.
///
/// The 64-bit names (`Rax`–`R15`) belong to [`Arch::X64`], the 32-bit names
/// (`Eax`–`Edi`) to [`Arch::Ia32`]; using a register on the wrong
/// architecture is an encoding error. `Rip` is valid only as a memory base
/// for instruction-pointer-relative addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Reg {
    /// 64-bit accumulator.
    Rax,
    /// 64-bit counter.
    Rcx,
    /// 64-bit data register.
    Rdx,
    /// 64-bit base register.
    Rbx,
    /// 64-bit stack pointer.
    Rsp,
    /// 64-bit frame pointer.
    Rbp,
    /// 64-bit source index.
    Rsi,
    /// 64-bit destination index.
    Rdi,
    /// Extended register (requires an extension prefix bit).
    R8,
    /// Extended register.
    R9,
    /// Extended register.
    R10,
    /// Extended register.
    R11,
    /// Extended register.
    R12,
    /// Extended register.
    R13,
    /// Extended register.
    R14,
    /// Extended register.
    R15,
    /// Instruction pointer, memory base only.
    Rip,
    /// 32-bit accumulator.
    Eax,
    /// 32-bit counter.
    Ecx,
    /// 32-bit data register.
    Edx,
    /// 32-bit base register.
    Ebx,
    /// 32-bit stack pointer.
    Esp,
    /// 32-bit frame pointer.
    Ebp,
    /// 32-bit source index.
    Esi,
    /// 32-bit destination index.
    Edi,
}

impl Reg {
    /// 4-bit register index (0–15).
    #[must_use]
    pub fn index(self) -> u8 {
        match self {
            Reg::Rax | Reg::Eax => 0,
            Reg::Rcx | Reg::Ecx => 1,
            Reg::Rdx | Reg::Edx => 2,
            Reg::Rbx | Reg::Ebx => 3,
            Reg::Rsp | Reg::Esp => 4,
            Reg::Rbp | Reg::Ebp => 5,
            Reg::Rsi | Reg::Esi => 6,
            Reg::Rdi | Reg::Edi => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
            // RIP has no index; its addressing form is selected by a
            // reserved ModRM pattern, not a register code.
            Reg::Rip => 5,
        }
    }

    /// Low three bits of the register index (the ModRM/SIB field value).
    #[must_use]
    pub fn low_bits(self) -> u8 {
        self.index() & 0x7
    }

    /// Whether the register needs an extension prefix bit (index ≥ 8).
    #[must_use]
    pub fn is_extended(self) -> bool {
        self.index() >= 8 && self != Reg::Rip
    }

    /// Register width in bits.
    #[must_use]
    pub fn size_bits(self) -> u16 {
        match self {
            Reg::Eax
            | Reg::Ecx
            | Reg::Edx
            | Reg::Ebx
            | Reg::Esp
            | Reg::Ebp
            | Reg::Esi
            | Reg::Edi => 32,
            _ => 64,
        }
    }

    /// Lower-case register name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::Rip => "rip",
            Reg::Eax => "eax",
            Reg::Ecx => "ecx",
            Reg::Edx => "edx",
            Reg::Ebx => "ebx",
            Reg::Esp => "esp",
            Reg::Ebp => "ebp",
            Reg::Esi => "esi",
            Reg::Edi => "edi",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Floating-point registers ───────────────────────────────────────────────

/// XMM register (floating-point namespace, disjoint from [`Reg`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl Xmm {
    /// 4-bit register index (0–15).
    #[must_use]
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Low three bits of the register index.
    #[must_use]
    pub fn low_bits(self) -> u8 {
        self.index() & 0x7
    }

    /// Whether the register needs an extension prefix bit (index ≥ 8).
    #[must_use]
    pub fn is_extended(self) -> bool {
        self.index() >= 8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.index())
    }
}

// ─── Memory references ──────────────────────────────────────────────────────

/// Memory reference: `[base]`, `[base + disp]` or `[base + index + disp]`.
///
/// The index scale is always 1. `[base]` without displacement is rejected
/// at encode time for bases whose low register bits collide with the
/// reserved ModRM patterns (`rsp`/`r12` need a SIB escape, `rbp`/`r13`
/// would select RIP-relative addressing); use an explicit zero
/// displacement for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mem {
    /// Base register ([`Reg::Rip`] selects RIP-relative form).
    pub base: Reg,
    /// Optional index register, scale 1.
    pub index: Option<Reg>,
    /// Optional displacement. `None` is the bare `[base]` form.
    pub disp: Option<i32>,
}

impl Mem {
    /// `[base]`.
    #[must_use]
    pub fn base(base: Reg) -> Self {
        Self {
            base,
            index: None,
            disp: None,
        }
    }

    /// `[base + disp]`.
    #[must_use]
    pub fn disp(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp: Some(disp),
        }
    }

    /// `[base + index + disp]` (scale 1).
    #[must_use]
    pub fn index(base: Reg, index: Reg, disp: i32) -> Self {
        Self {
            base,
            index: Some(index),
            disp: Some(disp),
        }
    }

    /// `[rip + disp]` — instruction-pointer-relative form.
    #[must_use]
    pub fn rip(disp: i32) -> Self {
        Self {
            base: Reg::Rip,
            index: None,
            disp: Some(disp),
        }
    }
}

// ─── Operands ───────────────────────────────────────────────────────────────

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// General-purpose register.
    Reg(Reg),
    /// Floating-point register.
    Xmm(Xmm),
    /// Integer immediate (encoders pick the most compact legal width).
    Imm(i64),
    /// Raw 4-byte pattern, emitted verbatim little-endian.
    Raw32([u8; 4]),
    /// Raw 8-byte pattern (e.g. an IEEE-754 double or an absolute address).
    Raw64([u8; 8]),
    /// Memory reference.
    Mem(Mem),
}

impl Operand {
    /// Whether this operand is a memory reference.
    #[must_use]
    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    /// Whether this operand is any kind of immediate.
    #[must_use]
    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_) | Operand::Raw32(_) | Operand::Raw64(_))
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl From<Xmm> for Operand {
    fn from(x: Xmm) -> Self {
        Operand::Xmm(x)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Self {
        Operand::Mem(m)
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Imm(i64::from(v))
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Operand::Imm(v)
    }
}

// ─── Condition codes ────────────────────────────────────────────────────────

/// Condition code for conditional jumps, `set` and `cmov`.
///
/// The 4-bit encoding feeds four opcode families: short jcc (`0x70 + cc`),
/// long jcc (`0x0F 0x80 + cc`), setcc (`0x0F 0x90 + cc`) and cmovcc
/// (`0x0F 0x40 + cc`). Alias spellings (`z`/`e`, `nae`/`b`, …) are accepted
/// by [`Cond::from_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Cond {
    /// Overflow.
    O,
    /// Not overflow.
    No,
    /// Below (carry).
    B,
    /// Above or equal (not carry).
    Ae,
    /// Equal (zero).
    E,
    /// Not equal (not zero).
    Ne,
    /// Below or equal.
    Be,
    /// Above.
    A,
    /// Sign.
    S,
    /// Not sign.
    Ns,
    /// Parity (parity even).
    P,
    /// Not parity (parity odd).
    Np,
    /// Less (signed).
    L,
    /// Greater or equal (signed).
    Ge,
    /// Less or equal (signed).
    Le,
    /// Greater (signed).
    G,
}

impl Cond {
    /// The 4-bit `tttn` condition encoding.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Cond::O => 0x0,
            Cond::No => 0x1,
            Cond::B => 0x2,
            Cond::Ae => 0x3,
            Cond::E => 0x4,
            Cond::Ne => 0x5,
            Cond::Be => 0x6,
            Cond::A => 0x7,
            Cond::S => 0x8,
            Cond::Ns => 0x9,
            Cond::P => 0xa,
            Cond::Np => 0xb,
            Cond::L => 0xc,
            Cond::Ge => 0xd,
            Cond::Le => 0xe,
            Cond::G => 0xf,
        }
    }

    /// Parse a condition name, accepting every alias spelling.
    ///
    /// # Errors
    ///
    /// [`AsmError::UnknownCondition`] if the name is not in the table.
    pub fn from_name(name: &str) -> Result<Self, AsmError> {
        Ok(match name {
            "o" => Cond::O,
            "no" => Cond::No,
            "b" | "c" | "nae" => Cond::B,
            "ae" | "nb" | "nc" => Cond::Ae,
            "e" | "z" => Cond::E,
            "ne" | "nz" => Cond::Ne,
            "be" | "na" => Cond::Be,
            "a" | "nbe" => Cond::A,
            "s" => Cond::S,
            "ns" => Cond::Ns,
            "p" | "pe" => Cond::P,
            "np" | "po" => Cond::Np,
            "l" | "nge" => Cond::L,
            "ge" | "nl" => Cond::Ge,
            "le" | "ng" => Cond::Le,
            "g" | "nle" => Cond::G,
            _ => {
                return Err(AsmError::UnknownCondition {
                    name: name.into(),
                })
            }
        })
    }
}

// ─── Rounding modes ─────────────────────────────────────────────────────────

/// Rounding mode immediate for `roundsd`/`roundss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RoundMode {
    /// Round to nearest (even).
    Nearest,
    /// Round toward negative infinity.
    Down,
    /// Round toward positive infinity.
    Up,
    /// Round toward zero (truncate).
    Zero,
}

impl RoundMode {
    /// The rounding-control immediate byte.
    #[must_use]
    pub fn imm(self) -> u8 {
        match self {
            RoundMode::Nearest => 0,
            RoundMode::Down => 1,
            RoundMode::Up => 2,
            RoundMode::Zero => 3,
        }
    }
}
