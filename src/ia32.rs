//! ia32 (32-bit x86) macro-layer pieces.
//!
//! The 32-bit variant shares the whole instruction encoder with x64 (REX
//! synthesis degrades to validation there) but only a small slice of the
//! macro layer is ported: manual frames and argument cells. Procedures,
//! spills, stubs and runtime calls raise
//! [`NotSupported`](crate::AsmError::NotSupported) until someone ports
//! them.

use crate::error::AsmError;
use crate::ir::Reg;
use crate::masm::Masm;

impl Masm {
    pub(crate) fn emit_entry_ia32(&mut self) -> Result<(), AsmError> {
        self.push(Reg::Ebp)?;
        self.mov(Reg::Ebp, Reg::Esp)
    }

    pub(crate) fn emit_exit_ia32(&mut self) -> Result<(), AsmError> {
        self.mov(Reg::Esp, Reg::Ebp)?;
        self.pop(Reg::Ebp)?;
        self.ret(0);
        Ok(())
    }
}
