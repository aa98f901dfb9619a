//! End-to-end pipeline tests: emit → compile → place → patch, verified at
//! the byte and relocation level against the byte-array placer (actual
//! execution lives behind the delegated executable-memory boundary).

use std::cell::RefCell;
use std::rc::Rc;

use jitasm_rs::{
    compile, generate, place, ptr, Arch, Cond, Masm, Operand, Options, Reg, RoundMode, Stubs,
    VecPlacer, Xmm,
};

fn stub_options() -> (Options, Rc<RefCell<VecPlacer>>) {
    let placer: Rc<RefCell<VecPlacer>> = Rc::new(RefCell::new(VecPlacer::new()));
    let stubs = Stubs::new(Arch::X64, placer.clone());
    (
        Options {
            stubs: Some(stubs),
            ..Options::default()
        },
        placer,
    )
}

/// Scenario: frame setup, load 42 into the accumulator, tear down, return.
#[test]
fn scenario_constant_function() {
    let code = generate(Options::default(), |m| {
        m.push(Reg::Rbp)?;
        m.mov(Reg::Rbp, Reg::Rsp)?;
        m.mov(Reg::Rax, 42)?;
        m.mov(Reg::Rsp, Reg::Rbp)?;
        m.pop(Reg::Rbp)?;
        m.ret(0);
        Ok(())
    })
    .unwrap();

    assert_eq!(
        code.code,
        [
            0x55, // push rbp
            0x48, 0x89, 0xe5, // mov rbp, rsp
            0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, // mov rax, 42
            0x48, 0x89, 0xec, // mov rsp, rbp
            0x5d, // pop rbp
            0xc3, // ret
        ]
    );
    assert!(code.relocations.is_empty());

    // Placement of a relocation-free image is a plain copy.
    let mut placer = VecPlacer::new();
    let base = place(&code, &mut placer).unwrap();
    assert_eq!(placer.image(base).unwrap(), &code.code[..]);
}

/// Scenario: 12 * 14 + 5 − 3, divided by 5 — the integer-math families
/// chained through the accumulator convention.
#[test]
fn scenario_integer_math() {
    let code = generate(Options::default(), |m| {
        m.entry()?;
        m.mov(Reg::R8, 12)?;
        m.mov(Reg::Rax, 14)?;
        m.imul(Reg::R8)?;

        m.mov(Reg::R8, Reg::Rax)?;
        m.mov(Reg::Rbx, 5)?;
        m.add(Reg::Rbx, Reg::R8)?;

        m.mov(Reg::R8, Reg::Rbx)?;
        m.sub(Reg::R8, 3)?;

        m.mov(Reg::Rax, Reg::R8)?;
        m.mov(Reg::R8, 5)?;
        m.xor(Reg::Rdx, Reg::Rdx)?;
        m.idiv(Reg::R8)?;
        m.exit()
    })
    .unwrap();

    let expect = [
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x49, 0xc7, 0xc0, 0x0c, 0x00, 0x00, 0x00, // mov r8, 12
        0x48, 0xc7, 0xc0, 0x0e, 0x00, 0x00, 0x00, // mov rax, 14
        0x49, 0xf7, 0xe8, // imul r8
        0x49, 0x89, 0xc0, // mov r8, rax
        0x48, 0xc7, 0xc3, 0x05, 0x00, 0x00, 0x00, // mov rbx, 5
        0x4c, 0x01, 0xc3, // add rbx, r8
        0x49, 0x89, 0xd8, // mov r8, rbx
        0x49, 0x83, 0xe8, 0x03, // sub r8, 3
        0x4c, 0x89, 0xc0, // mov rax, r8
        0x49, 0xc7, 0xc0, 0x05, 0x00, 0x00, 0x00, // mov r8, 5
        0x48, 0x31, 0xd2, // xor rdx, rdx
        0x49, 0xf7, 0xf8, // idiv r8
        0x48, 0x89, 0xec, // mov rsp, rbp
        0x5d, // pop rbp
        0xc3, // ret
    ];
    assert_eq!(code.code, expect);
}

/// Scenario: a counted loop — zero the accumulator, count ten down to
/// zero with a conditional backward jump.
#[test]
fn scenario_loop() {
    let code = generate(Options::default(), |m| {
        m.xor(Reg::Rax, Reg::Rax)?;
        m.mov(Reg::Rcx, 10)?;
        m.label_scope(|m| {
            m.bind("loop")?;
            m.inc(Reg::Rax)?;
            m.dec(Reg::Rcx)?;
            m.cmp(Reg::Rcx, 0)?;
            m.j(Cond::Ne, "loop")
        })?;
        m.ret(0);
        Ok(())
    })
    .unwrap();

    assert_eq!(
        code.code,
        [
            0x48, 0x31, 0xc0, // xor rax, rax
            0x48, 0xc7, 0xc1, 0x0a, 0x00, 0x00, 0x00, // mov rcx, 10
            0x48, 0xff, 0xc0, // loop: inc rax
            0x48, 0xff, 0xc9, // dec rcx
            0x48, 0x83, 0xf9, 0x00, // cmp rcx, 0
            0x75, 0xf4, // jne loop (rel8 = -12)
            0xc3, // ret
        ]
    );
}

/// Scenario: two stubs invoked from one body; call sites hold the placed
/// batch addresses, and placement patches nothing further in the main
/// image (stub patches happen pre-placement).
#[test]
fn scenario_two_stubs() {
    let (opts, placer) = stub_options();
    let stubs = opts.stubs.clone().unwrap();

    stubs
        .define("sum", 0, |m: &mut Masm| {
            m.add(Reg::Rax, Reg::Rbx)?;
            m.exit()
        })
        .unwrap();
    stubs
        .define("sub", 0, |m: &mut Masm| {
            m.sub(Reg::Rax, Reg::Rbx)?;
            m.exit()
        })
        .unwrap();

    let code = generate(opts, |m| {
        m.mov(Reg::Rax, 20)?;
        m.mov(Reg::Rbx, 32)?;
        m.stub(Reg::Rcx, "sum", &[])?;
        m.mov(Reg::Rbx, 10)?;
        m.stub(Reg::Rcx, "sub", &[])?;
        m.exit()
    })
    .unwrap();

    // One placed batch carrying both stub bodies, sixteen-byte aligned.
    let images = placer.borrow();
    assert_eq!(images.images().len(), 1);
    let (batch_base, batch) = &images.images()[0];

    let sum_addr = stubs.address("sum").unwrap();
    let sub_addr = stubs.address("sub").unwrap();
    assert_eq!(sum_addr, *batch_base);
    assert_eq!((sub_addr - batch_base) % 16, 0);
    assert!(((sub_addr - batch_base) as usize) < batch.len());

    // Each body sits at its address: push rbp; mov rbp, rsp; sub rsp, 0.
    let sum_off = (sum_addr - batch_base) as usize;
    assert_eq!(batch[sum_off], 0x55);
    // add rax, rbx inside the first body.
    assert_eq!(batch[sum_off + 11..sum_off + 14], [0x48, 0x01, 0xd8]);

    // Main image embeds both addresses; no relocations remain.
    assert!(code.relocations.is_empty());
    assert!(code
        .code
        .windows(8)
        .any(|w| w == sum_addr.to_le_bytes()));
    assert!(code
        .code
        .windows(8)
        .any(|w| w == sub_addr.to_le_bytes()));
}

/// Scenario: load an IEEE-754 bit pattern, square it, round up, convert
/// to an integer.
#[test]
fn scenario_floating_point() {
    let value: f64 = 13589.13589;
    let code = generate(Options::default(), |m| {
        m.load_double(Reg::Rax, value)?;
        m.movq(Xmm::Xmm1, Reg::Rax)?;
        m.movq(Reg::R8, Xmm::Xmm1)?;
        m.movq(Xmm::Xmm15, Reg::R8)?;
        m.mulsd(Xmm::Xmm1, Xmm::Xmm15)?;
        m.roundsd(RoundMode::Up, Xmm::Xmm1, Xmm::Xmm1)?;
        m.cvtsd2si(Reg::R8, Xmm::Xmm1)?;
        m.xchg(Reg::R8, Reg::Rax)?;
        m.ret(0);
        Ok(())
    })
    .unwrap();

    let mut expect = vec![0x48, 0xb8];
    expect.extend_from_slice(&value.to_le_bytes()); // movabs rax, bits
    expect.extend_from_slice(&[
        0x66, 0x48, 0x0f, 0x6e, 0xc8, // movq xmm1, rax
        0x66, 0x49, 0x0f, 0x7e, 0xc8, // movq r8, xmm1
        0x66, 0x4d, 0x0f, 0x6e, 0xf8, // movq xmm15, r8
        0xf2, 0x41, 0x0f, 0x59, 0xcf, // mulsd xmm1, xmm15
        0x66, 0x0f, 0x3a, 0x0b, 0xc9, 0x02, // roundsd xmm1, xmm1, up
        0xf2, 0x4c, 0x0f, 0x2d, 0xc1, // cvtsd2si r8, xmm1
        0x49, 0x90, // xchg rax, r8
        0xc3, // ret
    ]);
    assert_eq!(code.code, expect);
}

/// A procedure called through a deferred absolute address: the relocation
/// resolves against the placed image's own base.
#[test]
fn call_label_round_trips_through_placement() {
    let code = generate(Options::default(), |m| {
        m.label_scope(|m| {
            m.call_label(Reg::Rax, "answer")?;
            m.ret(0);
            m.proc(Some("answer"), |m| {
                m.mov(Reg::Rax, 42)?;
                m.exit()
            })?;
            Ok(())
        })
    })
    .unwrap();

    assert_eq!(code.relocations.len(), 1);
    let reloc = code.relocations[0];

    let mut placer = VecPlacer::new();
    let base = place(&code, &mut placer).unwrap();
    let image = placer.image(base).unwrap();

    // The placed copy carries the absolute procedure address where the
    // pre-placement image still held the placeholder.
    let mut patched = [0u8; 8];
    patched.copy_from_slice(&image[reloc.offset..reloc.offset + 8]);
    assert_eq!(u64::from_le_bytes(patched), base + reloc.target);
    assert_ne!(image[reloc.offset..reloc.offset + 8], code.code[reloc.offset..reloc.offset + 8]);
}

/// `compile` chains generation and placement, returning the entry address.
#[test]
fn compile_returns_entry_address() {
    let mut placer = VecPlacer::new();
    let entry = compile(Options::default(), &mut placer, |m| {
        m.mov(Reg::Rax, 7)?;
        m.ret(0);
        Ok(())
    })
    .unwrap();

    let image = placer.image(entry).unwrap();
    assert_eq!(image, [0x48, 0xc7, 0xc0, 0x07, 0x00, 0x00, 0x00, 0xc3]);
}

/// The pointer helper embeds a live buffer address into emitted code.
#[test]
fn ptr_operand_embeds_host_buffer_address() {
    let data = [7u8, 6, 5, 4, 3, 2, 1, 0];
    let code = generate(Options::default(), |m| {
        let addr = ptr(&data, 0);
        m.mov(Reg::Rax, addr)?;
        m.mov(Reg::Rax, jitasm_rs::Mem::base(Reg::Rax))?;
        m.ret(0);
        Ok(())
    })
    .unwrap();

    let Operand::Raw64(addr_bytes) = ptr(&data, 0) else {
        panic!("expected raw address operand");
    };
    assert_eq!(code.code[..2], [0x48, 0xb8]);
    assert_eq!(code.code[2..10], addr_bytes);
}

/// The architecture registry resolves names to backends.
#[test]
fn arch_registry_selects_backend() {
    let arch = Arch::from_name("x64").unwrap();
    let code = generate(
        Options {
            arch,
            ..Options::default()
        },
        |m| {
            m.mov(Reg::Rax, 1)?;
            m.ret(0);
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(code.code, [0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, 0xc3]);

    assert!(Arch::from_name("sparc").is_err());
}
