//! Macro-layer integration tests: procedures, spills, label scopes, stubs
//! and runtime calls.

use std::cell::RefCell;
use std::rc::Rc;

use jitasm_rs::{
    generate, Arch, AsmError, Cond, Masm, Mem, Options, Reg, RuntimeBinding, Stubs, VecPlacer,
};

fn options() -> Options {
    Options::default()
}

fn stubs_setup() -> (Stubs, Rc<RefCell<VecPlacer>>) {
    let placer: Rc<RefCell<VecPlacer>> = Rc::new(RefCell::new(VecPlacer::new()));
    let stubs = Stubs::new(Arch::X64, placer.clone());
    (stubs, placer)
}

fn stub_options() -> (Options, Rc<RefCell<VecPlacer>>) {
    let (stubs, placer) = stubs_setup();
    (
        Options {
            stubs: Some(stubs),
            ..Options::default()
        },
        placer,
    )
}

// ─── Procedures ──────────────────────────────────────────────────────────────

#[test]
fn proc_aligns_with_traps_and_reserves_spill_space() {
    let code = generate(options(), |m| {
        m.nop();
        m.proc(None, |m| {
            m.spill(|m, slot| {
                m.mov(slot, 42)?;
                m.mov(Reg::Rax, slot)
            })?;
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();

    // One nop, then int3 padding up to the 16-byte boundary.
    assert_eq!(code.code[0], 0x90);
    assert!(code.code[1..16].iter().all(|b| *b == 0xcc));

    // Frame setup with the patched spill reservation: one slot rounds up
    // to 16 bytes.
    assert_eq!(code.code[16], 0x55); // push rbp
    assert_eq!(code.code[17..20], [0x48, 0x89, 0xe5]); // mov rbp, rsp
    assert_eq!(code.code[20..27], [0x48, 0x81, 0xec, 0x10, 0x00, 0x00, 0x00]); // sub rsp, 16

    // Body addresses the slot at [rbp - 8].
    assert_eq!(code.code[27..35], [0x48, 0xc7, 0x45, 0xf8, 0x2a, 0x00, 0x00, 0x00]);
    assert_eq!(code.code[35..39], [0x48, 0x8b, 0x45, 0xf8]);

    // Epilogue.
    assert_eq!(code.code[39..], [0x48, 0x89, 0xec, 0x5d, 0xc3]);
}

#[test]
fn proc_returns_aligned_entry_offset() {
    generate(options(), |m| {
        m.nop();
        let offset = m.proc(None, |m| m.exit())?;
        assert_eq!(offset, 16);
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_procs_get_fresh_spill_numbering() {
    generate(options(), |m| {
        m.proc(None, |m| {
            let outer = m.spill_slot()?;
            assert_eq!(outer, Mem::disp(Reg::Rbp, -8));

            m.proc(None, |m| {
                // Inner procedure starts numbering from scratch.
                let inner = m.spill_slot()?;
                assert_eq!(inner, Mem::disp(Reg::Rbp, -8));
                m.free_spill(inner)?;
                m.exit()
            })?;

            // Outer numbering unaffected by the nested procedure.
            let next = m.spill_slot()?;
            assert_eq!(next, Mem::disp(Reg::Rbp, -16));
            m.free_spill(next)?;
            m.free_spill(outer)?;
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();
}

// ─── Spills ──────────────────────────────────────────────────────────────────

#[test]
fn spill_outside_proc_is_a_protocol_error() {
    let err = generate(options(), |m| m.spill_slot().map(|_| ())).unwrap_err();
    assert_eq!(err, AsmError::SpillOutsideProc);
}

#[test]
fn spill_free_list_reuses_slots() {
    generate(options(), |m| {
        m.proc(None, |m| {
            // Sequential scopes share one slot through the free list.
            m.spill(|m, a| {
                assert_eq!(a, Mem::disp(Reg::Rbp, -8));
                m.mov(a, 1)
            })?;
            m.spill(|m, b| {
                assert_eq!(b, Mem::disp(Reg::Rbp, -8));
                m.mov(b, 2)
            })?;

            // Simultaneous slots get distinct offsets.
            m.spill_n(2, |m, slots| {
                assert_eq!(slots[0], Mem::disp(Reg::Rbp, -8));
                assert_eq!(slots[1], Mem::disp(Reg::Rbp, -16));
                m.mov(slots[0], 1)?;
                m.mov(slots[1], 2)
            })?;
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn spill_footprint_tracks_maximum_depth_not_call_count() {
    let code = generate(options(), |m| {
        m.proc(None, |m| {
            for _ in 0..10 {
                m.spill(|m, slot| m.mov(slot, 1))?;
            }
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();

    // Ten sequential spills reuse one slot: the reservation stays at one
    // 16-byte-rounded cell.
    assert_eq!(code.code[4..11], [0x48, 0x81, 0xec, 0x10, 0x00, 0x00, 0x00]);
}

#[test]
fn spill_reg_saves_and_restores() {
    let code = generate(options(), |m| {
        m.proc(None, |m| {
            m.spill_reg(Reg::Rbx, |m| m.mov(Reg::Rbx, 7))?;
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();

    let save = [0x48, 0x89, 0x5d, 0xf8]; // mov [rbp-8], rbx
    let restore = [0x48, 0x8b, 0x5d, 0xf8]; // mov rbx, [rbp-8]
    let pos_save = find(&code.code, &save).expect("save emitted");
    let pos_restore = find(&code.code, &restore).expect("restore emitted");
    assert!(pos_save < pos_restore);
}

#[test]
fn spill_reg_restores_before_early_return() {
    let code = generate(options(), |m| {
        m.proc(None, |m| {
            m.mov(Reg::Rax, 42)?;
            m.spill_reg(Reg::Rax, |m| m.exit())?;
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();

    let restore = [0x48, 0x8b, 0x45, 0xf8]; // mov rax, [rbp-8]
    let epilogue = [0x48, 0x89, 0xec, 0x5d, 0xc3]; // mov rsp, rbp; pop rbp; ret

    // The return inside the spill body replays the restore before its
    // epilogue; no duplicate restore is emitted after the body, because
    // nothing was emitted since that return.
    let first_restore = find(&code.code, &restore).expect("restore before return");
    let first_epilogue = find(&code.code, &epilogue).expect("epilogue emitted");
    assert!(first_restore < first_epilogue);
    assert_eq!(count(&code.code, &restore), 1);
}

#[test]
fn spill_reg_with_jump_over_return() {
    // A body that jumps across its internal return still compiles, with
    // the register provably restored on both paths.
    let code = generate(options(), |m| {
        m.proc(None, |m| {
            m.label_scope(|m| {
                m.mov(Reg::Rax, 42)?;
                m.spill_reg(Reg::Rax, |m| {
                    m.jmp("skip")?;
                    m.exit()?;
                    m.bind("skip")
                })?;
                m.exit()
            })
        })?;
        Ok(())
    })
    .unwrap();

    let restore = [0x48, 0x8b, 0x45, 0xf8];
    assert_eq!(count(&code.code, &restore), 1);
}

#[test]
fn spill_regs_restores_in_plural() {
    let code = generate(options(), |m| {
        m.proc(None, |m| {
            m.spill_regs(&[Reg::Rbx, Reg::Rcx], |m| {
                m.mov(Reg::Rbx, 2)?;
                m.mov(Reg::Rcx, 3)
            })?;
            m.exit()
        })?;
        Ok(())
    })
    .unwrap();

    assert!(find(&code.code, &[0x48, 0x89, 0x5d, 0xf8]).is_some()); // mov [rbp-8], rbx
    assert!(find(&code.code, &[0x48, 0x89, 0x4d, 0xf0]).is_some()); // mov [rbp-16], rcx
    assert!(find(&code.code, &[0x48, 0x8b, 0x5d, 0xf8]).is_some()); // mov rbx, [rbp-8]
    assert!(find(&code.code, &[0x48, 0x8b, 0x4d, 0xf0]).is_some()); // mov rcx, [rbp-16]
}

// ─── Labels ──────────────────────────────────────────────────────────────────

#[test]
fn label_scope_requires_all_labels_bound() {
    let err = generate(options(), |m| {
        m.label_scope(|m| {
            m.j(Cond::E, "nowhere")?;
            Ok(())
        })
    })
    .unwrap_err();
    assert_eq!(
        err,
        AsmError::DanglingLabel {
            label: Some("nowhere".into())
        }
    );
}

#[test]
fn dangling_anonymous_label_fails_at_compile() {
    let err = generate(options(), |m| {
        let label = m.label();
        m.jmp(label)
    })
    .unwrap_err();
    assert_eq!(err, AsmError::DanglingLabel { label: None });
}

#[test]
fn same_name_in_one_scope_is_one_label() {
    let code = generate(options(), |m| {
        m.label_scope(|m| {
            m.j(Cond::Ne, "target")?;
            m.jmp("target")?;
            m.bind("target")
        })
    })
    .unwrap();
    // Both jumps resolve to the same bind point (offset 4).
    assert_eq!(code.code, [0x75, 0x02, 0xeb, 0x00]);
}

#[test]
fn nested_scopes_shadow_outer_names() {
    generate(options(), |m| {
        m.label_scope(|m| {
            m.jmp("out")?;
            m.label_scope(|m| {
                // Same name, different label: bound inside this scope.
                m.jmp("out")?;
                m.bind("out")
            })?;
            m.bind("out")
        })
    })
    .unwrap();
}

#[test]
fn binding_twice_is_a_protocol_error() {
    let err = generate(options(), |m| {
        let label = m.label();
        m.bind(label)?;
        m.bind(label)
    })
    .unwrap_err();
    assert_eq!(err, AsmError::AlreadyResolved { label: None });
}

// ─── Stubs ───────────────────────────────────────────────────────────────────

#[test]
fn stubs_compile_once_and_patch_every_call_site() {
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
        m.stub(Reg::Rcx, "sum", &[])?;
        m.exit()
    })
    .unwrap();

    // Exactly one batch image was placed for the three call sites.
    assert_eq!(placer.borrow().images().len(), 1);

    let sum_addr = stubs.address("sum").unwrap().to_le_bytes();
    let sub_addr = stubs.address("sub").unwrap().to_le_bytes();
    assert_ne!(sum_addr, sub_addr);

    // Every call site carries the resolved absolute address: both `sum`
    // sites the same one.
    assert_eq!(count(&code.code, &sum_addr), 2);
    assert_eq!(count(&code.code, &sub_addr), 1);

    assert_eq!(code.references.stubs, ["sum", "sub"]);
}

#[test]
fn stub_reference_after_compilation_resolves_immediately() {
    let (opts, placer) = stub_options();
    let stubs = opts.stubs.clone().unwrap();
    stubs
        .define("answer", 0, |m: &mut Masm| {
            m.mov(Reg::Rax, 42)?;
            m.exit()
        })
        .unwrap();

    generate(opts.clone(), |m| {
        m.stub(Reg::Rax, "answer", &[])?;
        m.exit()
    })
    .unwrap();
    let images_after_first = placer.borrow().images().len();

    // A second context referencing the stub triggers no further batch.
    let code = generate(opts, |m| {
        m.stub(Reg::Rax, "answer", &[])?;
        m.exit()
    })
    .unwrap();
    assert_eq!(placer.borrow().images().len(), images_after_first);

    let addr = stubs.address("answer").unwrap().to_le_bytes();
    assert_eq!(count(&code.code, &addr), 1);
}

#[test]
fn stub_arguments_are_pushed_in_reverse_with_padding() {
    let (opts, _placer) = stub_options();
    let stubs = opts.stubs.clone().unwrap();
    stubs
        .define("take3", 3, |m: &mut Masm| {
            let cell = m.arg(0)?;
            m.mov(Reg::Rax, cell)?;
            m.exit()
        })
        .unwrap();

    let code = generate(opts, |m| {
        m.stub(Reg::Rax, "take3", &[1.into(), 2.into(), 3.into()])?;
        m.exit()
    })
    .unwrap();

    // Odd argument count: zap padding first, then args reversed.
    assert_eq!(code.code[..5], [0x68, 0xef, 0xbe, 0xad, 0xde]); // push zap
    assert_eq!(code.code[5..7], [0x6a, 0x03]); // push 3
    assert_eq!(code.code[7..9], [0x6a, 0x02]); // push 2
    assert_eq!(code.code[9..11], [0x6a, 0x01]); // push 1
}

#[test]
fn stub_argc_mismatch_emits_no_bytes() {
    let (opts, _placer) = stub_options();
    let stubs = opts.stubs.clone().unwrap();
    stubs
        .define("pair", 2, |m: &mut Masm| m.exit())
        .unwrap();

    let err = generate(opts, |m| {
        m.nop();
        let before = m.offset();
        let err = m.stub(Reg::Rax, "pair", &[1.into()]).unwrap_err();
        assert_eq!(m.offset(), before);
        Err(err)
    })
    .unwrap_err();

    assert_eq!(
        err,
        AsmError::ArgcMismatch {
            stub: "pair".into(),
            expected: 2,
            got: 1
        }
    );
}

#[test]
fn duplicate_stub_definition_is_rejected() {
    let (stubs, _placer) = stubs_setup();
    stubs.define("dup", 0, |m: &mut Masm| m.exit()).unwrap();
    let err = stubs.define("dup", 0, |m: &mut Masm| m.exit()).unwrap_err();
    assert_eq!(err, AsmError::DuplicateStub { name: "dup".into() });
}

#[test]
fn unknown_stub_is_rejected_before_emission() {
    let (opts, _placer) = stub_options();
    let err = generate(opts, |m| m.stub(Reg::Rax, "missing", &[])).unwrap_err();
    assert_eq!(
        err,
        AsmError::UnknownStub {
            name: "missing".into()
        }
    );
}

#[test]
fn stub_without_registry_is_rejected() {
    let err = generate(options(), |m| m.stub(Reg::Rax, "any", &[])).unwrap_err();
    assert_eq!(err, AsmError::StubsNotConfigured);
}

#[test]
fn stub_argc_drives_return_stack_unroll() {
    let (opts, placer) = stub_options();
    let stubs = opts.stubs.clone().unwrap();
    stubs
        .define("take2", 2, |m: &mut Masm| {
            let cell = m.arg(0)?;
            m.mov(Reg::Rax, cell)?;
            m.exit()
        })
        .unwrap();

    generate(opts, |m| {
        m.stub(Reg::Rax, "take2", &[1.into(), 2.into()])?;
        m.exit()
    })
    .unwrap();

    // The batch image's return unrolls both stack arguments: ret 16.
    let images = placer.borrow();
    let (_, image) = &images.images()[0];
    assert!(find(image, &[0xc2, 0x10, 0x00]).is_some());
}

// ─── Runtime calls ───────────────────────────────────────────────────────────

#[test]
fn runtime_call_goes_through_the_trampoline_stub() {
    let (opts, placer) = stub_options();
    let stubs = opts.stubs.clone().unwrap();
    let binding = RuntimeBinding::new(0x1111_2222_3333_4444, 0x5555_6666_7777_8888);

    let code = generate(opts, |m| {
        m.runtime(&binding, &[])?;
        m.exit()
    })
    .unwrap();

    // The binding addresses are embedded into the code stream.
    assert!(find(&code.code, &0x1111_2222_3333_4444u64.to_le_bytes()).is_some());
    assert!(find(&code.code, &0x5555_6666_7777_8888u64.to_le_bytes()).is_some());

    // The trampoline compiled as a stub batch and is retained.
    assert!(stubs.address("__runtime__").is_some());
    assert_eq!(code.references.stubs, ["__runtime__"]);
    assert_eq!(code.references.runtime.len(), 1);
    assert_eq!(code.references.runtime[0].call_address, 0x1111_2222_3333_4444);
    assert_eq!(placer.borrow().images().len(), 1);

    // The trampoline dispatch ladder traps on unsupported counts.
    let images = placer.borrow();
    let (_, image) = &images.images()[0];
    assert!(find(image, &[0xcc]).is_some());
}

#[test]
fn runtime_rejects_more_than_four_arguments() {
    let (opts, _placer) = stub_options();
    let binding = RuntimeBinding::new(1, 2);
    let args = [1.into(), 2.into(), 3.into(), 4.into(), 5.into()];
    let err = generate(opts, |m| m.runtime(&binding, &args)).unwrap_err();
    assert!(matches!(err, AsmError::InvalidOperands { .. }));
}

#[test]
fn runtime_without_registry_is_rejected() {
    let binding = RuntimeBinding::new(1, 2);
    let err = generate(options(), |m| m.runtime(&binding, &[])).unwrap_err();
    assert_eq!(err, AsmError::StubsNotConfigured);
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

#[test]
fn helpers_extend_the_operation_set() {
    let mut opts = options();
    opts.helpers.insert(
        "zero".into(),
        Rc::new(|m: &mut Masm, args: &[_]| {
            assert!(args.is_empty());
            m.xor(Reg::Rax, Reg::Rax)
        }),
    );

    let code = generate(opts, |m| m.helper("zero", &[])).unwrap();
    assert_eq!(code.code, [0x48, 0x31, 0xc0]);
}

#[test]
fn unknown_helper_is_rejected() {
    let err = generate(options(), |m| m.helper("nope", &[])).unwrap_err();
    assert_eq!(err, AsmError::UnknownHelper { name: "nope".into() });
}

// ─── Byte-scan helpers ───────────────────────────────────────────────────────

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}
