//! Stub registry: named shared subroutines compiled lazily, in batches.
//!
//! A stub is referenced by name from call sites before its bytes exist.
//! Each reference either patches immediately (the stub already has a
//! resolved address) or queues the call site and marks the stub pending.
//! [`Stubs::compile_pending`] then emits every pending stub body into one
//! combined code image, places it through the registry's
//! [`Placer`](crate::Placer), and back-patches every queued call site with
//! the resolved absolute address. A stub body is compiled exactly once;
//! references arriving after compilation resolve on the spot.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::assembler::{place, Options, Placer};
use crate::error::AsmError;
use crate::ir::Arch;
use crate::masm::Masm;

/// A stub's emission body.
pub type StubBody = Rc<dyn Fn(&mut Masm) -> Result<(), AsmError>>;

struct Stub {
    argc: usize,
    body: StubBody,
    /// Offset of the compiled procedure within its batch image.
    offset: Cell<Option<usize>>,
    /// Absolute address once the batch image is placed.
    address: Cell<Option<u64>>,
}

struct Inner {
    arch: Arch,
    placer: Rc<RefCell<dyn Placer>>,
    stubs: BTreeMap<String, Rc<Stub>>,
    /// Stubs referenced before compilation, in first-reference order.
    pending: Vec<String>,
    /// Cross-batch call sites: `(image base, placeholder offset, stub)`,
    /// patched through the placer once the stub's address exists.
    deferred: Vec<(u64, usize, String)>,
}

/// Cheap-clone handle to a stub registry, shared by every assembler
/// context that should see the same stub pool.
#[derive(Clone)]
pub struct Stubs {
    inner: Rc<RefCell<Inner>>,
}

impl Stubs {
    /// Create a registry for `arch`; batch images are placed through
    /// `placer`.
    #[must_use]
    pub fn new(arch: Arch, placer: Rc<RefCell<dyn Placer>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                arch,
                placer,
                stubs: BTreeMap::new(),
                pending: Vec::new(),
                deferred: Vec::new(),
            })),
        }
    }

    /// Register a stub body under `name` with its formal argument count.
    /// Call sites must supply exactly `argc` arguments.
    ///
    /// # Errors
    ///
    /// [`AsmError::DuplicateStub`] if the name is taken.
    pub fn define<F>(&self, name: &str, argc: usize, body: F) -> Result<(), AsmError>
    where
        F: Fn(&mut Masm) -> Result<(), AsmError> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if inner.stubs.contains_key(name) {
            return Err(AsmError::DuplicateStub { name: name.into() });
        }
        inner.stubs.insert(
            name.into(),
            Rc::new(Stub {
                argc,
                body: Rc::new(body),
                offset: Cell::new(None),
                address: Cell::new(None),
            }),
        );
        Ok(())
    }

    /// Whether `name` is defined.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.inner.borrow().stubs.contains_key(name)
    }

    /// Declared argument count of `name`.
    ///
    /// # Errors
    ///
    /// [`AsmError::UnknownStub`] for undefined names.
    pub fn argc(&self, name: &str) -> Result<usize, AsmError> {
        self.inner
            .borrow()
            .stubs
            .get(name)
            .map(|s| s.argc)
            .ok_or_else(|| AsmError::UnknownStub { name: name.into() })
    }

    /// Resolved absolute address of `name`, if it has compiled.
    #[must_use]
    pub fn address(&self, name: &str) -> Option<u64> {
        self.inner
            .borrow()
            .stubs
            .get(name)
            .and_then(|s| s.address.get())
    }

    /// Offset of `name` within the batch image currently being emitted.
    pub(crate) fn offset(&self, name: &str) -> Option<usize> {
        self.inner
            .borrow()
            .stubs
            .get(name)
            .and_then(|s| s.offset.get())
    }

    /// Mark a referenced-but-uncompiled stub for the next batch.
    pub(crate) fn mark_pending(&self, name: &str) {
        let mut inner = self.inner.borrow_mut();
        if !inner.pending.iter().any(|n| n == name) {
            inner.pending.push(name.into());
        }
    }

    /// Compile every pending stub.
    ///
    /// Runs in waves: each wave emits all currently pending bodies into
    /// one combined batch context, places the image, and back-patches the
    /// wave's queued call sites. Bodies may reference further stubs; those
    /// become the next wave, and their call sites inside already-placed
    /// images are patched through the placer.
    ///
    /// # Errors
    ///
    /// Propagates emission and placement failures.
    pub fn compile_pending(&self) -> Result<(), AsmError> {
        loop {
            let batch: Vec<(String, Rc<Stub>)> = {
                let mut inner = self.inner.borrow_mut();
                let names = core::mem::take(&mut inner.pending);
                names
                    .into_iter()
                    .map(|name| {
                        let stub = inner.stubs.get(&name).cloned().ok_or_else(|| {
                            AsmError::UnknownStub { name: name.clone() }
                        })?;
                        Ok((name, stub))
                    })
                    .collect::<Result<_, AsmError>>()?
            };
            if batch.is_empty() {
                break;
            }

            let arch = self.inner.borrow().arch;
            let mut masm = Masm::new_batch(Options {
                arch,
                stubs: Some(self.clone()),
                helpers: BTreeMap::new(),
            })?;

            for (_, stub) in &batch {
                let body = Rc::clone(&stub.body);
                let offset = masm.proc_with_argc(None, stub.argc, |m| (*body)(m))?;
                stub.offset.set(Some(offset));
            }

            // Sibling references within the batch became relocations of
            // the image; references to still-undefined stubs come back as
            // leftovers and are patched after a later wave.
            let (compiled, leftover) = masm.finish()?;

            let placer = self.inner.borrow().placer.clone();
            let base = place(&compiled, &mut *placer.borrow_mut())?;

            {
                let mut inner = self.inner.borrow_mut();
                for (_, stub) in &batch {
                    let offset = stub.offset.get().expect("set during emission");
                    stub.address.set(Some(base + offset as u64));
                }
                for use_ in leftover {
                    inner.deferred.push((base, use_.at, use_.name));
                }
            }

            self.flush_deferred()?;
        }
        Ok(())
    }

    /// Patch cross-batch call sites whose stub has an address now.
    fn flush_deferred(&self) -> Result<(), AsmError> {
        let (placer, ready): (Rc<RefCell<dyn Placer>>, Vec<(u64, usize, u64)>) = {
            let mut inner = self.inner.borrow_mut();
            let mut ready = Vec::new();
            let mut keep = Vec::new();
            for (base, at, name) in core::mem::take(&mut inner.deferred) {
                let address = inner.stubs.get(&name).and_then(|s| s.address.get());
                match address {
                    Some(addr) => ready.push((base, at, addr)),
                    None => keep.push((base, at, name)),
                }
            }
            inner.deferred = keep;
            (inner.placer.clone(), ready)
        };

        let mut placer = placer.borrow_mut();
        for (base, at, addr) in ready {
            placer.patch(base, at, &addr.to_le_bytes())?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for Stubs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Stubs")
            .field("arch", &inner.arch)
            .field("defined", &inner.stubs.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}
