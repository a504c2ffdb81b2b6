use anyhow::bail;
use guest_intercept::{
    CacheInvalidator, CallDispatcher, CallSite, Config, ContextId, CpuState, Encoding, Error,
    ExclusiveMonitor, ExecutionContext, GuestMemory, HookAction, HookHandle, HookInvocation,
    HookManager, HookTarget, InjectTarget, ModuleId, ModuleRef, ModuleTable, NativeHandler,
    SegmentInfo, ThreadId, Trampoline, TrampolineRegistry, VecMemory, ANY_LIBRARY, REG_LR,
};
use spin::Mutex;
use std::sync::Arc;

const CODE: u32 = 0x8100_0000;
const STUBS: u32 = CODE + 0x8000;
const RETURN_ADDRESS: u32 = CODE + 0x777;

const LIBRARY_NID: u32 = 0xCAE9_ACE6;
const THUMB_FN: u32 = 0x7A5A_49A1;
const ARM_FN: u32 = 0x1234_5678;

/// `push {r4, lr}; mov r4, r0` followed by `bx lr`.
const THUMB_PROLOGUE: [u8; 6] = [0x10, 0xB5, 0x04, 0x46, 0x70, 0x47];
/// `push {r4, lr}` followed by `bx lr`.
const ARM_PROLOGUE: [u8; 8] = [0x10, 0x40, 0x2D, 0xE9, 0x1E, 0xFF, 0x2F, 0xE1];

#[derive(Default)]
struct Flushes(Mutex<Vec<(u32, u32)>>);

impl CacheInvalidator for Flushes {
    fn invalidate(&self, address: u32, len: u32) {
        self.0.lock().push((address, len));
    }
}

struct Machine {
    memory: Arc<VecMemory>,
    registry: Arc<TrampolineRegistry>,
    hooks: Arc<HookManager>,
    dispatcher: CallDispatcher,
    flushes: Arc<Flushes>,
}

impl Machine {
    fn new() -> anyhow::Result<Self> {
        Self::with_config(Config {
            stub_region_base: STUBS,
            stub_region_size: 0x200,
            stub_size: 32,
        })
    }

    fn with_config(config: Config) -> anyhow::Result<Self> {
        let memory = Arc::new(VecMemory::new_zeroed(CODE, 0x1_0000));
        memory.write(CODE + 0x100, &THUMB_PROLOGUE)?;
        memory.write(CODE + 0x200, &ARM_PROLOGUE)?;

        let modules = Arc::new(ModuleTable::new());
        modules
            .define_module(
                kernel(),
                "SceLibKernel",
                0x0F00_BA55,
                &[SegmentInfo {
                    vaddr: CODE,
                    size: 0x1000,
                }],
            )
            .set_main_module(kernel())
            .define_export(kernel(), LIBRARY_NID, THUMB_FN, CODE + 0x101)
            .define_export(kernel(), LIBRARY_NID, ARM_FN, CODE + 0x200)
            .define_import(kernel(), 0xABCD_0000, 0x1111, CODE + 0x300);

        let registry = Arc::new(TrampolineRegistry::new());
        let flushes = Arc::new(Flushes::default());
        let hooks = Arc::new(
            HookManager::new(config, registry.clone(), memory.clone(), modules)
                .with_cache_invalidator(flushes.clone()),
        );
        let dispatcher = CallDispatcher::new(
            registry.clone(),
            Arc::new(ExclusiveMonitor::new()),
            memory.clone(),
            Arc::new(|_: &mut dyn ExecutionContext, nid: u32, _: ThreadId| {
                panic!("unexpected service call {nid:#x}")
            }),
        );

        Ok(Self {
            memory,
            registry,
            hooks,
            dispatcher,
            flushes,
        })
    }

    /// Calls `entry` and runs until the first instruction that isn't a trap
    /// or part of a hook stub. Returns the program counter there.
    fn call(&self, entry: u32) -> anyhow::Result<u32> {
        let mut ctx = CpuState::new(ContextId::from_u32(0), ThreadId::from_u32(7));
        ctx.set_reg(REG_LR, RETURN_ADDRESS);
        ctx.set_pc(entry);
        self.run(&mut ctx)
    }

    fn run(&self, ctx: &mut CpuState) -> anyhow::Result<u32> {
        for _ in 0..32 {
            let pc = ctx.pc() & !1;
            let (svc, width) = if ctx.is_thumb() {
                let insn = self.memory.read_u16(pc)?;
                ((insn & 0xFF00 == 0xDF00).then_some(u32::from(insn & 0xFF)), 2)
            } else {
                let insn = self.memory.read_u32(pc)?;
                ((insn & 0x0F00_0000 == 0x0F00_0000).then_some(insn & 0x00FF_FFFF), 4)
            };

            match svc {
                Some(imm) => self.dispatcher.handle_trap(ctx, imm, pc + width)?,
                None if (STUBS..STUBS + 0x200).contains(&pc) => ctx.set_pc(ctx.pc() + width),
                None => return Ok(ctx.pc()),
            }
        }
        bail!("guest code did not settle")
    }
}

fn kernel() -> ModuleId {
    ModuleId::from_u32(1)
}

fn logging(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> NativeHandler {
    let log = log.clone();
    Arc::new(move |_: &mut HookInvocation<'_>| {
        log.lock().push(name);
        HookAction::Continue
    })
}

fn thumb_fn() -> HookTarget {
    HookTarget::export("SceLibKernel", LIBRARY_NID, THUMB_FN)
}

#[test_log::test]
fn newest_hook_runs_first() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let h1 = m.hooks.install_hook(thumb_fn(), logging(&log, "h1"))?;
    let h2 = m.hooks.install_hook(thumb_fn(), logging(&log, "h2"))?;
    assert_eq!(m.hooks.chain_len(CODE + 0x101), 2);

    // both hooks continue, so the original body runs up to its `bx lr`
    assert_eq!(m.call(CODE + 0x101)?, CODE + 0x105);
    assert_eq!(*log.lock(), ["h2", "h1"]);

    m.hooks.release_hook(h2)?;
    log.lock().clear();
    assert_eq!(m.call(CODE + 0x101)?, CODE + 0x105);
    assert_eq!(*log.lock(), ["h1"]);

    m.hooks.release_hook(h1)?;
    log.lock().clear();
    assert_eq!(m.call(CODE + 0x101)?, CODE + 0x101);
    assert!(log.lock().is_empty());

    Ok(())
}

#[test_log::test]
fn handler_sees_the_displaced_original() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let seen = Arc::new(Mutex::new(None));

    let handler: NativeHandler = {
        let seen = seen.clone();
        Arc::new(move |inv: &mut HookInvocation<'_>| {
            *seen.lock() = Some((inv.original, inv.entry, inv.ctx.thread_id()));
            HookAction::Continue
        })
    };
    m.hooks.install_hook(thumb_fn(), handler)?;
    m.call(CODE + 0x101)?;

    let (original, entry, thread) = seen.lock().take().expect("handler did not run");
    assert_ne!(original & !1, CODE + 0x100);
    assert_eq!(original, STUBS + 12 + 1);
    assert_eq!(entry, CODE + 0x100);
    assert_eq!(thread, ThreadId::from_u32(7));

    // the displaced prologue lives on in the stub
    let mut displaced = [0; 4];
    m.memory.read(original & !1, &mut displaced)?;
    assert_eq!(displaced, THUMB_PROLOGUE[..4]);

    Ok(())
}

#[test_log::test]
fn return_and_jump_short_circuit() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    m.hooks.install_hook(thumb_fn(), logging(&log, "older"))?;
    let ret = m.hooks.install_hook(
        thumb_fn(),
        Arc::new(|inv: &mut HookInvocation<'_>| {
            inv.ctx.set_reg(0, 0x8001_0005);
            HookAction::Return
        }),
    )?;
    assert_eq!(m.call(CODE + 0x101)?, RETURN_ADDRESS);
    assert!(log.lock().is_empty());

    m.hooks.release_hook(ret)?;
    m.hooks.install_hook(
        thumb_fn(),
        Arc::new(|_: &mut HookInvocation<'_>| HookAction::Jump(CODE + 0x400)),
    )?;
    assert_eq!(m.call(CODE + 0x101)?, CODE + 0x400);
    assert!(log.lock().is_empty());

    Ok(())
}

#[test_log::test]
fn arm_entries_use_the_wide_encoding() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));
    let handle = m.hooks.install_hook(
        HookTarget::Export {
            module: ModuleRef::Main,
            library_nid: ANY_LIBRARY,
            function_nid: ARM_FN,
        },
        logging(&log, "arm"),
    )?;

    assert_eq!(m.memory.read_u32(CODE + 0x200)?, 0xEF00_0054);
    assert_eq!(m.call(CODE + 0x200)?, CODE + 0x204);
    assert_eq!(*log.lock(), ["arm"]);

    m.hooks.release_hook(handle)?;
    let mut restored = [0; 4];
    m.memory.read(CODE + 0x200, &mut restored)?;
    assert_eq!(restored, ARM_PROLOGUE[..4]);

    Ok(())
}

#[test_log::test]
fn install_then_release_restores_everything() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let handle = m.hooks.install_hook(thumb_fn(), logging(&log, "h"))?;
    assert_eq!(m.memory.read_u16(CODE + 0x100)?, 0xDF54);
    assert_eq!(m.registry.len(), 3);
    assert!(m.flushes.0.lock().contains(&(CODE + 0x100, 4)));

    m.hooks.release_hook(handle)?;
    let mut entry = [0; 6];
    m.memory.read(CODE + 0x100, &mut entry)?;
    assert_eq!(entry, THUMB_PROLOGUE);
    assert!(m.registry.lookup(CODE + 0x100).is_none());
    assert_eq!(m.hooks.chain_len(CODE + 0x100), 0);

    // the stub keeps its way out until it is reclaimed
    assert_eq!(m.registry.len(), 2);
    assert_eq!(m.hooks.reclaim_retired(), 1);
    assert!(m.registry.is_empty());

    Ok(())
}

#[test_log::test]
fn hooks_chain_in_front_of_an_existing_trampoline() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    m.memory.write_u32(CODE + 0x700, 0xEF00_0054)?;
    let jumper = m.registry.install(Trampoline::jumper(
        CallSite::new(CODE + 0x700, Encoding::Wide),
        CODE + 0x400,
    ))?;
    assert_eq!(m.call(CODE + 0x700)?, CODE + 0x400);

    let handle = m
        .hooks
        .install_hook(HookTarget::Absolute(CODE + 0x700), logging(&log, "h"))?;
    assert_eq!(m.registry.len(), 4);

    // the chain falls through to the trampoline's target
    assert_eq!(m.call(CODE + 0x700)?, CODE + 0x400);
    assert_eq!(*log.lock(), ["h"]);
    assert_eq!(m.registry.get(jumper).map(|tr| tr.target), Some(CODE + 0x400));

    m.hooks.release_hook(handle)?;
    assert_eq!(m.memory.read_u32(CODE + 0x700)?, 0xEF00_0054);
    let (active, _) = m
        .registry
        .lookup_handle(CODE + 0x700)
        .expect("trampoline was not uncovered");
    assert_eq!(active, jumper);

    log.lock().clear();
    assert_eq!(m.call(CODE + 0x700)?, CODE + 0x400);
    assert!(log.lock().is_empty());

    assert_eq!(m.hooks.reclaim_retired(), 1);
    assert_eq!(m.registry.len(), 1);

    Ok(())
}

#[test_log::test]
fn callback_trampolines_are_not_taken_over() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    m.registry.install(Trampoline::handler(
        CallSite::new(CODE + 0x700, Encoding::Wide),
        CODE + 0x400,
        Arc::new(|_: &mut dyn ExecutionContext, _: &dyn GuestMemory, lr: u32| lr),
    ))?;
    assert_eq!(
        m.hooks
            .install_hook(HookTarget::Absolute(CODE + 0x700), logging(&log, "h")),
        Err(Error::PatchExists {
            address: CODE + 0x700
        })
    );
    assert_eq!(m.registry.len(), 1);

    Ok(())
}

#[test_log::test]
fn thumb_entries_must_not_split_an_instruction() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    // `movs r0, #0; bl ...`: the patch window ends inside the `bl`
    let split = [0x00, 0x20, 0x00, 0xF0, 0x00, 0xF8];
    m.memory.write(CODE + 0x600, &split)?;
    assert_eq!(
        m.hooks
            .install_hook(HookTarget::Absolute(CODE + 0x601), logging(&log, "h")),
        Err(Error::InvalidTarget)
    );
    let mut entry = [0; 6];
    m.memory.read(CODE + 0x600, &mut entry)?;
    assert_eq!(entry, split);
    assert!(m.registry.is_empty());

    // `push.w {r4, lr}; bx lr`: one 32-bit instruction fills the window
    m.memory
        .write(CODE + 0x680, &[0x2D, 0xE9, 0x10, 0x40, 0x70, 0x47])?;
    m.hooks
        .install_hook(HookTarget::Absolute(CODE + 0x681), logging(&log, "h"))?;
    assert_eq!(m.call(CODE + 0x681)?, CODE + 0x685);
    assert_eq!(*log.lock(), ["h"]);

    Ok(())
}

#[test_log::test]
fn double_release_is_rejected() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let h1 = m.hooks.install_hook(thumb_fn(), logging(&log, "h1"))?;
    let h2 = m.hooks.install_hook(thumb_fn(), logging(&log, "h2"))?;

    m.hooks.release_hook(h2)?;
    assert_eq!(m.hooks.release_hook(h2), Err(Error::NotFound));
    assert_eq!(m.hooks.chain_len(CODE + 0x100), 1);

    m.call(CODE + 0x101)?;
    assert_eq!(*log.lock(), ["h1"]);

    m.hooks.release_hook(h1)?;
    assert_eq!(m.hooks.release_hook(h1), Err(Error::NotFound));

    Ok(())
}

#[test_log::test]
fn same_head_handler_is_a_patch_conflict() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler = logging(&log, "h");

    m.hooks.install_hook(thumb_fn(), handler.clone())?;
    assert_eq!(
        m.hooks.install_hook(thumb_fn(), handler),
        Err(Error::PatchExists {
            address: CODE + 0x100
        })
    );

    // an entry overlapping the patched window
    assert_eq!(
        m.hooks
            .install_hook(HookTarget::Absolute(CODE + 0x103), logging(&log, "x")),
        Err(Error::PatchExists {
            address: CODE + 0x100
        })
    );
    assert_eq!(m.hooks.chain_len(CODE + 0x100), 1);

    Ok(())
}

#[test_log::test]
fn unresolvable_targets() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let cases = [
        (
            HookTarget::export("SceLibKernel", LIBRARY_NID, 0xDEAD),
            Error::InvalidTarget,
        ),
        (
            HookTarget::export("SceNotLoaded", LIBRARY_NID, THUMB_FN),
            Error::InvalidTarget,
        ),
        (
            HookTarget::Offset {
                module: ModuleId::from_u32(9),
                segment: 0,
                offset: 0,
                thumb: false,
            },
            Error::InvalidTarget,
        ),
        (
            HookTarget::Offset {
                module: kernel(),
                segment: 3,
                offset: 0,
                thumb: true,
            },
            Error::InvalidSegment { segment: 3 },
        ),
        (HookTarget::Absolute(0), Error::InvalidTarget),
        // the patch window would wrap around the address space
        (HookTarget::Absolute(0xFFFF_FFFD), Error::InvalidTarget),
    ];
    for (target, err) in cases {
        assert_eq!(m.hooks.install_hook(target, logging(&log, "h")), Err(err));
    }
    assert!(m.registry.is_empty());

    // offsets and imports resolve through the module table
    let offset = m.hooks.install_hook(
        HookTarget::Offset {
            module: kernel(),
            segment: 0,
            offset: 0x100,
            thumb: true,
        },
        logging(&log, "offset"),
    )?;
    assert_eq!(m.hooks.chain_len(CODE + 0x100), 1);
    m.hooks.release_hook(offset)?;

    m.hooks.install_hook(
        HookTarget::Import {
            module: ModuleRef::Main,
            library_nid: 0xABCD_0000,
            function_nid: 0x1111,
        },
        logging(&log, "import"),
    )?;
    assert_eq!(m.hooks.chain_len(CODE + 0x300), 1);

    Ok(())
}

#[test_log::test]
fn stubs_are_reused_after_reclaim() -> anyhow::Result<()> {
    let m = Machine::with_config(Config {
        stub_region_base: STUBS,
        stub_region_size: 32,
        stub_size: 32,
    })?;
    let log = Arc::new(Mutex::new(Vec::new()));
    let arm_fn = HookTarget::export("SceLibKernel", LIBRARY_NID, ARM_FN);

    let handle = m.hooks.install_hook(thumb_fn(), logging(&log, "a"))?;
    assert_eq!(
        m.hooks.install_hook(arm_fn.clone(), logging(&log, "b")),
        Err(Error::StubsExhausted)
    );
    // a failed install leaves the entry alone
    assert_eq!(m.memory.read_u32(CODE + 0x200)?, 0xE92D_4010);

    // a trap still holding the stub's trampoline keeps it retired
    let in_flight = m.registry.lookup(CODE + 0x100);
    assert!(in_flight.is_some());
    m.hooks.release_hook(handle)?;
    assert_eq!(m.hooks.reclaim_retired(), 0);
    assert_eq!(
        m.hooks.install_hook(arm_fn.clone(), logging(&log, "b")),
        Err(Error::StubsExhausted)
    );

    drop(in_flight);
    assert_eq!(m.hooks.reclaim_retired(), 1);
    m.hooks.install_hook(arm_fn, logging(&log, "b"))?;
    assert_eq!(m.call(CODE + 0x200)?, CODE + 0x204);
    assert_eq!(*log.lock(), ["b"]);

    Ok(())
}

#[test_log::test]
fn handler_may_release_itself() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let own: Arc<Mutex<Option<HookHandle>>> = Arc::new(Mutex::new(None));
    let runs = Arc::new(Mutex::new(0_u32));

    let handler: NativeHandler = {
        let hooks = m.hooks.clone();
        let own = own.clone();
        let runs = runs.clone();
        Arc::new(move |_: &mut HookInvocation<'_>| {
            *runs.lock() += 1;
            if let Some(handle) = own.lock().take() {
                hooks.release_hook(handle).expect("release from handler");
            }
            HookAction::Continue
        })
    };
    *own.lock() = Some(m.hooks.install_hook(thumb_fn(), handler)?);

    // the running trap finishes through the stub even though the hook is gone
    assert_eq!(m.call(CODE + 0x101)?, CODE + 0x105);
    assert_eq!(m.call(CODE + 0x101)?, CODE + 0x101);
    assert_eq!(*runs.lock(), 1);
    assert_eq!(m.hooks.reclaim_retired(), 1);
    assert!(m.registry.is_empty());

    Ok(())
}

#[test_log::test]
fn inject_writes_once() -> anyhow::Result<()> {
    let m = Machine::new()?;
    let log = Arc::new(Mutex::new(Vec::new()));

    let address = m.hooks.inject(
        InjectTarget::Offset {
            module: kernel(),
            segment: 0,
            offset: 0x500,
        },
        &[0x00, 0x20, 0x70, 0x47],
    )?;
    assert_eq!(address, CODE + 0x500);
    assert_eq!(m.memory.read_u32(CODE + 0x500)?, 0x4770_2000);
    assert!(m.flushes.0.lock().contains(&(CODE + 0x500, 4)));

    assert_eq!(
        m.hooks.inject(
            InjectTarget::Offset {
                module: kernel(),
                segment: 0,
                offset: 0xFFE,
            },
            &[0; 4],
        ),
        Err(Error::InvalidSegment { segment: 0 })
    );

    assert_eq!(
        m.hooks.inject(
            InjectTarget::Offset {
                module: ModuleId::from_u32(9),
                segment: 0,
                offset: 0,
            },
            &[0; 4],
        ),
        Err(Error::InvalidTarget)
    );

    m.hooks.install_hook(thumb_fn(), logging(&log, "h"))?;
    assert_eq!(
        m.hooks.inject(InjectTarget::Absolute(CODE + 0xFE), &[0; 4]),
        Err(Error::PatchExists {
            address: CODE + 0x100
        })
    );
    assert_eq!(
        m.hooks.inject(InjectTarget::Absolute(CODE + 0x104), &[0; 2])?,
        CODE + 0x104
    );

    Ok(())
}

#[test_log::test]
fn module_queries() -> anyhow::Result<()> {
    let m = Machine::new()?;

    assert_eq!(
        m.hooks
            .export_address(&"SceLibKernel".into(), ANY_LIBRARY, THUMB_FN)?,
        CODE + 0x101
    );
    let info = m.hooks.module_info(&ModuleRef::Main)?;
    assert_eq!(info.id, kernel());
    assert_eq!(&*info.name, "SceLibKernel");
    assert_eq!(info.segments[0].vaddr, CODE);
    assert_eq!(
        m.hooks.module_info(&"SceAppUtil".into()),
        Err(Error::InvalidModule)
    );

    Ok(())
}
