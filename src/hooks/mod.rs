//! Function hooks on guest code.
//!
//! Hooking an entry patches its first instruction with a redirect trap into a
//! per-entry stub, whose handler trap runs the chain of native hooks installed
//! at that entry. The original function stays callable through the displaced
//! instructions kept in the stub.
//!
//! An entry that already traps through a plain redirect trampoline is taken
//! over instead: the hooks run in front of it, the chain falls through to its
//! target, and releasing the last hook uncovers it again.

mod chain;
mod stub;

pub use chain::{HookAction, HookInvocation, NativeHandler};

use crate::arena::GenerationalArena;
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::guest_memory::GuestMemory;
use crate::indices::{ModuleId, TrampolineId};
use crate::module_table::{ModuleInfo, ModuleRef, ModuleResolver};
use crate::registry::{Trampoline, TrampolineCallback, TrampolineRegistry};
use crate::trap::{CallSite, Encoding, HookTarget};
use crate::{Error, PATCH_SIZE, SVC_REDIRECT, SVC_RESUME_WITH_CALLBACK};
use alloc::sync::Arc;
use chain::{HookChain, HookLink};
use core::fmt;
use hashbrown::HashMap;
use smallvec::SmallVec;
use spin::Mutex;
use stub::{Stub, StubAllocator};
use wasmtime_slab::Id;

/// Flushes translated code after guest instructions were rewritten.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, address: u32, len: u32);
}

/// A [`CacheInvalidator`] for interpreters and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInvalidate;

impl CacheInvalidator for NoInvalidate {
    fn invalidate(&self, _address: u32, _len: u32) {}
}

/// Where [`HookManager::inject`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectTarget {
    Absolute(u32),
    Offset {
        module: ModuleId,
        segment: u32,
        offset: u32,
    },
}

/// Identifies one installed hook. Stays invalid once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    slot: Id,
    generation: u32,
}

/// Installs and removes hook chains on guest function entries.
pub struct HookManager {
    registry: Arc<TrampolineRegistry>,
    memory: Arc<dyn GuestMemory>,
    resolver: Arc<dyn ModuleResolver>,
    cache: Arc<dyn CacheInvalidator>,
    state: Mutex<State>,
}

struct State {
    patches: HashMap<u32, Patch>,
    hooks: GenerationalArena<HookRecord>,
    stubs: StubAllocator,
}

/// The rewritten entry of a hooked function.
struct Patch {
    encoding: Encoding,
    original: [u8; PATCH_SIZE as usize],
    stub: Stub,
    chain: Arc<HookChain>,
    entry_jumper: TrampolineId,
    /// Handler and return jumper.
    stub_trampolines: [TrampolineId; 2],
}

/// How the entry of a first hook traps into its stub.
struct EntrySite {
    encoding: Encoding,
    /// Handle and target of the redirect trampoline found at the entry.
    shadowed: Option<(TrampolineId, u32)>,
}

struct HookRecord {
    target: HookTarget,
    entry: u32,
    link: Arc<HookLink>,
}

impl HookManager {
    pub fn new(
        config: Config,
        registry: Arc<TrampolineRegistry>,
        memory: Arc<dyn GuestMemory>,
        resolver: Arc<dyn ModuleResolver>,
    ) -> Self {
        if config.stub_capacity() == 0 {
            tracing::warn!("{config:?} has no room for a single hook stub");
        }

        Self {
            registry,
            memory,
            resolver,
            cache: Arc::new(NoInvalidate),
            state: Mutex::new(State {
                patches: HashMap::new(),
                hooks: GenerationalArena::default(),
                stubs: StubAllocator::new(&config),
            }),
        }
    }

    #[must_use]
    pub fn with_cache_invalidator(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    /// Installs `handler` in front of every hook already at the entry `target`
    /// resolves to.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTarget`] if `target` doesn't resolve, including
    ///   modules that aren't loaded, or if the entry can't be patched: it lies
    ///   in the last word of the address space, or its first 4 bytes end in
    ///   the middle of a 32-bit Thumb instruction.
    /// - [`Error::InvalidSegment`] for an offset outside its segment.
    /// - [`Error::PatchExists`] if `handler` already is the newest hook at the
    ///   entry, the entry overlaps another hooked entry, or a callback
    ///   trampoline already sits at the entry.
    /// - [`Error::StubsExhausted`] if this is the first hook at the entry and
    ///   the stub region is full.
    /// - [`Error::MemoryOutOfBounds`] if the entry or stub can't be accessed.
    pub fn install_hook(
        &self,
        target: HookTarget,
        handler: NativeHandler,
    ) -> crate::Result<HookHandle> {
        let entry = self.resolve(&target)?;
        let address = entry & !1;

        let mut state = self.state.lock();
        let existing = state.patches.get(&address).map(|patch| patch.chain.clone());
        let chain = match existing {
            Some(chain) if chain.is_head(&handler) => {
                return Err(Error::PatchExists { address });
            }
            Some(chain) => chain,
            None => {
                let patch = self.patch_entry(&mut state, entry, target.clone())?;
                let chain = patch.chain.clone();
                state.patches.insert(address, patch);
                chain
            }
        };

        let link = Arc::new(HookLink { handler });
        chain.push_front(link.clone());

        let (slot, generation) = state.hooks.insert(HookRecord {
            target,
            entry: address,
            link,
        });
        let handle = HookHandle { slot, generation };

        tracing::debug!(
            "installed hook {handle:?} at {address:#010x}, chain length {}",
            chain.len()
        );
        Ok(handle)
    }

    /// Removes a hook. Releasing the last hook at an entry restores the
    /// original instructions, or the trampoline that was there before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle was already released, or
    /// [`Error::MemoryOutOfBounds`] if the entry can't be restored. The hook is
    /// gone in the latter case.
    pub fn release_hook(&self, handle: HookHandle) -> crate::Result<()> {
        let mut state = self.state.lock();
        let Some(record) = state.hooks.remove(handle.slot, handle.generation) else {
            tracing::warn!("attempted to release stale hook {handle:?}");
            return Err(Error::NotFound);
        };

        let remaining = match state.patches.get(&record.entry) {
            Some(patch) => patch.chain.remove(&record.link),
            None => 0,
        };
        tracing::debug!(
            "released hook {handle:?} on {:?}, {remaining} left",
            record.target
        );
        if remaining > 0 {
            return Ok(());
        }

        match state.patches.remove(&record.entry) {
            Some(patch) => self.unpatch_entry(&mut state, record.entry, patch),
            None => Ok(()),
        }
    }

    /// Writes `payload` over guest memory and returns the address written to.
    ///
    /// Injections are permanent; there is no way to undo one.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTarget`] or [`Error::InvalidSegment`] if an
    ///   [`InjectTarget::Offset`] doesn't resolve, also if the payload runs past
    ///   the end of the segment.
    /// - [`Error::PatchExists`] if the payload would overwrite a hooked entry.
    /// - [`Error::MemoryOutOfBounds`] if the range isn't mapped.
    pub fn inject(&self, target: InjectTarget, payload: &[u8]) -> crate::Result<u32> {
        let len = u32::try_from(payload.len()).map_err(|_| Error::InvalidTarget)?;
        let address = match target {
            InjectTarget::Absolute(address) => address,
            InjectTarget::Offset {
                module,
                segment,
                offset,
            } => {
                if let Some(last) = len.checked_sub(1) {
                    let end = offset
                        .checked_add(last)
                        .ok_or(Error::InvalidSegment { segment })?;
                    self.resolver
                        .resolve_offset(module, segment, end)
                        .map_err(unresolved)?;
                }
                self.resolver
                    .resolve_offset(module, segment, offset)
                    .map_err(unresolved)?
            }
        };

        let state = self.state.lock();
        if let Some(hooked) = state
            .patches
            .keys()
            .copied()
            .find(|entry| ranges_overlap(*entry, PATCH_SIZE, address, len))
        {
            return Err(Error::PatchExists { address: hooked });
        }

        self.memory.write(address, payload)?;
        self.cache.invalidate(address, len);

        tracing::debug!("injected {len} bytes at {address:#010x}");
        Ok(address)
    }

    /// Frees the stubs of released entries, unregistering their remaining
    /// trampolines. Returns the number of stubs freed.
    ///
    /// Call at a point where no guest thread is executing the displaced
    /// instructions of a released entry, e.g. with all cores stopped. Stubs
    /// whose descriptors are still held by a running trap are skipped.
    pub fn reclaim_retired(&self) -> usize {
        let freed = self.state.lock().stubs.reclaim(&self.registry);
        if freed > 0 {
            tracing::debug!("reclaimed {freed} hook stubs");
        }
        freed
    }

    /// Number of hooks installed at the entry `address`.
    pub fn chain_len(&self, address: u32) -> usize {
        self.state
            .lock()
            .patches
            .get(&(address & !1))
            .map_or(0, |patch| patch.chain.len())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidModule`] if the module isn't loaded.
    pub fn module_info(&self, module: &ModuleRef) -> crate::Result<ModuleInfo> {
        self.resolver.module_info(module)
    }

    /// Resolves an export without hooking it. `library_nid` may be
    /// [`ANY_LIBRARY`](crate::ANY_LIBRARY).
    ///
    /// # Errors
    ///
    /// See [`ModuleResolver::resolve_export`].
    pub fn export_address(
        &self,
        module: &ModuleRef,
        library_nid: u32,
        function_nid: u32,
    ) -> crate::Result<u32> {
        self.resolver.resolve_export(module, library_nid, function_nid)
    }

    fn resolve(&self, target: &HookTarget) -> crate::Result<u32> {
        let entry = self.resolve_entry(target).map_err(unresolved)?;

        if entry & !1 == 0 {
            tracing::warn!("{target:?} resolved to a null entry");
            return Err(Error::InvalidTarget);
        }
        Ok(entry)
    }

    fn resolve_entry(&self, target: &HookTarget) -> crate::Result<u32> {
        let entry = match target {
            HookTarget::Export {
                module,
                library_nid,
                function_nid,
            } => self
                .resolver
                .resolve_export(module, *library_nid, *function_nid)?,
            HookTarget::Import {
                module,
                library_nid,
                function_nid,
            } => self
                .resolver
                .resolve_import(module, *library_nid, *function_nid)?,
            HookTarget::Offset {
                module,
                segment,
                offset,
                thumb,
            } => self.resolver.resolve_offset(*module, *segment, *offset)? | u32::from(*thumb),
            HookTarget::Absolute(address) => *address,
        };
        Ok(entry)
    }

    /// Builds the stub for a first hook at `entry` and patches the entry.
    fn patch_entry(
        &self,
        state: &mut State,
        entry: u32,
        target: HookTarget,
    ) -> crate::Result<Patch> {
        let address = entry & !1;
        let thumb = entry & 1;
        let resume = address.checked_add(PATCH_SIZE).ok_or(Error::InvalidTarget)? | thumb;

        if let Some(hooked) = state
            .patches
            .keys()
            .copied()
            .find(|other| ranges_overlap(*other, PATCH_SIZE, address, PATCH_SIZE))
        {
            return Err(Error::PatchExists { address: hooked });
        }

        let mut original = [0; PATCH_SIZE as usize];
        self.memory.read(address, &mut original)?;

        let entry_site = match self.registry.lookup_handle(address) {
            Some((_, tr)) if tr.callback.is_some() => {
                return Err(Error::PatchExists { address });
            }
            Some((id, tr)) => {
                tracing::debug!("hooking {entry:#010x} over {tr:?}");
                EntrySite {
                    encoding: tr.call_site.encoding,
                    shadowed: Some((id, tr.target)),
                }
            }
            None if thumb != 0 && splits_thumb_instruction(&original) => {
                tracing::warn!("{entry:#010x} has a 32-bit instruction across its patch window");
                return Err(Error::InvalidTarget);
            }
            None => EntrySite {
                encoding: if thumb != 0 {
                    Encoding::Narrow
                } else {
                    Encoding::Wide
                },
                shadowed: None,
            },
        };
        let encoding = entry_site.encoding;

        let stub = state.stubs.alloc()?;
        let chain = Arc::new(HookChain::default());

        let mut installed = SmallVec::<[TrampolineId; 3]>::new();
        let res = self.build_stub(
            stub,
            address,
            thumb,
            resume,
            &entry_site,
            &original,
            &chain,
            target,
            &mut installed,
        );

        match res {
            Ok((entry_jumper, stub_trampolines)) => {
                self.cache.invalidate(stub.base, stub.used_len());
                self.cache.invalidate(address, PATCH_SIZE);

                tracing::debug!("patched {entry:#010x} through stub at {:#010x}", stub.base);
                Ok(Patch {
                    encoding,
                    original,
                    stub,
                    chain,
                    entry_jumper,
                    stub_trampolines,
                })
            }
            Err(err) => {
                for id in installed {
                    self.registry.remove(id).ok();
                }
                // Nothing can have trapped into a stub that was never patched in.
                state.stubs.free(stub);
                Err(err)
            }
        }
    }

    /// Writes the stub and the entry patch. Returns the entry jumper and the
    /// stub's own trampolines; everything registered so far is also recorded
    /// in `installed` for rollback.
    ///
    /// The chain falls through to the displaced instructions, or straight to
    /// the target of the trampoline the entry jumper shadows.
    fn build_stub(
        &self,
        stub: Stub,
        address: u32,
        thumb: u32,
        resume: u32,
        entry_site: &EntrySite,
        original: &[u8],
        chain: &Arc<HookChain>,
        target: HookTarget,
        installed: &mut SmallVec<[TrampolineId; 3]>,
    ) -> crate::Result<(TrampolineId, [TrampolineId; 2])> {
        let encoding = entry_site.encoding;
        let captured_lr = match entry_site.shadowed {
            Some((_, fall_through)) => fall_through,
            None => stub.displaced() | thumb,
        };
        let return_site = stub.return_site(encoding);

        // The stub must be complete before the entry starts trapping into it.
        let handler = self.registry.install(
            Trampoline::handler(
                stub.handler_site(),
                captured_lr,
                chain_callback(chain.clone(), address),
            )
            .installed_at(target.clone()),
        )?;
        installed.push(handler);

        let return_jumper = self.registry.install(
            Trampoline::jumper(return_site, resume).installed_at(target.clone()),
        )?;
        installed.push(return_jumper);

        self.memory
            .write(stub.base, Encoding::Wide.svc(SVC_RESUME_WITH_CALLBACK).as_slice())?;
        self.memory.write_u64(stub.back_pointer(), handler.into_raw())?;
        self.memory.write(stub.displaced(), original)?;
        self.memory
            .write(return_site.address, encoding.svc(SVC_REDIRECT).as_slice())?;

        let jumper =
            Trampoline::jumper(CallSite::new(address, encoding), stub.base).installed_at(target);
        let entry_jumper = match entry_site.shadowed {
            Some((shadowed, _)) => self.registry.install_shadowing(jumper, shadowed)?,
            None => self.registry.install(jumper)?,
        };
        installed.push(entry_jumper);

        // a shadowed trampoline's svc already traps at the entry
        if entry_site.shadowed.is_none() {
            self.memory
                .write(address, encoding.svc(SVC_REDIRECT).as_slice())?;
        }
        Ok((entry_jumper, [handler, return_jumper]))
    }

    /// Restores the original entry and retires its stub.
    ///
    /// Only the entry jumper goes away here, so threads already inside the
    /// stub still find their way back out. Removing it uncovers a trampoline
    /// it shadowed, whose `svc` is part of the restored bytes.
    fn unpatch_entry(&self, state: &mut State, address: u32, patch: Patch) -> crate::Result<()> {
        let res = self.memory.write(address, &patch.original);
        self.cache.invalidate(address, PATCH_SIZE);

        let entry_jumper = self.registry.remove(patch.entry_jumper).ok();
        state
            .stubs
            .retire(patch.stub, entry_jumper, patch.stub_trampolines);

        tracing::debug!(
            "unpatched {address:#010x} ({:?}), stub at {:#010x} retired",
            patch.encoding,
            patch.stub.base
        );
        res
    }
}

impl fmt::Debug for HookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HookManager")
            .field("registry", &self.registry)
            .field("patches", &state.patches.len())
            .field("hooks", &state.hooks.len())
            .field("retired_stubs", &state.stubs.retired())
            .finish_non_exhaustive()
    }
}

fn chain_callback(chain: Arc<HookChain>, entry: u32) -> TrampolineCallback {
    Arc::new(
        move |ctx: &mut dyn ExecutionContext, memory: &dyn GuestMemory, original: u32| {
            chain.dispatch(ctx, memory, original, entry)
        },
    )
}

/// Hooks report targets that don't resolve the same way, loaded or not.
fn unresolved(err: Error) -> Error {
    match err {
        Error::InvalidModule => Error::InvalidTarget,
        err => err,
    }
}

/// Whether the first 4 bytes of a Thumb entry end halfway through a 32-bit
/// instruction.
fn splits_thumb_instruction(window: &[u8; PATCH_SIZE as usize]) -> bool {
    let is_wide = |halfword: u16| halfword >= 0xE800;
    let [a, b, c, d] = *window;
    !is_wide(u16::from_le_bytes([a, b])) && is_wide(u16::from_le_bytes([c, d]))
}

fn ranges_overlap(a: u32, a_len: u32, b: u32, b_len: u32) -> bool {
    let (a, b) = (u64::from(a), u64::from(b));
    a < b + u64::from(b_len) && b < a + u64::from(a_len)
}
