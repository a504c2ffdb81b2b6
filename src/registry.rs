use crate::arena::GenerationalArena;
use crate::context::ExecutionContext;
use crate::guest_memory::GuestMemory;
use crate::indices::TrampolineId;
use crate::trap::{CallSite, HookTarget};
use crate::Error;
use alloc::sync::Arc;
use core::fmt;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use smallvec::{smallvec, SmallVec};
use spin::RwLock;

/// Native code run by a handler trampoline.
///
/// Receives the trapping context, guest memory and the trampoline's captured
/// link register, and returns the guest address to resume at (bit 0 selects
/// Thumb).
pub type TrampolineCallback =
    Arc<dyn Fn(&mut dyn ExecutionContext, &dyn GuestMemory, u32) -> u32 + Send + Sync>;

/// A redirection descriptor.
pub struct Trampoline {
    /// The instruction that traps into this trampoline.
    pub call_site: CallSite,
    /// Where a redirect trap continues.
    pub target: u32,
    /// Run by resume-with-callback traps instead of jumping to `target`.
    pub callback: Option<TrampolineCallback>,
    /// Return address captured when the trampoline was built.
    pub captured_lr: u32,
    /// What this trampoline was installed for, if it belongs to a hook.
    pub installed_at: Option<HookTarget>,
}

impl Trampoline {
    /// A plain jump from `call_site` to `target`.
    pub fn jumper(call_site: CallSite, target: u32) -> Self {
        Self {
            call_site,
            target,
            callback: None,
            captured_lr: 0,
            installed_at: None,
        }
    }

    /// A trampoline that hands control to `callback`.
    pub fn handler(call_site: CallSite, captured_lr: u32, callback: TrampolineCallback) -> Self {
        Self {
            call_site,
            target: captured_lr,
            callback: Some(callback),
            captured_lr,
            installed_at: None,
        }
    }

    #[must_use]
    pub fn installed_at(mut self, target: HookTarget) -> Self {
        self.installed_at = Some(target);
        self
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("call_site", &self.call_site)
            .field("target", &format_args!("{:#010x}", self.target))
            .field("captured_lr", &format_args!("{:#010x}", self.captured_lr))
            .field("has_callback", &self.callback.is_some())
            .field("installed_at", &self.installed_at)
            .finish_non_exhaustive()
    }
}

/// Owns every live trampoline, keyed by call site address.
///
/// Lookups take the read lock only long enough to clone an `Arc` out of the
/// table, so a trap never holds the lock while a callback runs. Removal
/// unpublishes a descriptor at once; the descriptor itself is freed when the
/// last in-flight trap drops its reference.
///
/// A call site address can hold a stack of trampolines, see
/// [`TrampolineRegistry::install_shadowing`]. Only the newest one is found by
/// lookups; removing it uncovers the one below.
#[derive(Default)]
pub struct TrampolineRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    trampolines: GenerationalArena<Arc<Trampoline>>,
    /// Oldest first; the last entry is the one traps reach.
    by_call_site: HashMap<u32, SmallVec<[TrampolineId; 1]>>,
}

impl Inner {
    fn get(&self, id: TrampolineId) -> Option<&Arc<Trampoline>> {
        self.trampolines.get(id.slot, id.generation)
    }

    fn active(&self, address: u32) -> Option<TrampolineId> {
        self.by_call_site.get(&address)?.last().copied()
    }

    fn lookup(&self, address: u32) -> Option<&Arc<Trampoline>> {
        self.get(self.active(address)?)
    }
}

impl TrampolineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `trampoline` under its call site address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressConflict`] if a live trampoline already claims
    /// the same call site address.
    pub fn install(&self, trampoline: Trampoline) -> crate::Result<TrampolineId> {
        let call_site = trampoline.call_site;
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let vacant = match inner.by_call_site.entry(call_site.address) {
            Entry::Occupied(_) => {
                return Err(Error::AddressConflict {
                    call_site: call_site.address,
                })
            }
            Entry::Vacant(vacant) => vacant,
        };

        let (slot, generation) = inner.trampolines.insert(Arc::new(trampoline));
        let id = TrampolineId { slot, generation };
        vacant.insert(smallvec![id]);

        tracing::debug!("installed trampoline {id:?} at {call_site}");
        Ok(id)
    }

    /// Publishes `trampoline` on top of `shadowed`, the trampoline currently
    /// at the same call site address.
    ///
    /// Traps at the address reach `trampoline` from now on. `shadowed` stays
    /// live under its handle and is found again once `trampoline` is removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressConflict`] if `shadowed` isn't the trampoline
    /// at the address any more.
    pub fn install_shadowing(
        &self,
        trampoline: Trampoline,
        shadowed: TrampolineId,
    ) -> crate::Result<TrampolineId> {
        let call_site = trampoline.call_site;
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(stack) = inner
            .by_call_site
            .get_mut(&call_site.address)
            .filter(|stack| stack.last() == Some(&shadowed))
        else {
            return Err(Error::AddressConflict {
                call_site: call_site.address,
            });
        };

        let (slot, generation) = inner.trampolines.insert(Arc::new(trampoline));
        let id = TrampolineId { slot, generation };
        stack.push(id);

        tracing::debug!("installed trampoline {id:?} at {call_site}, shadowing {shadowed:?}");
        Ok(id)
    }

    /// The live trampoline whose call site is exactly `address`.
    pub fn lookup(&self, address: u32) -> Option<Arc<Trampoline>> {
        self.inner.read().lookup(address).cloned()
    }

    /// Finds the trampoline a trap returning to `pc` came from.
    ///
    /// Tries [`CallSite::candidates`] in order. A candidate only matches a
    /// trampoline installed with the same encoding, otherwise a wide call
    /// site would be found through the narrow key of the following halfword.
    pub fn lookup_trap(&self, pc: u32) -> Option<Arc<Trampoline>> {
        let inner = self.inner.read();
        CallSite::candidates(pc).into_iter().find_map(|candidate| {
            inner
                .lookup(candidate.address)
                .filter(|tr| tr.call_site.encoding == candidate.encoding)
                .cloned()
        })
    }

    /// Like [`TrampolineRegistry::lookup`], together with the handle.
    pub fn lookup_handle(&self, address: u32) -> Option<(TrampolineId, Arc<Trampoline>)> {
        let inner = self.inner.read();
        let id = inner.active(address)?;
        inner.get(id).map(|tr| (id, tr.clone()))
    }

    /// Resolves a handle, `None` if it was removed in the meantime.
    pub fn get(&self, id: TrampolineId) -> Option<Arc<Trampoline>> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: TrampolineId) -> bool {
        self.inner.read().get(id).is_some()
    }

    /// Unpublishes a trampoline and returns the registry's reference to it.
    ///
    /// No lookup started after this returns will see the descriptor. Traps
    /// that already hold it keep it alive until they are done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is stale.
    pub fn remove(&self, id: TrampolineId) -> crate::Result<Arc<Trampoline>> {
        let mut inner = self.inner.write();
        let Some(trampoline) = inner.trampolines.remove(id.slot, id.generation) else {
            tracing::warn!("attempted to remove stale trampoline {id:?}");
            return Err(Error::NotFound);
        };

        if let Entry::Occupied(mut stack) = inner.by_call_site.entry(trampoline.call_site.address)
        {
            stack.get_mut().retain(|other| *other != id);
            if stack.get().is_empty() {
                stack.remove();
            }
        }

        tracing::debug!("removed trampoline {id:?} at {}", trampoline.call_site);
        Ok(trampoline)
    }

    pub fn len(&self) -> usize {
        self.inner.read().trampolines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TrampolineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineRegistry")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
