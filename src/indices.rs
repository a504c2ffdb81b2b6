use cranelift_entity::entity_impl;
use wasmtime_slab::Id;

/// Identifies an execution context, i.e. one emulated processor. Exclusive
/// reservations are owned by contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);
entity_impl!(ContextId);

/// Kernel id of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);
entity_impl!(ThreadId);

/// Kernel id of a loaded guest module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);
entity_impl!(ModuleId);

/// Handle to a descriptor in a [`TrampolineRegistry`](crate::TrampolineRegistry).
///
/// Slab slots are reused after removal, so the handle also carries the
/// generation the slot had when the descriptor was installed. A handle whose
/// generation no longer matches resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrampolineId {
    pub(crate) slot: Id,
    pub(crate) generation: u32,
}

impl TrampolineId {
    /// The 64-bit form written into guest memory as a stub back-pointer.
    pub fn into_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.slot.into_raw())
    }

    /// Rebuilds a handle from [`TrampolineId::into_raw`].
    ///
    /// Returns `None` for values no slab could have produced. Other garbage
    /// yields a handle that simply doesn't resolve.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let [s0, s1, s2, s3, g0, g1, g2, g3] = raw.to_le_bytes();
        let slot = u32::from_le_bytes([s0, s1, s2, s3]);
        if slot == u32::MAX {
            return None;
        }

        Some(Self {
            slot: Id::from_raw(slot),
            generation: u32::from_le_bytes([g0, g1, g2, g3]),
        })
    }
}
