//! Hook stubs.
//!
//! Every hooked entry owns one stub in the stub region:
//!
//! ```text
//! +0   svc #0x53          ARM, traps into the hook chain
//! +4   .dword handler     raw TrampolineId of the stub's handler
//! +12  <displaced>        the PATCH_SIZE bytes overwritten at the entry
//! +16  svc #0x54          in the entry's encoding, jumps to entry + PATCH_SIZE
//! ```
//!
//! The entry itself is replaced by `svc #0x54`, which jumps to `+0`.

use crate::config::Config;
use crate::indices::TrampolineId;
use crate::registry::{Trampoline, TrampolineRegistry};
use crate::trap::{CallSite, Encoding};
use crate::{Error, PATCH_SIZE};
use alloc::sync::Arc;
use alloc::vec::Vec;

const BACK_POINTER: u32 = 4;
const DISPLACED: u32 = BACK_POINTER + 8;
const RETURN_JUMPER: u32 = DISPLACED + PATCH_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stub {
    pub index: u32,
    pub base: u32,
}

impl Stub {
    pub fn handler_site(self) -> CallSite {
        CallSite::new(self.base, Encoding::Wide)
    }

    pub fn back_pointer(self) -> u32 {
        self.base + BACK_POINTER
    }

    pub fn displaced(self) -> u32 {
        self.base + DISPLACED
    }

    pub fn return_site(self, encoding: Encoding) -> CallSite {
        CallSite::new(self.base + RETURN_JUMPER, encoding)
    }

    /// Bytes of the stub that hold code or data.
    pub fn used_len(self) -> u32 {
        RETURN_JUMPER + 4
    }
}

/// Hands out stubs from the stub region.
///
/// A released stub is retired: its entry jumper is gone, but the handler and
/// return jumper stay registered for threads still passing through. It becomes
/// free again in [`StubAllocator::reclaim`].
#[derive(Debug)]
pub(crate) struct StubAllocator {
    base: u32,
    stub_size: u32,
    capacity: u32,
    next: u32,
    free: Vec<u32>,
    retired: Vec<Retired>,
}

#[derive(Debug)]
struct Retired {
    stub: Stub,
    entry_jumper: Option<Arc<Trampoline>>,
    /// Handler and return jumper, still in the registry.
    stub_trampolines: [TrampolineId; 2],
}

impl Retired {
    /// Whether no trap is holding any of the stub's descriptors.
    fn is_quiescent(&self, registry: &TrampolineRegistry) -> bool {
        self.entry_jumper
            .iter()
            .all(|tr| Arc::strong_count(tr) == 1)
            && self.stub_trampolines.iter().all(|id| {
                // the registry's reference plus the one `get` just handed out
                registry
                    .get(*id)
                    .iter()
                    .all(|tr| Arc::strong_count(tr) == 2)
            })
    }
}

impl StubAllocator {
    pub fn new(config: &Config) -> Self {
        Self {
            base: config.stub_region_base,
            stub_size: config.stub_size,
            capacity: config.stub_capacity(),
            next: 0,
            free: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn alloc(&mut self) -> crate::Result<Stub> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.next < self.capacity => {
                self.next += 1;
                self.next - 1
            }
            None => return Err(Error::StubsExhausted),
        };

        Ok(self.stub(index))
    }

    /// Returns a stub that was never published.
    pub fn free(&mut self, stub: Stub) {
        self.free.push(stub.index);
    }

    pub fn retire(
        &mut self,
        stub: Stub,
        entry_jumper: Option<Arc<Trampoline>>,
        stub_trampolines: [TrampolineId; 2],
    ) {
        self.retired.push(Retired {
            stub,
            entry_jumper,
            stub_trampolines,
        });
    }

    /// Unregisters the trampolines of retired stubs no trap is using and frees
    /// those stubs. Returns how many were freed.
    ///
    /// Only sound while no guest thread is between the handler and the return
    /// jumper of a retired stub, which holds no reference the check could see.
    pub fn reclaim(&mut self, registry: &TrampolineRegistry) -> usize {
        let before = self.free.len();
        let free = &mut self.free;
        self.retired.retain(|retired| {
            if !retired.is_quiescent(registry) {
                return true;
            }
            for id in retired.stub_trampolines {
                registry.remove(id).ok();
            }
            free.push(retired.stub.index);
            false
        });
        self.free.len() - before
    }

    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    fn stub(&self, index: u32) -> Stub {
        Stub {
            index,
            base: self.base + index * self.stub_size,
        }
    }
}
