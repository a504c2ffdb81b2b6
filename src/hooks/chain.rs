use crate::context::ExecutionContext;
use crate::guest_memory::GuestMemory;
use alloc::sync::Arc;
use core::fmt;
use smallvec::SmallVec;
use spin::RwLock;

/// Native code run when a hooked function is entered.
pub type NativeHandler = Arc<dyn Fn(&mut HookInvocation<'_>) -> HookAction + Send + Sync>;

/// What a hook handler wants to happen after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Run the next older hook, or the original function if this was the
    /// last one.
    Continue,
    /// Return to the caller of the hooked function. The handler is expected
    /// to have placed a return value in `r0`.
    Return,
    /// Resume at the given guest address. Bit 0 selects Thumb.
    Jump(u32),
}

/// The state a [`NativeHandler`] is called with.
pub struct HookInvocation<'a> {
    /// Registers of the thread that entered the hooked function.
    pub ctx: &'a mut dyn ExecutionContext,
    pub memory: &'a dyn GuestMemory,
    /// Where the original function continues: the displaced entry
    /// instructions in the hook stub. Jumping here calls the unhooked
    /// function.
    pub original: u32,
    /// The hooked entry address.
    pub entry: u32,
}

impl fmt::Debug for HookInvocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookInvocation")
            .field("thread", &self.ctx.thread_id())
            .field("original", &format_args!("{:#010x}", self.original))
            .field("entry", &format_args!("{:#010x}", self.entry))
            .finish_non_exhaustive()
    }
}

pub(crate) struct HookLink {
    pub handler: NativeHandler,
}

/// The hooks installed at one entry, newest first.
#[derive(Default)]
pub(crate) struct HookChain {
    links: RwLock<SmallVec<[Arc<HookLink>; 2]>>,
}

impl HookChain {
    pub fn push_front(&self, link: Arc<HookLink>) {
        self.links.write().insert(0, link);
    }

    /// Whether `handler` is the newest hook in the chain.
    pub fn is_head(&self, handler: &NativeHandler) -> bool {
        self.links
            .read()
            .first()
            .is_some_and(|head| Arc::ptr_eq(&head.handler, handler))
    }

    /// Unlinks `link`, keeping the order of the rest. Returns how many links
    /// remain.
    pub fn remove(&self, link: &Arc<HookLink>) -> usize {
        let mut links = self.links.write();
        links.retain(|other| !Arc::ptr_eq(other, link));
        links.len()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    /// Runs the chain and returns the guest address to resume at.
    ///
    /// Operates on a snapshot, so handlers may install or release hooks
    /// (including their own) without deadlocking or disturbing this run.
    pub fn dispatch(
        &self,
        ctx: &mut dyn ExecutionContext,
        memory: &dyn GuestMemory,
        original: u32,
        entry: u32,
    ) -> u32 {
        let snapshot = self.links.read().clone();

        for link in snapshot {
            let mut invocation = HookInvocation {
                ctx: &mut *ctx,
                memory,
                original,
                entry,
            };
            match (link.handler)(&mut invocation) {
                HookAction::Continue => {}
                HookAction::Return => return ctx.lr(),
                HookAction::Jump(address) => return address,
            }
        }

        original
    }
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
