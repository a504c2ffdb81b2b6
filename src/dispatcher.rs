use crate::context::ExecutionContext;
use crate::guest_memory::GuestMemory;
use crate::indices::{ThreadId, TrampolineId};
use crate::monitor::ExclusiveMonitor;
use crate::registry::TrampolineRegistry;
use crate::trap::TrapCause;
use crate::{Error, HANDLER_BACK_POINTER_OFFSET, SERVICE_NID_OFFSET};
use alloc::sync::Arc;
use core::fmt;

/// Runs the host implementation of a service call.
pub trait ImportInvoker: Send + Sync {
    fn invoke(&self, ctx: &mut dyn ExecutionContext, nid: u32, thread: ThreadId);
}

impl<F> ImportInvoker for F
where
    F: Fn(&mut dyn ExecutionContext, u32, ThreadId) + Send + Sync,
{
    fn invoke(&self, ctx: &mut dyn ExecutionContext, nid: u32, thread: ThreadId) {
        self(ctx, nid, thread);
    }
}

/// Maps guest addresses for memory watchpoints. Owned by the debugger.
pub trait WatchTranslator: Send + Sync {
    fn translate_watch_address(&self, address: u32) -> u32;
}

/// A [`WatchTranslator`] for sessions without a debugger attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWatch;

impl WatchTranslator for NoWatch {
    fn translate_watch_address(&self, address: u32) -> u32 {
        address
    }
}

/// Entry point of the CPU core into the kernel.
///
/// One dispatcher can be shared by every core; all per-trap state lives on the
/// trapping thread's stack.
pub struct CallDispatcher {
    registry: Arc<TrampolineRegistry>,
    monitor: Arc<ExclusiveMonitor>,
    memory: Arc<dyn GuestMemory>,
    invoker: Arc<dyn ImportInvoker>,
    watch: Arc<dyn WatchTranslator>,
}

impl CallDispatcher {
    pub fn new(
        registry: Arc<TrampolineRegistry>,
        monitor: Arc<ExclusiveMonitor>,
        memory: Arc<dyn GuestMemory>,
        invoker: Arc<dyn ImportInvoker>,
    ) -> Self {
        Self {
            registry,
            monitor,
            memory,
            invoker,
            watch: Arc::new(NoWatch),
        }
    }

    #[must_use]
    pub fn with_watch_translator(mut self, watch: Arc<dyn WatchTranslator>) -> Self {
        self.watch = watch;
        self
    }

    /// Handles a supervisor call.
    ///
    /// `svc` is the immediate of the trapping instruction and `pc` the address
    /// right after it. On return the context is ready to resume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrampolineNotFound`] if a trampoline trap doesn't match
    /// a live trampoline, or [`Error::MemoryOutOfBounds`] if the NID of a
    /// service call can't be read. The program counter is left alone in both
    /// cases and the caller must not resume the context.
    pub fn handle_trap(
        &self,
        ctx: &mut dyn ExecutionContext,
        svc: u32,
        pc: u32,
    ) -> crate::Result<()> {
        // Taking an exception clears the local monitor.
        self.monitor.clear_exclusive(ctx.context_id());

        let cause = TrapCause::from(svc);
        tracing::trace!("svc {svc:#x} ({cause:?}) at {pc:#010x}");

        let res = match cause {
            TrapCause::Redirect => self.redirect(ctx, pc),
            TrapCause::ResumeWithCallback => self.resume_with_callback(ctx, pc),
            TrapCause::ServiceCall => self.service_call(ctx, pc),
        };

        if let Err(err) = &res {
            tracing::error!("thread {:?}: {err}", ctx.thread_id());
        }
        res
    }

    fn redirect(&self, ctx: &mut dyn ExecutionContext, pc: u32) -> crate::Result<()> {
        let tr = self
            .registry
            .lookup_trap(pc)
            .ok_or(Error::TrampolineNotFound { pc })?;

        ctx.set_pc(tr.target);
        Ok(())
    }

    fn resume_with_callback(&self, ctx: &mut dyn ExecutionContext, pc: u32) -> crate::Result<()> {
        let not_found = Error::TrampolineNotFound { pc };

        let raw = self
            .memory
            .read_u64(pc.wrapping_add(HANDLER_BACK_POINTER_OFFSET))
            .map_err(|_| not_found.clone())?;
        let tr = TrampolineId::from_raw(raw)
            .and_then(|id| self.registry.get(id))
            .ok_or(not_found)?;

        let resume = match &tr.callback {
            Some(callback) => callback(&mut *ctx, &*self.memory, tr.captured_lr),
            None => tr.captured_lr,
        };
        ctx.set_pc(resume);
        Ok(())
    }

    fn service_call(&self, ctx: &mut dyn ExecutionContext, pc: u32) -> crate::Result<()> {
        let nid = self.memory.read_u32(pc.wrapping_add(SERVICE_NID_OFFSET))?;

        let thread = ctx.thread_id();
        self.invoker.invoke(ctx, nid, thread);
        Ok(())
    }

    /// Forwards to the debugger's watchpoint address translation.
    pub fn watch_memory_addr(&self, address: u32) -> u32 {
        self.watch.translate_watch_address(address)
    }

    pub fn exclusive_monitor(&self) -> &Arc<ExclusiveMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<TrampolineRegistry> {
        &self.registry
    }
}

impl fmt::Debug for CallDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDispatcher")
            .field("registry", &self.registry)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}
