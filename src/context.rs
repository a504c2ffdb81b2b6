use crate::indices::{ContextId, ThreadId};

pub const REG_SP: usize = 13;
pub const REG_LR: usize = 14;

/// The register state of one guest thread, as seen from a trap.
///
/// Implemented by the CPU core. Program counter values follow `BX` semantics:
/// bit 0 of a value passed to [`ExecutionContext::set_pc`] selects Thumb state.
pub trait ExecutionContext {
    /// The emulated processor this thread currently runs on.
    fn context_id(&self) -> ContextId;
    fn thread_id(&self) -> ThreadId;

    /// Reads general purpose register `r{index}`, `index < 15`.
    fn reg(&self, index: usize) -> u32;
    fn set_reg(&mut self, index: usize, value: u32);

    /// The current program counter, with bit 0 set in Thumb state.
    fn pc(&self) -> u32;
    fn set_pc(&mut self, pc: u32);

    fn lr(&self) -> u32 {
        self.reg(REG_LR)
    }
}

/// A plain register file implementing [`ExecutionContext`], for cores that
/// don't keep their own and for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    context: ContextId,
    thread: ThreadId,
    regs: [u32; 15],
    pc: u32,
    thumb: bool,
}

impl CpuState {
    pub fn new(context: ContextId, thread: ThreadId) -> Self {
        Self {
            context,
            thread,
            regs: [0; 15],
            pc: 0,
            thumb: false,
        }
    }

    pub fn is_thumb(&self) -> bool {
        self.thumb
    }
}

impl ExecutionContext for CpuState {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn thread_id(&self) -> ThreadId {
        self.thread
    }

    fn reg(&self, index: usize) -> u32 {
        self.regs[index]
    }

    fn set_reg(&mut self, index: usize, value: u32) {
        self.regs[index] = value;
    }

    fn pc(&self) -> u32 {
        self.pc | u32::from(self.thumb)
    }

    fn set_pc(&mut self, pc: u32) {
        self.thumb = pc & 1 != 0;
        self.pc = pc & !1;
    }
}
