//! Guest code interception for an ARMv7 user-mode emulator.
//!
//! Translated guest code leaves the JIT through supervisor calls. This crate
//! decides what happens next: it follows trampolines that let narrow Thumb
//! call sites reach arbitrary targets, runs native hook chains installed on
//! guest function entries, forwards ordinary service calls to the host
//! implementation and keeps the exclusive monitor consistent across all of it.
#![cfg_attr(feature = "no_std", no_std)]

extern crate alloc;
extern crate core;

mod arena;
mod config;
mod context;
mod dispatcher;
mod errors;
mod guest_memory;
mod hooks;
mod indices;
mod module_table;
mod monitor;
mod registry;
mod trap;

pub use config::Config;
pub use context::{CpuState, ExecutionContext, REG_LR, REG_SP};
pub use dispatcher::{CallDispatcher, ImportInvoker, NoWatch, WatchTranslator};
pub use errors::Error;
pub use guest_memory::{GuestMemory, VecMemory};
pub use hooks::{
    CacheInvalidator, HookAction, HookHandle, HookInvocation, HookManager, InjectTarget,
    NativeHandler, NoInvalidate,
};
pub use indices::{ContextId, ModuleId, ThreadId, TrampolineId};
pub use module_table::{
    ModuleInfo, ModuleRef, ModuleResolver, ModuleTable, SegmentInfo, ANY_LIBRARY,
};
pub use monitor::{ExclusiveMonitor, Reservation};
pub use registry::{Trampoline, TrampolineCallback, TrampolineRegistry};
pub use trap::{CallSite, Encoding, HookTarget, SvcBytes, TrapCause};

pub type Result<T> = core::result::Result<T, Error>;

/// SVC immediate used by the jumper that replaces a hooked entry (or the tail
/// of a stub). Thumb can't encode a branch to an arbitrary address in a single
/// 16-bit instruction, so the jump goes through the dispatcher instead.
pub const SVC_REDIRECT: u32 = 0x54;

/// SVC immediate placed at the start of every hook stub. The word following
/// the instruction holds the raw [`TrampolineId`] of the stub's handler.
pub const SVC_RESUME_WITH_CALLBACK: u32 = 0x53;

/// Offset from the trap return address to the NID word of an import stub
/// (`svc #0; bx lr; .word nid`).
pub const SERVICE_NID_OFFSET: u32 = 4;

/// Offset from the trap return address to the trampoline back-pointer of a
/// hook stub.
pub const HANDLER_BACK_POINTER_OFFSET: u32 = 0;

/***************** Settings *******************************************/
/// Number of bytes overwritten at a hooked entry. Always a whole wide
/// instruction so the displaced bytes can be replayed from the stub.
pub const PATCH_SIZE: u32 = 4;
/// Size of one hook stub in the stub region.
pub const DEFAULT_STUB_SIZE: u32 = 32;
/// Guest address of the region hook stubs are carved from.
pub const DEFAULT_STUB_REGION_BASE: u32 = 0xE000_0000;
/// Size of the stub region, 256 stubs by default.
pub const DEFAULT_STUB_REGION_SIZE: u32 = 0x2000;
