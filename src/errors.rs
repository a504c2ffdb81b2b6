/// Guest-visible taiHEN status codes.
pub const TAI_ERROR_SYSTEM: u32 = 0x9001_0000;
pub const TAI_ERROR_MEMORY: u32 = 0x9001_0001;
pub const TAI_ERROR_NOT_FOUND: u32 = 0x9001_0002;
pub const TAI_ERROR_INVALID_ARGS: u32 = 0x9001_0003;
pub const TAI_ERROR_PATCH_EXISTS: u32 = 0x9001_0005;
pub const TAI_ERROR_HOOK_ERROR: u32 = 0x9001_0006;
pub const TAI_ERROR_INVALID_MODULE: u32 = 0x9001_000B;

#[derive(onlyerror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An active trampoline already claims this call site.
    #[error("call site {call_site:#010x} already has a trampoline")]
    AddressConflict { call_site: u32 },
    /// No trampoline matches a redirect or handler trap.
    ///
    /// This means the guest code or the registry is corrupt; the trapping
    /// context must not continue.
    #[error("no trampoline for trap at {pc:#010x}")]
    TrampolineNotFound { pc: u32 },
    /// A hook or inject target could not be resolved to a guest address.
    #[error("hook target could not be resolved")]
    InvalidTarget,
    /// The handler is already the head of the chain at this entry, or an
    /// inject would overwrite a live hook patch.
    #[error("patch already exists at {address:#010x}")]
    PatchExists { address: u32 },
    /// The handle was already released.
    #[error("stale or unknown handle")]
    NotFound,
    /// A segment index outside the module's segment table.
    #[error("module has no segment {segment}")]
    InvalidSegment { segment: u32 },
    /// The module is not currently loaded.
    #[error("module is not loaded")]
    InvalidModule,
    /// A guest memory access outside of the accessible range.
    #[error("guest access of {len} bytes at {address:#010x} is out of bounds")]
    MemoryOutOfBounds { address: u32, len: usize },
    /// Every stub in the stub region is in use or still retired.
    #[error("hook stub region exhausted")]
    StubsExhausted,
}

impl Error {
    /// The status code reported to guest code calling the taiHEN API.
    pub fn code(&self) -> u32 {
        match self {
            Error::AddressConflict { .. } | Error::TrampolineNotFound { .. } => {
                TAI_ERROR_HOOK_ERROR
            }
            Error::InvalidTarget => TAI_ERROR_NOT_FOUND,
            Error::PatchExists { .. } => TAI_ERROR_PATCH_EXISTS,
            Error::NotFound => TAI_ERROR_NOT_FOUND,
            Error::InvalidSegment { .. } => TAI_ERROR_INVALID_ARGS,
            Error::InvalidModule => TAI_ERROR_INVALID_MODULE,
            Error::MemoryOutOfBounds { .. } => TAI_ERROR_MEMORY,
            Error::StubsExhausted => TAI_ERROR_SYSTEM,
        }
    }
}
