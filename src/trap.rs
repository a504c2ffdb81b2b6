use crate::indices::ModuleId;
use crate::module_table::ModuleRef;
use crate::{SVC_REDIRECT, SVC_RESUME_WITH_CALLBACK};
use alloc::string::String;
use core::fmt;

/// Why the guest core left translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapCause {
    /// Jump through the trampoline registered for the trapping call site.
    Redirect,
    /// Run the native callback of the trampoline whose handle follows the
    /// trapping instruction.
    ResumeWithCallback,
    /// An ordinary service call; the NID follows the import stub.
    ServiceCall,
}

impl From<u32> for TrapCause {
    fn from(svc: u32) -> Self {
        match svc {
            SVC_REDIRECT => Self::Redirect,
            SVC_RESUME_WITH_CALLBACK => Self::ResumeWithCallback,
            _ => Self::ServiceCall,
        }
    }
}

/// Width of the instruction that traps at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// 16-bit Thumb.
    Narrow,
    /// 32-bit Thumb-2 or ARM.
    Wide,
}

impl Encoding {
    /// Size of the trapping instruction in bytes.
    pub const fn width(self) -> u32 {
        match self {
            Encoding::Narrow => 2,
            Encoding::Wide => 4,
        }
    }

    /// The `svc #imm` instruction in this encoding, as little-endian bytes.
    ///
    /// Narrow encodes Thumb `svc` (`0xDF00 | imm8`), wide encodes ARM `svc`
    /// with the always condition (`0xEF00_0000 | imm24`).
    pub fn svc(self, imm: u32) -> SvcBytes {
        match self {
            Encoding::Narrow => {
                let [imm8, ..] = imm.to_le_bytes();
                SvcBytes {
                    bytes: [imm8, 0xDF, 0, 0],
                    len: 2,
                }
            }
            Encoding::Wide => SvcBytes {
                bytes: (0xEF00_0000 | (imm & 0x00FF_FFFF)).to_le_bytes(),
                len: 4,
            },
        }
    }
}

/// An encoded `svc` instruction, see [`Encoding::svc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcBytes {
    bytes: [u8; 4],
    len: usize,
}

impl SvcBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// A guest call site: the address of a trapping instruction and its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub address: u32,
    pub encoding: Encoding,
}

impl CallSite {
    pub fn new(address: u32, encoding: Encoding) -> Self {
        Self {
            address: address & !1,
            encoding,
        }
    }

    /// The address the core reports once the instruction at this call site
    /// has trapped.
    pub fn trap_pc(self) -> u32 {
        self.address.wrapping_add(self.encoding.width())
    }

    /// Call sites that could have produced a trap returning to `pc`, in the
    /// order they have to be tried.
    ///
    /// The narrow candidate comes first: a 16-bit site ending at `pc` is the
    /// instruction right before it, while a wide candidate at `pc - 4` might
    /// just be the instruction before that.
    pub fn candidates(pc: u32) -> [CallSite; 2] {
        let pc = pc & !1;
        [
            CallSite::new(pc.wrapping_sub(2), Encoding::Narrow),
            CallSite::new(pc.wrapping_sub(4), Encoding::Wide),
        ]
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.encoding {
            Encoding::Narrow => "narrow",
            Encoding::Wide => "wide",
        };
        write!(f, "{:#010x} ({kind})", self.address)
    }
}

/// What a hook or injection is aimed at, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookTarget {
    /// A function exported by `module`.
    Export {
        module: ModuleRef,
        library_nid: u32,
        function_nid: u32,
    },
    /// The import stub `module` calls a function through.
    Import {
        module: ModuleRef,
        library_nid: u32,
        function_nid: u32,
    },
    /// A raw location inside a loaded segment.
    Offset {
        module: ModuleId,
        segment: u32,
        offset: u32,
        thumb: bool,
    },
    /// An already resolved guest address; bit 0 selects Thumb.
    Absolute(u32),
}

impl HookTarget {
    pub fn export(module: impl Into<String>, library_nid: u32, function_nid: u32) -> Self {
        Self::Export {
            module: ModuleRef::Named(module.into()),
            library_nid,
            function_nid,
        }
    }

    pub fn import(module: impl Into<String>, library_nid: u32, function_nid: u32) -> Self {
        Self::Import {
            module: ModuleRef::Named(module.into()),
            library_nid,
            function_nid,
        }
    }
}
