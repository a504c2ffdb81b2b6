use crate::guest_memory::GuestMemory;
use crate::Error;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use spin::RwLock;

/// A flat, heap backed window of guest memory at a fixed base address.
///
/// Everything outside `base..base + len` is unmapped.
pub struct VecMemory {
    base: u32,
    bytes: RwLock<Vec<u8>>,
}

impl VecMemory {
    pub fn new_zeroed(base: u32, len: usize) -> Self {
        Self {
            base,
            bytes: RwLock::new(vec![0; len]),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(&self, address: u32, len: usize, mapped: usize) -> crate::Result<Range<usize>> {
        let oob = || Error::MemoryOutOfBounds { address, len };

        let start = address
            .checked_sub(self.base)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(oob)?;
        let end = start.checked_add(len).ok_or_else(oob)?;

        if end > mapped {
            return Err(oob());
        }

        Ok(start..end)
    }
}

impl GuestMemory for VecMemory {
    fn read(&self, address: u32, buf: &mut [u8]) -> crate::Result<()> {
        let bytes = self.bytes.read();
        let range = self.range(address, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> crate::Result<()> {
        let mut bytes = self.bytes.write();
        let range = self.range(address, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for VecMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VecMemory")
            .field("base", &format_args!("{:#010x}", self.base))
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
