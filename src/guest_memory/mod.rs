mod vec;

pub use vec::VecMemory;

/// Byte access to the guest address space.
///
/// Implemented by the memory model. Accesses may be arbitrarily aligned and
/// all multi-byte helpers are little-endian, like the guest.
pub trait GuestMemory: Send + Sync {
    /// Fills `buf` from guest memory starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryOutOfBounds`](crate::Error::MemoryOutOfBounds) if
    /// any part of the range isn't mapped.
    fn read(&self, address: u32, buf: &mut [u8]) -> crate::Result<()>;

    /// Copies `data` into guest memory starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemoryOutOfBounds`](crate::Error::MemoryOutOfBounds) if
    /// any part of the range isn't mapped.
    fn write(&self, address: u32, data: &[u8]) -> crate::Result<()>;

    /// # Errors
    ///
    /// See [`GuestMemory::read`].
    fn read_u16(&self, address: u32) -> crate::Result<u16> {
        let mut buf = [0; 2];
        self.read(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// # Errors
    ///
    /// See [`GuestMemory::read`].
    fn read_u32(&self, address: u32) -> crate::Result<u32> {
        let mut buf = [0; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// # Errors
    ///
    /// See [`GuestMemory::read`].
    fn read_u64(&self, address: u32) -> crate::Result<u64> {
        let mut buf = [0; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// # Errors
    ///
    /// See [`GuestMemory::write`].
    fn write_u32(&self, address: u32, value: u32) -> crate::Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// # Errors
    ///
    /// See [`GuestMemory::write`].
    fn write_u64(&self, address: u32, value: u64) -> crate::Result<()> {
        self.write(address, &value.to_le_bytes())
    }
}
