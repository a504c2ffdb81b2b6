use crate::{DEFAULT_STUB_REGION_BASE, DEFAULT_STUB_REGION_SIZE, DEFAULT_STUB_SIZE, PATCH_SIZE};

/// Runtime settings of a [`HookManager`](crate::HookManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Guest address of the region hook stubs are carved from. Must be mapped
    /// and executable in the guest.
    pub stub_region_base: u32,
    pub stub_region_size: u32,
    /// Bytes reserved per stub.
    pub stub_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stub_region_base: DEFAULT_STUB_REGION_BASE,
            stub_region_size: DEFAULT_STUB_REGION_SIZE,
            stub_size: DEFAULT_STUB_SIZE,
        }
    }
}

impl Config {
    /// Smallest stub able to hold the handler svc, the back-pointer, the
    /// displaced entry bytes and the return jumper.
    pub const MIN_STUB_SIZE: u32 = 4 + 8 + PATCH_SIZE + 4;

    /// Number of stubs that fit the region. Zero if `stub_size` is too small.
    ///
    /// A region running past the end of the address space is cut off there.
    pub fn stub_capacity(&self) -> u32 {
        if self.stub_size < Self::MIN_STUB_SIZE {
            return 0;
        }
        let room = (1_u64 << 32) - u64::from(self.stub_region_base);
        let usable = u64::from(self.stub_region_size).min(room);
        u32::try_from(usable / u64::from(self.stub_size)).unwrap_or(0)
    }
}
