use crate::indices::ContextId;
use core::fmt;
use hashbrown::HashMap;
use spin::Mutex;

/// An outstanding exclusive-access claim.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub owner: ContextId,
    pub address: u32,
    pub size: u32,
}

impl Reservation {
    /// Whether `[address, address + size)` intersects the guarded range.
    /// Empty ranges intersect nothing.
    pub fn overlaps(&self, address: u32, size: u32) -> bool {
        let start = u64::from(self.address);
        let end = start + u64::from(self.size);
        let other_start = u64::from(address);
        let other_end = other_start + u64::from(size);

        start < other_end && other_start < end
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("owner", &self.owner)
            .field("address", &format_args!("{:#010x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

/// The global exclusive monitor shared by all emulated processors.
///
/// Every operation is a short critical section over one table of
/// reservations, so owners and competing processors can race freely. At most
/// one context holds a reservation over any given byte.
#[derive(Default)]
pub struct ExclusiveMonitor {
    reservations: Mutex<HashMap<ContextId, Reservation>>,
}

impl ExclusiveMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the reservation an exclusive load makes.
    ///
    /// Replaces whatever `context` held before and evicts other contexts'
    /// reservations over the same bytes.
    pub fn mark_exclusive(&self, context: ContextId, address: u32, size: u32) {
        mark(&mut self.reservations.lock(), context, address, size);
    }

    /// Checks an exclusive store against the reservation of `context`.
    ///
    /// Returns whether the store may proceed. The reservation of `context` is
    /// consumed either way. A successful check also invalidates overlapping
    /// reservations of other contexts, since their memory is about to change.
    pub fn check_and_clear_exclusive(&self, context: ContextId, address: u32, size: u32) -> bool {
        check_and_clear(&mut self.reservations.lock(), context, address, size)
    }

    /// Drops any reservation `context` holds.
    pub fn clear_exclusive(&self, context: ContextId) {
        if let Some(reservation) = self.reservations.lock().remove(&context) {
            tracing::trace!("cleared {reservation:?}");
        }
    }

    /// Invalidates every reservation over `[address, address + size)`, whoever
    /// owns it. Cores call this for ordinary stores to shared memory.
    pub fn notify_store(&self, address: u32, size: u32) {
        self.reservations
            .lock()
            .retain(|_, reservation| !reservation.overlaps(address, size));
    }

    /// Performs an exclusive load: `read` runs while the monitor is held, and
    /// the reservation is in place before any other context can store.
    pub fn read_and_mark<T>(
        &self,
        context: ContextId,
        address: u32,
        size: u32,
        read: impl FnOnce() -> T,
    ) -> T {
        let mut reservations = self.reservations.lock();
        mark(&mut reservations, context, address, size);
        read()
    }

    /// Performs an exclusive store: `write` only runs if the check succeeds,
    /// and runs before any other context can touch the monitor again.
    pub fn do_exclusive_store(
        &self,
        context: ContextId,
        address: u32,
        size: u32,
        write: impl FnOnce(),
    ) -> bool {
        let mut reservations = self.reservations.lock();
        let ok = check_and_clear(&mut reservations, context, address, size);
        if ok {
            write();
        }
        ok
    }

    /// The reservation `context` currently holds.
    pub fn reservation(&self, context: ContextId) -> Option<Reservation> {
        self.reservations.lock().get(&context).copied()
    }
}

impl fmt::Debug for ExclusiveMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExclusiveMonitor")
            .field("reservations", &self.reservations.lock().len())
            .finish_non_exhaustive()
    }
}

fn mark(
    reservations: &mut HashMap<ContextId, Reservation>,
    context: ContextId,
    address: u32,
    size: u32,
) {
    reservations.retain(|owner, reservation| {
        *owner == context || !reservation.overlaps(address, size)
    });
    reservations.insert(
        context,
        Reservation {
            owner: context,
            address,
            size,
        },
    );
}

fn check_and_clear(
    reservations: &mut HashMap<ContextId, Reservation>,
    context: ContextId,
    address: u32,
    size: u32,
) -> bool {
    let ok = reservations
        .remove(&context)
        .is_some_and(|reservation| reservation.overlaps(address, size));

    if ok {
        reservations.retain(|_, reservation| !reservation.overlaps(address, size));
    }
    ok
}
