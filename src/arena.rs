use wasmtime_slab::{Id, Slab};

/// A [`Slab`] whose handles carry the generation of the slot they were
/// allocated in, so a handle outliving its value never aliases the next
/// occupant of the slot.
pub(crate) struct GenerationalArena<T> {
    slots: Slab<Entry<T>>,
    next_generation: u32,
    /// One past the highest slot index ever allocated. `Slab::get` panics for
    /// ids beyond its storage, and handles may come from guest memory.
    high_water: u32,
}

struct Entry<T> {
    generation: u32,
    value: T,
}

impl<T> Default for GenerationalArena<T> {
    fn default() -> Self {
        Self {
            slots: Slab::new(),
            next_generation: 0,
            high_water: 0,
        }
    }
}

impl<T> GenerationalArena<T> {
    pub fn insert(&mut self, value: T) -> (Id, u32) {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let slot = self.slots.alloc(Entry { generation, value });
        self.high_water = self.high_water.max(slot.into_raw().saturating_add(1));
        (slot, generation)
    }

    pub fn get(&self, slot: Id, generation: u32) -> Option<&T> {
        if slot.into_raw() >= self.high_water {
            return None;
        }
        self.slots
            .get(slot)
            .filter(|entry| entry.generation == generation)
            .map(|entry| &entry.value)
    }

    pub fn remove(&mut self, slot: Id, generation: u32) -> Option<T> {
        self.get(slot, generation)?;
        Some(self.slots.dealloc(slot).value)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
