//! Fixed-capacity slot arena with per-slot generations.

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Arena<T, N> {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot {
                generation: 0,
                value: None,
            }),
        }
    }

    pub(crate) fn get(&self, slot: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(slot as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, slot: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(slot as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_mut())
    }

    pub(crate) fn is_vacant(&self, slot: u32) -> bool {
        self.slots
            .get(slot as usize)
            .is_some_and(|s| s.value.is_none())
    }

    /// Lowest vacant slot.
    pub(crate) fn vacant_slot(&self) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| s.value.is_none())
            .map(|idx| idx as u32)
    }

    pub(crate) fn vacant_count(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_none()).count()
    }

    /// Occupies a vacant slot and returns the generation the value was
    /// issued under.
    pub(crate) fn insert_at(&mut self, slot: u32, value: T) -> Option<u32> {
        let entry = self.slots.get_mut(slot as usize)?;
        if entry.value.is_some() {
            return None;
        }
        entry.generation = entry.generation.wrapping_add(1);
        entry.value = Some(value);
        Some(entry.generation)
    }

    pub(crate) fn remove(&mut self, slot: u32, generation: u32) -> Option<T> {
        self.slots
            .get_mut(slot as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.take())
    }

    /// Occupied slots as `(slot, generation, value)`, in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(idx, s)| {
            s.value
                .as_ref()
                .map(|value| (idx as u32, s.generation, value))
        })
    }

    pub(crate) fn len(&self) -> usize {
        N - self.vacant_count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
