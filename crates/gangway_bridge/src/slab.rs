use crate::error::{bridge_error, BridgeError, BridgeErrorKind};

/// Integer token exchanged with the guest in place of a host value.
///
/// The low bit discriminates the two reference spaces: odd handles index the
/// call-local value stack, even handles index the long-lived slab. The slot
/// index is the raw value shifted right by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

impl Handle {
    pub(crate) fn slab(index: usize) -> Self {
        Self((index as u32) << 1)
    }

    pub(crate) fn stack(index: usize) -> Self {
        Self(((index as u32) << 1) | 1)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u32 {
        self.0
    }

    pub(crate) fn is_stack(self) -> bool {
        self.0 & 1 == 1
    }

    pub(crate) fn index(self) -> usize {
        (self.0 >> 1) as usize
    }
}

/// A host value referenced by the guest through a [`Handle`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Absent,
}

#[derive(Debug, Clone)]
enum Slot {
    Occupied { value: HostValue, refs: u32 },
    Vacant { next_free: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub live: usize,
    pub free: usize,
    pub capacity: usize,
}

/// Reference-counted table of host values with a free list threaded through
/// vacant slots. `free_head == slots.len()` means the free list is empty.
/// The slab never shrinks; recycled slots are reused head-first.
#[derive(Debug, Default)]
pub struct HeapSlab {
    slots: Vec<Slot>,
    free_head: usize,
}

impl HeapSlab {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: 0,
        }
    }

    /// Stores `value` with a reference count of one and returns its handle.
    pub fn insert(&mut self, value: HostValue) -> Handle {
        let index = self.free_head;
        if index == self.slots.len() {
            self.slots.push(Slot::Occupied { value, refs: 1 });
            self.free_head = self.slots.len();
        } else {
            let next_free = match self.slots[index] {
                Slot::Vacant { next_free } => next_free,
                // The free head always points at a vacant slot; an occupied
                // head means the list was corrupted, so fall back to append.
                Slot::Occupied { .. } => {
                    debug_assert!(false, "free head points at an occupied slot");
                    self.slots.push(Slot::Occupied { value, refs: 1 });
                    self.free_head = self.slots.len();
                    return Handle::slab(self.slots.len() - 1);
                }
            };
            self.slots[index] = Slot::Occupied { value, refs: 1 };
            self.free_head = next_free;
        }
        Handle::slab(index)
    }

    pub fn get(&self, index: usize) -> Result<&HostValue, BridgeError> {
        match self.slots.get(index) {
            Some(Slot::Occupied { value, .. }) => Ok(value),
            _ => Err(invalid_handle(index)),
        }
    }

    /// Increments the reference count of an occupied slot.
    pub fn retain(&mut self, index: usize) -> Result<(), BridgeError> {
        match self.slots.get_mut(index) {
            Some(Slot::Occupied { refs, .. }) => {
                *refs += 1;
                Ok(())
            }
            _ => Err(invalid_handle(index)),
        }
    }

    /// Decrements the reference count; at zero the slot is overwritten with
    /// the current free-list head and becomes the new head. Returns whether
    /// the slot was recycled.
    pub fn release(&mut self, index: usize) -> Result<bool, BridgeError> {
        match self.slots.get_mut(index) {
            Some(Slot::Occupied { refs, .. }) => {
                *refs -= 1;
                if *refs > 0 {
                    return Ok(false);
                }
                self.slots[index] = Slot::Vacant {
                    next_free: self.free_head,
                };
                self.free_head = index;
                Ok(true)
            }
            _ => Err(invalid_handle(index)),
        }
    }

    pub fn stats(&self) -> SlabStats {
        let live = self
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied { .. }))
            .count();
        SlabStats {
            live,
            free: self.slots.len() - live,
            capacity: self.slots.len(),
        }
    }

    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.free_head;
        while cursor != self.slots.len() {
            len += 1;
            match self.slots[cursor] {
                Slot::Vacant { next_free } => cursor = next_free,
                Slot::Occupied { .. } => panic!("free list walked into an occupied slot"),
            }
        }
        len
    }

    #[cfg(test)]
    fn ref_count(&self, index: usize) -> u32 {
        match self.slots[index] {
            Slot::Occupied { refs, .. } => refs,
            Slot::Vacant { .. } => 0,
        }
    }
}

fn invalid_handle(index: usize) -> BridgeError {
    bridge_error(
        BridgeErrorKind::GuestTrap,
        format!("guest passed a handle to slot {index}, which is not live"),
    )
}
