use crate::traits::backend::BufferToken;

/// Where a pool slot currently lives.
///
/// ```text
/// Free → Acquired → Queued → Filled → Free
///                      ↑        │
///                      └────────┘ (capture resubmits in place)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// In the pool, available to `acquire`.
    Free,
    /// Checked out by the owning engine, not yet handed to hardware.
    Acquired,
    /// Lent to hardware. The pool holds no bytes for it.
    Queued,
    /// Returned by hardware, payload not yet consumed.
    Filled,
}

/// Occupancy per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub acquired: usize,
    pub queued: usize,
    pub filled: usize,
}

/// A completion carried a token that does not match a queued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleToken(pub BufferToken);

/// A buffer checked out of the pool.
///
/// Move-only: it goes back through [`BufferPool::submit`] or
/// [`BufferPool::release`].
#[derive(Debug)]
pub struct PoolBuffer {
    slot: u32,
    data: Vec<u8>,
}

impl PoolBuffer {
    /// Replace the contents with `payload`, reusing the allocation.
    pub fn fill(&mut self, payload: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(payload);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

#[derive(Debug)]
struct Slot {
    state: BufferState,
    generation: u32,
    storage: Option<Vec<u8>>,
    filled: usize,
}

/// Arena of byte buffers addressed by stable slot index.
///
/// Not internally synchronized: each engine keeps its pool behind one mutex
/// and is the only owner. Bytes of a queued buffer are owned by the device,
/// never by the pool, so the pool cannot touch memory the hardware is using.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    buffer_capacity: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Fixed pool of `count` zeroed buffers of `capacity` bytes.
    pub fn with_buffers(count: usize, capacity: usize) -> Self {
        let slots = (0..count)
            .map(|_| Slot {
                state: BufferState::Free,
                generation: 0,
                storage: Some(vec![0u8; capacity]),
                filled: 0,
            })
            .collect();
        Self {
            slots,
            free: (0..count as u32).rev().collect(),
            buffer_capacity: capacity,
            max_buffers: count,
        }
    }

    /// Empty pool that allocates slots on demand, up to `max_buffers`.
    pub fn growable(max_buffers: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buffer_capacity: 0,
            max_buffers,
        }
    }

    /// Check out a free buffer, growing the pool if it is below its limit.
    ///
    /// `None` means every buffer is in use: the caller drops, it never waits.
    pub fn acquire(&mut self) -> Option<PoolBuffer> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => self.grow()?,
        };
        Some(self.check_out(slot))
    }

    /// Like [`acquire`](Self::acquire), preferring a free buffer whose
    /// allocation already holds `len` bytes.
    pub fn acquire_for(&mut self, len: usize) -> Option<PoolBuffer> {
        let fits = self.free.iter().rposition(|&slot| {
            self.slots[slot as usize]
                .storage
                .as_ref()
                .is_some_and(|s| s.capacity() >= len)
        });
        let slot = match fits {
            Some(pos) => self.free.swap_remove(pos),
            None => match self.free.pop() {
                Some(slot) => slot,
                None => self.grow()?,
            },
        };
        Some(self.check_out(slot))
    }

    /// Hand a checked-out buffer to hardware: Acquired → Queued.
    ///
    /// Returns the token for this lending and the bytes to pass to the device.
    pub fn submit(&mut self, buffer: PoolBuffer) -> (BufferToken, Vec<u8>) {
        let slot = &mut self.slots[buffer.slot as usize];
        debug_assert_eq!(slot.state, BufferState::Acquired);
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = BufferState::Queued;
        slot.filled = 0;
        (BufferToken::new(buffer.slot, slot.generation), buffer.data)
    }

    /// Return an unsubmitted buffer: Acquired → Free.
    pub fn release(&mut self, buffer: PoolBuffer) {
        let slot = &mut self.slots[buffer.slot as usize];
        debug_assert_eq!(slot.state, BufferState::Acquired);
        slot.state = BufferState::Free;
        slot.storage = Some(buffer.data);
        self.free.push(buffer.slot);
    }

    /// Hardware finished with a buffer: Queued → Filled.
    pub fn complete(
        &mut self,
        token: BufferToken,
        storage: Vec<u8>,
        bytes: usize,
    ) -> Result<(), StaleToken> {
        let slot = self.queued_slot(token)?;
        slot.filled = bytes.min(storage.len());
        slot.storage = Some(storage);
        slot.state = BufferState::Filled;
        Ok(())
    }

    /// The payload of a filled buffer.
    pub fn filled(&self, token: BufferToken) -> Option<&[u8]> {
        let slot = self.slots.get(token.slot() as usize)?;
        if slot.state != BufferState::Filled || slot.generation != token.generation() {
            return None;
        }
        slot.storage.as_deref().map(|s| &s[..slot.filled])
    }

    /// Lend a filled buffer to hardware again: Filled → Queued.
    pub fn requeue(&mut self, token: BufferToken) -> Option<(BufferToken, Vec<u8>)> {
        let slot = self.slots.get_mut(token.slot() as usize)?;
        if slot.state != BufferState::Filled || slot.generation != token.generation() {
            return None;
        }
        let mut storage = slot.storage.take()?;
        storage.resize(self.buffer_capacity.max(storage.len()), 0);
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = BufferState::Queued;
        slot.filled = 0;
        Some((BufferToken::new(token.slot(), slot.generation), storage))
    }

    /// Payload consumed: Filled → Free. Returns false for unknown tokens.
    pub fn release_filled(&mut self, token: BufferToken) -> bool {
        let Some(slot) = self.slots.get_mut(token.slot() as usize) else {
            return false;
        };
        if slot.state != BufferState::Filled || slot.generation != token.generation() {
            return false;
        }
        slot.state = BufferState::Free;
        slot.filled = 0;
        self.free.push(token.slot());
        true
    }

    /// Take back a buffer the device refused: Queued → Free.
    pub fn reclaim(&mut self, token: BufferToken, storage: Vec<u8>) -> bool {
        let Ok(slot) = self.queued_slot(token) else {
            return false;
        };
        slot.storage = Some(storage);
        slot.state = BufferState::Free;
        self.free.push(token.slot());
        true
    }

    /// Force every slot back to Free.
    ///
    /// Bytes of buffers still queued belong to the device and are replaced
    /// with fresh allocations; their generation moves on so a completion
    /// arriving afterwards is rejected as stale. Returns how many slots
    /// were not already free.
    pub fn release_all(&mut self) -> usize {
        let mut forced = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == BufferState::Free {
                continue;
            }
            forced += 1;
            if slot.state == BufferState::Queued || slot.storage.is_none() {
                slot.storage = Some(vec![0u8; self.buffer_capacity]);
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = BufferState::Free;
            slot.filled = 0;
            self.free.push(index as u32);
        }
        forced
    }

    pub fn state(&self, slot: u32) -> Option<BufferState> {
        self.slots.get(slot as usize).map(|s| s.state)
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for slot in &self.slots {
            match slot.state {
                BufferState::Free => counts.free += 1,
                BufferState::Acquired => counts.acquired += 1,
                BufferState::Queued => counts.queued += 1,
                BufferState::Filled => counts.filled += 1,
            }
        }
        counts
    }

    /// Buffers not currently free.
    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    fn grow(&mut self) -> Option<u32> {
        if self.slots.len() >= self.max_buffers {
            return None;
        }
        self.slots.push(Slot {
            state: BufferState::Free,
            generation: 0,
            storage: Some(Vec::with_capacity(self.buffer_capacity)),
            filled: 0,
        });
        Some((self.slots.len() - 1) as u32)
    }

    fn check_out(&mut self, slot: u32) -> PoolBuffer {
        let capacity = self.buffer_capacity;
        let entry = &mut self.slots[slot as usize];
        entry.state = BufferState::Acquired;
        let data = entry
            .storage
            .take()
            .unwrap_or_else(|| vec![0u8; capacity]);
        PoolBuffer { slot, data }
    }

    fn queued_slot(&mut self, token: BufferToken) -> Result<&mut Slot, StaleToken> {
        match self.slots.get_mut(token.slot() as usize) {
            Some(slot)
                if slot.state == BufferState::Queued && slot.generation == token.generation() =>
            {
                Ok(slot)
            }
            _ => Err(StaleToken(token)),
        }
    }
}
