//! Bitmap slot allocator

use super::id::{SlotId, CONTROL_SLOT};
use crate::control::protocol::{ENTRY_RECORD_LEN, MAX_PAYLOAD_SIZE};
use crate::error::{Error, Result};
use tracing::{debug, trace};

const WORD_BITS: usize = u64::BITS as usize;

/// Largest supported capacity: the table listing (a `u32` count followed
/// by one record per slot) has to fit in a single control frame.
pub const MAX_CAPACITY: usize = (MAX_PAYLOAD_SIZE as usize - 4) / ENTRY_RECORD_LEN;

/// Fixed-capacity allocator over slots `[0, capacity)`
///
/// Always hands out the lowest free slot. The allocator itself is not
/// synchronized; the mapping table keeps it behind its own lock so that
/// allocation and record publication happen as one step.
#[derive(Debug)]
pub struct SlotAllocator {
    /// One bit per slot, set when allocated
    bitmap: Vec<u64>,
    /// Total number of slots including the control slot
    capacity: usize,
    /// Lowest word index that may still contain a clear bit
    cursor: usize,
    /// Currently allocated slots (control slot excluded)
    allocated: usize,
    peak: usize,
    allocations: u64,
    frees: u64,
}

impl SlotAllocator {
    /// Create a new slot allocator
    ///
    /// # Arguments
    /// * `capacity` - Number of slots including the reserved control slot,
    ///   in `2..=MAX_CAPACITY`
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(Error::Config(format!(
                "slot capacity must be at least 2, got {}",
                capacity
            )));
        }
        if capacity > MAX_CAPACITY {
            return Err(Error::Config(format!(
                "slot capacity {} exceeds {}",
                capacity, MAX_CAPACITY
            )));
        }

        let words = capacity.div_ceil(WORD_BITS);
        let mut bitmap = vec![0u64; words];

        // Bits past the end can never be handed out
        let tail = capacity % WORD_BITS;
        if tail != 0 {
            bitmap[words - 1] = !0u64 << tail;
        }
        bitmap[0] |= 1;

        debug!(capacity, words, "Initialized slot allocator");

        Ok(Self {
            bitmap,
            capacity,
            cursor: 0,
            allocated: 0,
            peak: 0,
            allocations: 0,
            frees: 0,
        })
    }

    /// Allocate the lowest free slot
    pub fn allocate(&mut self) -> Result<SlotId> {
        for word_idx in self.cursor..self.bitmap.len() {
            let word = self.bitmap[word_idx];
            if word == u64::MAX {
                continue;
            }

            let bit = (!word).trailing_zeros() as usize;
            self.bitmap[word_idx] = word | (1u64 << bit);
            self.cursor = word_idx;
            self.allocated += 1;
            self.peak = self.peak.max(self.allocated);
            self.allocations += 1;

            let slot = SlotId::new((word_idx * WORD_BITS + bit) as u32);
            trace!(%slot, "Allocated slot");
            return Ok(slot);
        }

        self.cursor = self.bitmap.len();
        Err(Error::Exhausted {
            capacity: self.capacity - 1,
        })
    }

    /// Return a slot to the free pool
    ///
    /// # Panics
    /// Freeing the control slot, an out-of-range slot or a slot that is not
    /// allocated is a bookkeeping bug in the caller and panics.
    pub fn free(&mut self, slot: SlotId) {
        assert!(!slot.is_control(), "attempt to free the control slot");
        assert!(
            slot.index() < self.capacity,
            "attempt to free {} beyond capacity {}",
            slot,
            self.capacity
        );

        let (word_idx, mask) = Self::position(slot);
        assert!(
            self.bitmap[word_idx] & mask != 0,
            "attempt to free unallocated {}",
            slot
        );

        self.bitmap[word_idx] &= !mask;
        self.cursor = self.cursor.min(word_idx);
        self.allocated -= 1;
        self.frees += 1;
        trace!(%slot, "Freed slot");
    }

    /// Whether `slot` is currently handed out (always true for the control slot)
    pub fn is_allocated(&self, slot: SlotId) -> bool {
        if slot.index() >= self.capacity {
            return false;
        }
        let (word_idx, mask) = Self::position(slot);
        self.bitmap[word_idx] & mask != 0
    }

    /// Total slots, control slot included
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots handed out, control slot excluded
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Slots still available
    pub fn free_count(&self) -> usize {
        self.capacity - 1 - self.allocated
    }

    /// Get statistics about the allocator
    pub fn stats(&self) -> SlotStats {
        SlotStats {
            capacity: self.capacity,
            allocated: self.allocated,
            free: self.free_count(),
            peak: self.peak,
            allocations: self.allocations,
            frees: self.frees,
        }
    }

    fn position(slot: SlotId) -> (usize, u64) {
        let idx = slot.index();
        (idx / WORD_BITS, 1u64 << (idx % WORD_BITS))
    }
}

/// Statistics for the slot allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SlotStats {
    pub capacity: usize,
    pub allocated: usize,
    pub free: usize,
    pub peak: usize,
    pub allocations: u64,
    pub frees: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_basic() -> Result<()> {
        let mut slots = SlotAllocator::new(8)?;

        assert_eq!(slots.allocate()?, SlotId::new(1));
        assert_eq!(slots.allocate()?, SlotId::new(2));
        assert!(slots.is_allocated(CONTROL_SLOT));
        assert_eq!(slots.allocated(), 2);
        assert_eq!(slots.free_count(), 5);
        Ok(())
    }

    #[test]
    fn test_allocator_reuse_lowest() -> Result<()> {
        let mut slots = SlotAllocator::new(200)?;

        let allocated: Vec<SlotId> = (0..150).map(|_| slots.allocate()).collect::<Result<_>>()?;
        assert_eq!(allocated.last(), Some(&SlotId::new(150)));

        slots.free(SlotId::new(3));
        slots.free(SlotId::new(100));

        // Freed slots come back lowest first
        assert_eq!(slots.allocate()?, SlotId::new(3));
        assert_eq!(slots.allocate()?, SlotId::new(100));
        assert_eq!(slots.allocate()?, SlotId::new(151));
        Ok(())
    }

    #[test]
    fn test_allocator_exhaustion() -> Result<()> {
        let mut slots = SlotAllocator::new(66)?;

        for expected in 1..66 {
            assert_eq!(slots.allocate()?, SlotId::new(expected));
        }

        match slots.allocate() {
            Err(Error::Exhausted { capacity }) => assert_eq!(capacity, 65),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(slots.free_count(), 0);

        // Exhaustion is not sticky
        slots.free(SlotId::new(64));
        assert_eq!(slots.allocate()?, SlotId::new(64));
        Ok(())
    }

    #[test]
    fn test_allocator_conservation() -> Result<()> {
        let mut slots = SlotAllocator::new(100)?;
        let mut held = Vec::new();

        for round in 0..300usize {
            if round % 3 == 2 {
                if let Some(slot) = held.pop() {
                    slots.free(slot);
                }
            } else if let Ok(slot) = slots.allocate() {
                held.push(slot);
            }
            assert_eq!(slots.allocated() + slots.free_count(), slots.capacity() - 1);
            assert_eq!(slots.allocated(), held.len());
        }
        Ok(())
    }

    #[test]
    fn test_allocator_stats() -> Result<()> {
        let mut slots = SlotAllocator::new(16)?;
        let a = slots.allocate()?;
        slots.allocate()?;
        slots.free(a);

        let stats = slots.stats();
        assert_eq!(stats.capacity, 16);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.free, 14);
        assert_eq!(stats.peak, 2);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 1);
        Ok(())
    }

    #[test]
    fn test_allocator_rejects_tiny_capacity() {
        assert!(matches!(SlotAllocator::new(1), Err(Error::Config(_))));
        assert!(matches!(SlotAllocator::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_capacity_bounded_by_listing_frame() -> Result<()> {
        // Tens of thousands of slots, and the full listing still frames
        assert!(MAX_CAPACITY >= 50_000);
        assert!(4 + MAX_CAPACITY * ENTRY_RECORD_LEN <= MAX_PAYLOAD_SIZE as usize);

        let slots = SlotAllocator::new(MAX_CAPACITY)?;
        assert_eq!(slots.free_count(), MAX_CAPACITY - 1);
        assert!(matches!(
            SlotAllocator::new(MAX_CAPACITY + 1),
            Err(Error::Config(_))
        ));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "unallocated")]
    fn test_free_unallocated_panics() {
        let mut slots = SlotAllocator::new(8).unwrap();
        slots.free(SlotId::new(4));
    }

    #[test]
    #[should_panic(expected = "control slot")]
    fn test_free_control_slot_panics() {
        let mut slots = SlotAllocator::new(8).unwrap();
        slots.free(CONTROL_SLOT);
    }
}
