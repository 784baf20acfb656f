//! Bounded circular buffer shared by the lock-based channel strategies.
//!
//! The ring holds the slots, the per-side cursors, and the per-side delivery
//! tallies. It performs no synchronization of its own: the strategy modules
//! guard slot access with their locks and call the `unsafe` operations here
//! under documented contracts. Slots are addressed by index only; the ring is
//! one contiguous allocation and never hands out raw pointers.
//!
//! # Safety
//!
//! Every mutating operation requires the caller to uphold two invariants:
//! exactly one producer side and one consumer side exist, and the lock that
//! the active strategy assigns to a slot is held while that slot is touched.

use std::cell::UnsafeCell;
use std::marker::PhantomData;

use crate::SharedMemorySafe;
use crate::record::Record;

/// Marker: fields written only by the producing side.
pub struct ProduceSide;

/// Marker: fields written only by the consuming side.
pub struct ConsumeSide;

/// Marker: slot fields, guarded by the active strategy's locks.
pub struct SlotSide;

/// Interior-mutable cell tagged with the side that may write it.
///
/// The tag has no runtime effect; it keeps producer-owned, consumer-owned,
/// and lock-guarded state nominally distinct so a misuse shows up in the
/// types rather than in a data race.
#[repr(transparent)]
pub struct SideCell<T, Side>(UnsafeCell<T>, PhantomData<Side>);

impl<T, Side> SideCell<T, Side> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> &UnsafeCell<T> {
        &self.0
    }
}

// SAFETY: SideCell is shared between the two endpoints, but each cell is
// written only by its owning side (ProduceSide/ConsumeSide) or under the
// strategy lock covering it (SlotSide). The strategy's lock operations
// provide the ordering between a write and the other side's read.
unsafe impl<T: Send, Side> Sync for SideCell<T, Side> {}
unsafe impl<T: Send, Side> Send for SideCell<T, Side> {}

// SAFETY: a SideCell is exactly a T in memory (repr(transparent) over
// UnsafeCell) and carries no pointers or process-local handles beyond what
// T itself carries.
unsafe impl<T: SharedMemorySafe, Side: 'static> SharedMemorySafe for SideCell<T, Side> {}

/// Ring faults: a commit found the slot in the wrong occupancy state.
///
/// Under the strategy protocols these cannot fire; one firing means a
/// protocol violation (a wakeup acted on stale state, or a second producer
/// or consumer exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingFault {
    /// `commit_produce` hit a slot that is still filled.
    Occupied { index: usize },
    /// `commit_consume` hit a slot that is still vacant.
    Vacant { index: usize },
}

/// One buffer slot: an occupancy flag and the record.
///
/// Occupancy is an explicit tag. No record byte is reserved to mean
/// "empty", so any payload, including one starting with a zero byte, is
/// representable.
#[repr(C)]
pub struct Slot<const W: usize> {
    filled: SideCell<bool, SlotSide>,
    record: SideCell<Record<W>, SlotSide>,
}

impl<const W: usize> Slot<W> {
    const fn vacant() -> Self {
        Self {
            filled: SideCell::new(false),
            record: SideCell::new(Record::zeroed()),
        }
    }
}

/// Producer-side edge: cursor and tally, on its own cache line.
#[repr(C)]
#[repr(align(64))]
pub struct ProduceEdge {
    /// Index of the slot last written. Starts one before slot 0.
    cursor: SideCell<usize, ProduceSide>,
    /// Records committed so far.
    tally: SideCell<u64, ProduceSide>,
}

/// Consumer-side edge: cursor and tally, on its own cache line.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumeEdge {
    /// Index of the slot last drained. Starts one before slot 0.
    cursor: SideCell<usize, ConsumeSide>,
    /// Records drained so far.
    tally: SideCell<u64, ConsumeSide>,
}

/// The bounded buffer: two edges and `N` slots.
///
/// `W` is the record width in bytes, `N` the capacity in slots. `N` need
/// not be a power of two; wrap-around is a compare, not a mask.
#[repr(C)]
pub struct Ring<const W: usize, const N: usize> {
    produce: ProduceEdge,
    consume: ConsumeEdge,
    slots: [Slot<W>; N],
}

/// Compile-time capacity guard.
pub(crate) struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    pub(crate) const OK: () = assert!(N > 0, "channel capacity must be greater than 0");
}

impl<const W: usize, const N: usize> Ring<W, N> {
    /// All slots vacant, cursors one before slot 0.
    pub const fn new() -> Self {
        let () = CapacityCheck::<N>::OK;
        Self {
            produce: ProduceEdge {
                cursor: SideCell::new(N - 1),
                tally: SideCell::new(0),
            },
            consume: ConsumeEdge {
                cursor: SideCell::new(N - 1),
                tally: SideCell::new(0),
            },
            slots: [const { Slot::vacant() }; N],
        }
    }

    /// Capacity in slots.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Advances a cursor to the next slot index, wrapping to 0 at capacity.
    #[inline]
    const fn bump(cursor: usize) -> usize {
        let next = cursor + 1;
        if next == N { 0 } else { next }
    }

    /// Index of the slot the producer fills next.
    ///
    /// # Safety
    ///
    /// Only the single producing side may call this; it reads a
    /// producer-owned cell.
    #[inline]
    pub unsafe fn next_produce_slot(&self) -> usize {
        // SAFETY: caller is the sole producer, the cursor cell's owner.
        Self::bump(unsafe { *self.produce.cursor.get().get() })
    }

    /// Index of the slot the consumer drains next.
    ///
    /// # Safety
    ///
    /// Only the single consuming side may call this; it reads a
    /// consumer-owned cell.
    #[inline]
    pub unsafe fn next_consume_slot(&self) -> usize {
        // SAFETY: caller is the sole consumer, the cursor cell's owner.
        Self::bump(unsafe { *self.consume.cursor.get().get() })
    }

    /// Whether the slot currently holds an unconsumed record.
    ///
    /// The flag is the single source of truth for occupancy; neither
    /// predicate consults the tallies.
    ///
    /// # Safety
    ///
    /// The caller must hold the strategy lock covering `index`.
    #[inline]
    pub unsafe fn is_filled(&self, index: usize) -> bool {
        // SAFETY: the lock covering this slot is held per the caller
        // contract, so no concurrent write to the flag exists.
        unsafe { *self.slots[index].filled.get().get() }
    }

    /// Whether the slot is free for the producer.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::is_filled`].
    #[inline]
    pub unsafe fn is_vacant(&self, index: usize) -> bool {
        // SAFETY: forwarded caller contract.
        !unsafe { self.is_filled(index) }
    }

    /// Stores a record, marks the slot filled, advances the produce cursor,
    /// and bumps the produced tally.
    ///
    /// # Safety
    ///
    /// Caller must be the sole producing side and must hold the strategy
    /// lock covering `index`. `index` must come from
    /// [`Ring::next_produce_slot`].
    pub unsafe fn commit_produce(&self, index: usize, record: Record<W>) -> Result<(), RingFault> {
        // SAFETY: lock held per the caller contract.
        if unsafe { self.is_filled(index) } {
            return Err(RingFault::Occupied { index });
        }
        // SAFETY: slot cells are guarded by the held lock; cursor and tally
        // cells are producer-owned and the caller is the sole producer.
        unsafe {
            *self.slots[index].record.get().get() = record;
            *self.slots[index].filled.get().get() = true;
            *self.produce.cursor.get().get() = index;
            *self.produce.tally.get().get() += 1;
        }
        Ok(())
    }

    /// Copies the record out, marks the slot vacant, advances the consume
    /// cursor, and bumps the consumed tally.
    ///
    /// # Safety
    ///
    /// Caller must be the sole consuming side and must hold the strategy
    /// lock covering `index`. `index` must come from
    /// [`Ring::next_consume_slot`].
    pub unsafe fn commit_consume(&self, index: usize) -> Result<Record<W>, RingFault> {
        // SAFETY: lock held per the caller contract.
        if unsafe { !self.is_filled(index) } {
            return Err(RingFault::Vacant { index });
        }
        // SAFETY: as in commit_produce, with the consumer-owned cells.
        unsafe {
            let record = *self.slots[index].record.get().get();
            *self.slots[index].filled.get().get() = false;
            *self.consume.cursor.get().get() = index;
            *self.consume.tally.get().get() += 1;
            Ok(record)
        }
    }

    /// Records committed so far.
    ///
    /// # Safety
    ///
    /// Only the producing side may call this.
    #[inline]
    pub unsafe fn produced(&self) -> u64 {
        // SAFETY: producer-owned cell, caller is the producer.
        unsafe { *self.produce.tally.get().get() }
    }

    /// Records drained so far.
    ///
    /// # Safety
    ///
    /// Only the consuming side may call this.
    #[inline]
    pub unsafe fn consumed(&self) -> u64 {
        // SAFETY: consumer-owned cell, caller is the consumer.
        unsafe { *self.consume.tally.get().get() }
    }
}

impl<const W: usize, const N: usize> Default for Ring<W, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ring is a plain repr(C) aggregate of SideCells; see the SideCell
// impls for why sharing is sound under the side/lock discipline.
unsafe impl<const W: usize, const N: usize> Send for Ring<W, N> {}
unsafe impl<const W: usize, const N: usize> Sync for Ring<W, N> {}

// SAFETY: every field is SharedMemorySafe (SideCells over usize/u64/bool and
// fixed-size records); the struct is repr(C) with no pointers.
unsafe impl<const W: usize, const N: usize> SharedMemorySafe for Ring<W, N> {}

#[cfg(test)]
mod tests {
    use super::*;

    // Single-threaded tests: the side and lock contracts are trivially
    // upheld, so the unsafe calls are sound here.

    #[test]
    fn test_cursors_start_one_before_zero() {
        let ring: Ring<16, 4> = Ring::new();
        unsafe {
            assert_eq!(ring.next_produce_slot(), 0);
            assert_eq!(ring.next_consume_slot(), 0);
        }
    }

    #[test]
    fn test_bump_wraps_to_zero() {
        assert_eq!(Ring::<16, 4>::bump(2), 3);
        assert_eq!(Ring::<16, 4>::bump(3), 0);
        assert_eq!(Ring::<16, 1>::bump(0), 0);
    }

    #[test]
    fn test_commit_cycle_round_trips() {
        let ring: Ring<16, 2> = Ring::new();
        let hello = Record::from_str("hello").unwrap();
        unsafe {
            let idx = ring.next_produce_slot();
            ring.commit_produce(idx, hello).unwrap();
            assert!(ring.is_filled(idx));
            assert_eq!(ring.produced(), 1);

            let idx = ring.next_consume_slot();
            let out = ring.commit_consume(idx).unwrap();
            assert_eq!(out, hello);
            assert!(ring.is_vacant(idx));
            assert_eq!(ring.consumed(), 1);
        }
    }

    #[test]
    fn test_double_fill_is_a_fault() {
        let ring: Ring<16, 3> = Ring::new();
        let r = Record::zeroed();
        unsafe {
            ring.commit_produce(0, r).unwrap();
            assert_eq!(
                ring.commit_produce(0, r),
                Err(RingFault::Occupied { index: 0 })
            );
        }
    }

    #[test]
    fn test_drain_of_vacant_slot_is_a_fault() {
        let ring: Ring<16, 3> = Ring::new();
        unsafe {
            assert_eq!(ring.commit_consume(1), Err(RingFault::Vacant { index: 1 }));
        }
    }

    #[test]
    fn test_fill_capacity_then_drain_in_order() {
        let ring: Ring<16, 4> = Ring::new();
        unsafe {
            for i in 0..4u8 {
                let idx = ring.next_produce_slot();
                assert_eq!(idx, i as usize);
                ring.commit_produce(idx, Record::from_bytes([i; 16])).unwrap();
            }
            // All four filled; the next produce target has wrapped onto
            // slot 0, which is still occupied.
            let idx = ring.next_produce_slot();
            assert_eq!(idx, 0);
            assert!(ring.is_filled(idx));

            for i in 0..4u8 {
                let idx = ring.next_consume_slot();
                let rec = ring.commit_consume(idx).unwrap();
                assert_eq!(rec.as_bytes()[0], i);
            }
            assert_eq!(ring.produced(), 4);
            assert_eq!(ring.consumed(), 4);
        }
    }

    #[test]
    fn test_capacity_one_alternates() {
        let ring: Ring<16, 1> = Ring::new();
        unsafe {
            for i in 0..10u8 {
                let idx = ring.next_produce_slot();
                assert_eq!(idx, 0);
                ring.commit_produce(idx, Record::from_bytes([i; 16])).unwrap();
                assert!(ring.is_filled(0));
                let rec = ring.commit_consume(ring.next_consume_slot()).unwrap();
                assert_eq!(rec.as_bytes()[0], i);
            }
        }
    }
}
