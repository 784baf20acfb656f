//! Per-slot-lock strategy: every slot owns an independent binary lock.
//!
//! The shared state is the ring, one binary semaphore per slot in an array
//! parallel to the slots, and two parking spots: `nonfull` (the producer
//! parks there, the consumer wakes it) and `nonempty` (the reverse). Each
//! parking spot couples a condition variable with its own auxiliary mutex,
//! and that mutex publishes the signal only; slot contents are guarded
//! solely by the slot's own lock.
//!
//! Waits are retry loops. A waiter re-checks the slot's occupancy flag under
//! the slot lock after every wake, so the slot state, never the wakeup, is
//! authoritative. Because the auxiliary mutex does not guard the flag, a
//! wake published between a waiter's check and its park would be lost; every
//! park is therefore bounded by a short re-check interval, which turns that
//! race into at most a [`PARK_SLICE`] delay instead of a stall.
//!
//! Signals wake at most one parked peer. That is only sound with exactly
//! one producer and one consumer, which endpoint ownership enforces; more
//! parties on either side would need broadcast wakeups.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use super::{
    INIT_TIMEOUT, PhantomUnsync, ReadyFlag, RecvHalf, Region, SendHalf, Timeout, TransportError,
    arc_in_place, deadline_from,
};
use crate::record::Record;
use crate::ring::{CapacityCheck, Ring};
use crate::shm::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};
use crate::sync::{ShmCondvar, ShmMutex, ShmSemaphore, SyncError};
use crate::trace::{debug, trace};

/// Upper bound on one park: the re-check interval of the wait loops.
const PARK_SLICE: Duration = Duration::from_millis(50);

/// A parking spot: the mutex publishes the signal, nothing else.
#[repr(C)]
struct WaitPoint {
    gate: ShmMutex,
    signal: ShmCondvar,
}

impl WaitPoint {
    /// # Safety
    ///
    /// `slot` must be valid for writes and not yet initialized.
    unsafe fn init_at(slot: *mut Self) -> Result<(), SyncError> {
        // SAFETY: field projections of a valid allocation.
        unsafe {
            ShmMutex::init_at(&raw mut (*slot).gate)?;
            ShmCondvar::init_at(&raw mut (*slot).signal)?;
        }
        Ok(())
    }

    /// Parks for at most `bound`. A wake is a hint; the caller re-checks
    /// its condition either way.
    fn park(&self, bound: Duration) -> Result<(), SyncError> {
        let guard = self.gate.lock()?;
        let (_guard, _expired) = self.signal.wait_timeout(guard, bound)?;
        Ok(())
    }

    /// Wakes at most one parked peer.
    fn wake_one(&self) -> Result<(), SyncError> {
        let _guard = self.gate.lock()?;
        self.signal.signal()
    }
}

/// Shared state of a per-slot-lock channel.
///
/// `repr(C)` and self-contained, so the same struct lives on the heap for
/// threads or in a shared memory region for processes.
#[repr(C)]
pub struct SlottedState<const W: usize, const N: usize> {
    ready: ReadyFlag,
    locks: [ShmSemaphore; N],
    nonfull: WaitPoint,
    nonempty: WaitPoint,
    ring: Ring<W, N>,
}

// SAFETY: every field is built for concurrent cross-mapping access; the
// pthread primitives are process-shared and the ring follows the side/lock
// discipline.
unsafe impl<const W: usize, const N: usize> Send for SlottedState<W, N> {}
unsafe impl<const W: usize, const N: usize> Sync for SlottedState<W, N> {}

// SAFETY: repr(C) aggregate of SharedMemorySafe fields, no pointers.
unsafe impl<const W: usize, const N: usize> SharedMemorySafe for SlottedState<W, N> {}

impl<const W: usize, const N: usize> SlottedState<W, N> {
    const MAGIC: u64 = 0x534C_4F54_494E_4954; // "SLOTINIT"

    /// Initializes the state at its final address; the readiness publish is
    /// the final write, after which peers may start using the channel.
    fn init_shared(uninit: &mut MaybeUninit<Self>) -> Result<(), SyncError> {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: each field is initialized exactly once in place inside
        // the allocation the caller handed over exclusively.
        unsafe {
            (&raw mut (*ptr).ready).write(ReadyFlag::new());
            for index in 0..N {
                // Initial count 1: every slot lock starts released.
                ShmSemaphore::init_at(&raw mut (*ptr).locks[index], 1)?;
            }
            WaitPoint::init_at(&raw mut (*ptr).nonfull)?;
            WaitPoint::init_at(&raw mut (*ptr).nonempty)?;
            (&raw mut (*ptr).ring).write(Ring::new());
            (*ptr).ready.publish(Self::MAGIC);
        }
        Ok(())
    }

    /// Producer path: take the target slot's lock, wait out occupancy,
    /// commit, release, wake the consumer.
    fn produce(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        let deadline = deadline_from(timeout);
        // SAFETY: sole producer (endpoint ownership); the cursor cell is
        // producer-owned.
        let index = unsafe { self.ring.next_produce_slot() };
        let lock = &self.locks[index];
        lock.acquire()?;
        // SAFETY: the slot lock is held at every flag check and re-check.
        while unsafe { self.ring.is_filled(index) } {
            lock.release()?;
            let Some(bound) = park_bound(deadline) else {
                return Err(TransportError::TimedOut);
            };
            trace!(slot = index, "slot occupied; parking");
            self.nonfull.park(bound)?;
            lock.acquire()?;
        }
        // SAFETY: sole producer, slot lock held, index from
        // next_produce_slot.
        let committed = unsafe { self.ring.commit_produce(index, record) };
        lock.release()?;
        committed?;
        self.nonempty.wake_one()?;
        Ok(())
    }

    /// Consumer path, the mirror image of [`SlottedState::produce`].
    fn consume(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        let deadline = deadline_from(timeout);
        // SAFETY: sole consumer; the cursor cell is consumer-owned.
        let index = unsafe { self.ring.next_consume_slot() };
        let lock = &self.locks[index];
        lock.acquire()?;
        // SAFETY: the slot lock is held at every flag check and re-check.
        while unsafe { self.ring.is_vacant(index) } {
            lock.release()?;
            let Some(bound) = park_bound(deadline) else {
                return Err(TransportError::TimedOut);
            };
            trace!(slot = index, "slot vacant; parking");
            self.nonempty.park(bound)?;
            lock.acquire()?;
        }
        // SAFETY: sole consumer, slot lock held, index from
        // next_consume_slot.
        let drained = unsafe { self.ring.commit_consume(index) };
        lock.release()?;
        let record = drained?;
        self.nonfull.wake_one()?;
        Ok(record)
    }
}

/// Bound for one park: the re-check interval, clipped to the deadline.
/// `None` when the deadline has already passed.
fn park_bound(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(PARK_SLICE),
        Some(dl) => {
            let now = Instant::now();
            if now >= dl {
                None
            } else {
                Some(PARK_SLICE.min(dl - now))
            }
        }
    }
}

/// Sending half. `Send` but not `Sync`; single-producer by ownership.
pub struct SlottedSender<const W: usize, const N: usize, R: Region<SlottedState<W, N>>> {
    state: R,
    _unsync: PhantomUnsync,
}

/// Receiving half. `Send` but not `Sync`; single-consumer by ownership.
pub struct SlottedReceiver<const W: usize, const N: usize, R: Region<SlottedState<W, N>>> {
    state: R,
    _unsync: PhantomUnsync,
}

/// Heap-backed sender, as produced by [`pair`].
pub type HeapSlottedSender<const W: usize, const N: usize> =
    SlottedSender<W, N, Arc<SlottedState<W, N>>>;

/// Heap-backed receiver, as produced by [`pair`].
pub type HeapSlottedReceiver<const W: usize, const N: usize> =
    SlottedReceiver<W, N, Arc<SlottedState<W, N>>>;

/// Creates an in-process channel pair backed by one heap allocation.
pub fn pair<const W: usize, const N: usize>()
-> Result<(HeapSlottedSender<W, N>, HeapSlottedReceiver<W, N>), TransportError> {
    let () = CapacityCheck::<N>::OK;
    let state = arc_in_place(SlottedState::<W, N>::init_shared)?;
    debug!(capacity = N, "created per-slot-lock channel");
    Ok((
        SlottedSender {
            state: Arc::clone(&state),
            _unsync: PhantomData,
        },
        SlottedReceiver {
            state,
            _unsync: PhantomData,
        },
    ))
}

impl<const W: usize, const N: usize> SlottedSender<W, N, Shm<SlottedState<W, N>, Creator>> {
    /// Creates the backing region and returns the sending half.
    ///
    /// The region's name is unlinked when this endpoint drops.
    pub fn create(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::create(path, SlottedState::<W, N>::init_shared)?;
        debug!(path = %state.path(), capacity = N, "created per-slot-lock region");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

impl<const W: usize, const N: usize> SlottedSender<W, N, Shm<SlottedState<W, N>, Opener>> {
    /// Opens an existing region and returns the sending half.
    ///
    /// Waits up to one second for the creator to publish readiness; a region
    /// holding a different strategy's state never becomes ready here.
    pub fn open(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::<SlottedState<W, N>, Opener>::open(path)?;
        wait_ready(&state)?;
        debug!(path = %state.path(), "opened per-slot-lock region (sender)");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

impl<const W: usize, const N: usize> SlottedReceiver<W, N, Shm<SlottedState<W, N>, Creator>> {
    /// Creates the backing region and returns the receiving half.
    pub fn create(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::create(path, SlottedState::<W, N>::init_shared)?;
        debug!(path = %state.path(), capacity = N, "created per-slot-lock region");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

impl<const W: usize, const N: usize> SlottedReceiver<W, N, Shm<SlottedState<W, N>, Opener>> {
    /// Opens an existing region and returns the receiving half.
    pub fn open(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::<SlottedState<W, N>, Opener>::open(path)?;
        wait_ready(&state)?;
        debug!(path = %state.path(), "opened per-slot-lock region (receiver)");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

fn wait_ready<const W: usize, const N: usize>(
    state: &Shm<SlottedState<W, N>, Opener>,
) -> Result<(), TransportError> {
    // SAFETY: the mapping outlives the wait; only the ready header is read.
    let proof = unsafe {
        ReadyFlag::wait(
            &raw const (*state).ready,
            SlottedState::<W, N>::MAGIC,
            INIT_TIMEOUT,
        )
    };
    if proof.is_none() {
        return Err(ShmError::InitTimeout {
            path: state.path().as_str().to_string(),
        }
        .into());
    }
    Ok(())
}

impl<const W: usize, const N: usize, R: Region<SlottedState<W, N>>> SlottedSender<W, N, R> {
    /// Delivers one record, blocking while the target slot is occupied.
    pub fn send(&self, record: Record<W>) -> Result<(), TransportError> {
        self.state.produce(record, Timeout::Infinite)
    }

    /// Delivers one record within the deadline.
    pub fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        self.state.produce(record, timeout)
    }

    /// Records committed by this sender.
    pub fn produced(&self) -> u64 {
        // SAFETY: this endpoint is the sole producer and owns the tally.
        unsafe { self.state.ring.produced() }
    }
}

impl<const W: usize, const N: usize, R: Region<SlottedState<W, N>>> SendHalf<W>
    for SlottedSender<W, N, R>
{
    fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        SlottedSender::send_deadline(self, record, timeout)
    }

    fn produced(&self) -> u64 {
        SlottedSender::produced(self)
    }
}

impl<const W: usize, const N: usize, R: Region<SlottedState<W, N>>> SlottedReceiver<W, N, R> {
    /// Takes the next record, blocking while the target slot is vacant.
    pub fn receive(&self) -> Result<Record<W>, TransportError> {
        self.state.consume(Timeout::Infinite)
    }

    /// Takes the next record within the deadline.
    pub fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        self.state.consume(timeout)
    }

    /// Records drained by this receiver.
    pub fn consumed(&self) -> u64 {
        // SAFETY: this endpoint is the sole consumer and owns the tally.
        unsafe { self.state.ring.consumed() }
    }
}

impl<const W: usize, const N: usize, R: Region<SlottedState<W, N>>> RecvHalf<W>
    for SlottedReceiver<W, N, R>
{
    fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        SlottedReceiver::receive_deadline(self, timeout)
    }

    fn consumed(&self) -> u64 {
        SlottedReceiver::consumed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn short() -> Timeout {
        Timeout::Duration(Duration::from_millis(30))
    }

    #[test]
    fn test_round_trip_and_tallies() {
        let (tx, rx) = pair::<16, 4>().unwrap();
        tx.send(Record::from_str("Alpha").unwrap()).unwrap();
        tx.send(Record::from_str("Bravo").unwrap()).unwrap();
        assert_eq!(rx.receive().unwrap().text().unwrap(), "Alpha");
        assert_eq!(rx.receive().unwrap().text().unwrap(), "Bravo");
        assert_eq!(tx.produced(), 2);
        assert_eq!(rx.consumed(), 2);
    }

    #[test]
    fn test_full_channel_times_out_until_drained() {
        let (tx, rx) = pair::<16, 4>().unwrap();
        for i in 0..4u8 {
            tx.send(Record::from_bytes([i; 16])).unwrap();
        }
        assert!(matches!(
            tx.send_deadline(Record::zeroed(), short()),
            Err(TransportError::TimedOut)
        ));
        assert_eq!(rx.receive().unwrap().as_bytes()[0], 0);
        tx.send_deadline(Record::from_bytes([4; 16]), short())
            .unwrap();
        for i in 1..5u8 {
            assert_eq!(rx.receive().unwrap().as_bytes()[0], i);
        }
    }

    #[test]
    fn test_empty_channel_times_out() {
        let (_tx, rx) = pair::<16, 4>().unwrap();
        assert!(matches!(
            rx.receive_deadline(short()),
            Err(TransportError::TimedOut)
        ));
        assert_eq!(rx.consumed(), 0);
    }

    #[test]
    fn test_blocked_receiver_wakes_on_send() {
        let (tx, rx) = pair::<16, 4>().unwrap();
        let waiter = thread::spawn(move || rx.receive());
        thread::sleep(Duration::from_millis(50));
        tx.send(Record::from_str("Alpha").unwrap()).unwrap();
        let record = waiter.join().unwrap().unwrap();
        assert_eq!(record.text().unwrap(), "Alpha");
    }

    #[test]
    fn test_blocked_sender_wakes_on_receive() {
        let (tx, rx) = pair::<16, 2>().unwrap();
        tx.send(Record::from_bytes([0; 16])).unwrap();
        tx.send(Record::from_bytes([1; 16])).unwrap();
        let sender = thread::spawn(move || {
            tx.send(Record::from_bytes([2; 16]))?;
            Ok::<_, TransportError>(tx.produced())
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.receive().unwrap().as_bytes()[0], 0);
        assert_eq!(sender.join().unwrap().unwrap(), 3);
        assert_eq!(rx.receive().unwrap().as_bytes()[0], 1);
        assert_eq!(rx.receive().unwrap().as_bytes()[0], 2);
    }

    #[test]
    fn test_capacity_one_alternates_strictly() {
        let (tx, rx) = pair::<16, 1>().unwrap();
        for i in 0..10u8 {
            tx.send(Record::from_bytes([i; 16])).unwrap();
            // The single slot is now occupied; another send must wait.
            assert!(matches!(
                tx.send_deadline(Record::zeroed(), short()),
                Err(TransportError::TimedOut)
            ));
            assert_eq!(rx.receive().unwrap().as_bytes()[0], i);
        }
    }

    #[test]
    fn test_threaded_fifo_order() {
        let (tx, rx) = pair::<16, 4>().unwrap();
        let producer = thread::spawn(move || {
            for i in 0..100u8 {
                tx.send(Record::from_bytes([i; 16])).unwrap();
            }
        });
        for i in 0..100u8 {
            assert_eq!(rx.receive().unwrap().as_bytes()[0], i);
        }
        producer.join().unwrap();
        assert_eq!(rx.consumed(), 100);
    }

    #[test]
    fn test_shm_backed_round_trip() {
        let path = ShmPath::new(format!("/baton-slotted-{}", std::process::id())).unwrap();
        let tx = match SlottedSender::<16, 4, _>::create(path.clone()) {
            Ok(tx) => tx,
            Err(TransportError::Shm(ShmError::PosixError { source, .. }))
                if source == rustix::io::Errno::ACCESS =>
            {
                eprintln!("Skipping test_shm_backed_round_trip: no shm access");
                return;
            }
            Err(err) => panic!("create failed: {err}"),
        };
        let rx = SlottedReceiver::<16, 4, _>::open(path).unwrap();
        tx.send(Record::from_str("Alpha").unwrap()).unwrap();
        assert_eq!(rx.receive().unwrap().text().unwrap(), "Alpha");
        assert_eq!(tx.produced(), 1);
        assert_eq!(rx.consumed(), 1);
    }

    #[test]
    fn test_shm_name_gone_after_creator_drops() {
        let path = ShmPath::new(format!("/baton-slotted-gone-{}", std::process::id())).unwrap();
        match SlottedSender::<16, 2, _>::create(path.clone()) {
            Ok(tx) => drop(tx),
            Err(TransportError::Shm(ShmError::PosixError { source, .. }))
                if source == rustix::io::Errno::ACCESS =>
            {
                eprintln!("Skipping test_shm_name_gone_after_creator_drops: no shm access");
                return;
            }
            Err(err) => panic!("create failed: {err}"),
        }
        assert!(matches!(
            SlottedReceiver::<16, 2, _>::open(path),
            Err(TransportError::Shm(ShmError::PosixError { source, .. }))
                if source == rustix::io::Errno::NOENT
        ));
    }
}
