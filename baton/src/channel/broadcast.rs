//! Global-broadcast strategy: one mutex over the whole ring, two broadcast
//! condvars.
//!
//! Both cursors, every occupancy flag and every slot body are guarded by the
//! single `gate` mutex, and the condition is only ever published under it, so
//! a signal cannot slip between a waiter's check and its wait. That makes a
//! retry loop unnecessary: each wait is single-shot. After waking, the waiter
//! re-checks its slot exactly once, and a slot that still has the wrong state
//! is a hard [`TransportError::ProtocolViolation`] rather than a reason to
//! wait again. With one producer and one consumer no third party can undo a
//! published transition, so stale state after a wake means the choreography
//! itself was broken.
//!
//! Wakeups are broadcast, and each side broadcasts its condvar on the
//! violation path as well as the success path, so a peer blocked on state
//! this side will never change is released to fail loudly instead of
//! hanging.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;

use super::{
    INIT_TIMEOUT, PhantomUnsync, ReadyFlag, RecvHalf, Region, SendHalf, Timeout, TransportError,
    arc_in_place,
};
use crate::record::Record;
use crate::ring::{CapacityCheck, Ring};
use crate::shm::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmPath};
use crate::sync::{ShmCondvar, ShmMutex, SyncError};
use crate::trace::{debug, warn};

/// Shared state of a global-broadcast channel.
#[repr(C)]
pub struct BroadcastState<const W: usize, const N: usize> {
    ready: ReadyFlag,
    gate: ShmMutex,
    nonfull: ShmCondvar,
    nonempty: ShmCondvar,
    ring: Ring<W, N>,
}

// SAFETY: the pthread primitives are process-shared and everything else is
// only touched under the gate mutex.
unsafe impl<const W: usize, const N: usize> Send for BroadcastState<W, N> {}
unsafe impl<const W: usize, const N: usize> Sync for BroadcastState<W, N> {}

// SAFETY: repr(C) aggregate of SharedMemorySafe fields, no pointers.
unsafe impl<const W: usize, const N: usize> SharedMemorySafe for BroadcastState<W, N> {}

impl<const W: usize, const N: usize> BroadcastState<W, N> {
    const MAGIC: u64 = 0x4243_5354_494E_4954; // "BCSTINIT"

    fn init_shared(uninit: &mut MaybeUninit<Self>) -> Result<(), SyncError> {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: each field is initialized exactly once in place inside
        // the allocation the caller handed over exclusively.
        unsafe {
            (&raw mut (*ptr).ready).write(ReadyFlag::new());
            ShmMutex::init_at(&raw mut (*ptr).gate)?;
            ShmCondvar::init_at(&raw mut (*ptr).nonfull)?;
            ShmCondvar::init_at(&raw mut (*ptr).nonempty)?;
            (&raw mut (*ptr).ring).write(Ring::new());
            (*ptr).ready.publish(Self::MAGIC);
        }
        Ok(())
    }

    /// Producer path: lock, wait out occupancy at most once, commit,
    /// broadcast, unlock.
    fn produce(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        let mut guard = self.gate.lock()?;
        // SAFETY: sole producer (endpoint ownership); the cursor cell is
        // producer-owned.
        let index = unsafe { self.ring.next_produce_slot() };
        // SAFETY: the gate mutex is held at every flag check.
        if unsafe { self.ring.is_filled(index) } {
            guard = match timeout {
                Timeout::Infinite => self.nonfull.wait(guard)?,
                Timeout::Duration(bound) => {
                    let (guard, expired) = self.nonfull.wait_timeout(guard, bound)?;
                    if expired {
                        return Err(TransportError::TimedOut);
                    }
                    guard
                }
            };
            // SAFETY: the wait re-acquired the gate mutex.
            if unsafe { self.ring.is_filled(index) } {
                warn!(slot = index, "slot still occupied after a wake");
                let _ = self.nonempty.broadcast();
                drop(guard);
                return Err(TransportError::ProtocolViolation("no room after waiting"));
            }
        }
        // SAFETY: sole producer, gate mutex held, index from
        // next_produce_slot.
        let committed = unsafe { self.ring.commit_produce(index, record) };
        self.nonempty.broadcast()?;
        drop(guard);
        committed?;
        Ok(())
    }

    /// Consumer path, the mirror image of [`BroadcastState::produce`].
    fn consume(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        let mut guard = self.gate.lock()?;
        // SAFETY: sole consumer; the cursor cell is consumer-owned.
        let index = unsafe { self.ring.next_consume_slot() };
        // SAFETY: the gate mutex is held at every flag check.
        if unsafe { self.ring.is_vacant(index) } {
            guard = match timeout {
                Timeout::Infinite => self.nonempty.wait(guard)?,
                Timeout::Duration(bound) => {
                    let (guard, expired) = self.nonempty.wait_timeout(guard, bound)?;
                    if expired {
                        return Err(TransportError::TimedOut);
                    }
                    guard
                }
            };
            // SAFETY: the wait re-acquired the gate mutex.
            if unsafe { self.ring.is_vacant(index) } {
                warn!(slot = index, "slot still vacant after a wake");
                let _ = self.nonfull.broadcast();
                drop(guard);
                return Err(TransportError::ProtocolViolation("nothing after waiting"));
            }
        }
        // SAFETY: sole consumer, gate mutex held, index from
        // next_consume_slot.
        let drained = unsafe { self.ring.commit_consume(index) };
        self.nonfull.broadcast()?;
        drop(guard);
        Ok(drained?)
    }
}

/// Sending half. `Send` but not `Sync`; single-producer by ownership.
pub struct BroadcastSender<const W: usize, const N: usize, R: Region<BroadcastState<W, N>>> {
    state: R,
    _unsync: PhantomUnsync,
}

/// Receiving half. `Send` but not `Sync`; single-consumer by ownership.
pub struct BroadcastReceiver<const W: usize, const N: usize, R: Region<BroadcastState<W, N>>> {
    state: R,
    _unsync: PhantomUnsync,
}

/// Heap-backed sender, as produced by [`pair`].
pub type HeapBroadcastSender<const W: usize, const N: usize> =
    BroadcastSender<W, N, Arc<BroadcastState<W, N>>>;

/// Heap-backed receiver, as produced by [`pair`].
pub type HeapBroadcastReceiver<const W: usize, const N: usize> =
    BroadcastReceiver<W, N, Arc<BroadcastState<W, N>>>;

/// Creates an in-process channel pair backed by one heap allocation.
pub fn pair<const W: usize, const N: usize>()
-> Result<(HeapBroadcastSender<W, N>, HeapBroadcastReceiver<W, N>), TransportError> {
    let () = CapacityCheck::<N>::OK;
    let state = arc_in_place(BroadcastState::<W, N>::init_shared)?;
    debug!(capacity = N, "created global-broadcast channel");
    Ok((
        BroadcastSender {
            state: Arc::clone(&state),
            _unsync: PhantomData,
        },
        BroadcastReceiver {
            state,
            _unsync: PhantomData,
        },
    ))
}

impl<const W: usize, const N: usize> BroadcastSender<W, N, Shm<BroadcastState<W, N>, Creator>> {
    /// Creates the backing region and returns the sending half.
    ///
    /// The region's name is unlinked when this endpoint drops.
    pub fn create(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::create(path, BroadcastState::<W, N>::init_shared)?;
        debug!(path = %state.path(), capacity = N, "created global-broadcast region");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

impl<const W: usize, const N: usize> BroadcastSender<W, N, Shm<BroadcastState<W, N>, Opener>> {
    /// Opens an existing region and returns the sending half.
    pub fn open(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::<BroadcastState<W, N>, Opener>::open(path)?;
        wait_ready(&state)?;
        debug!(path = %state.path(), "opened global-broadcast region (sender)");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

impl<const W: usize, const N: usize> BroadcastReceiver<W, N, Shm<BroadcastState<W, N>, Creator>> {
    /// Creates the backing region and returns the receiving half.
    pub fn create(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::create(path, BroadcastState::<W, N>::init_shared)?;
        debug!(path = %state.path(), capacity = N, "created global-broadcast region");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

impl<const W: usize, const N: usize> BroadcastReceiver<W, N, Shm<BroadcastState<W, N>, Opener>> {
    /// Opens an existing region and returns the receiving half.
    pub fn open(path: ShmPath) -> Result<Self, TransportError> {
        let () = CapacityCheck::<N>::OK;
        let state = Shm::<BroadcastState<W, N>, Opener>::open(path)?;
        wait_ready(&state)?;
        debug!(path = %state.path(), "opened global-broadcast region (receiver)");
        Ok(Self {
            state,
            _unsync: PhantomData,
        })
    }
}

fn wait_ready<const W: usize, const N: usize>(
    state: &Shm<BroadcastState<W, N>, Opener>,
) -> Result<(), TransportError> {
    // SAFETY: the mapping outlives the wait; only the ready header is read.
    let proof = unsafe {
        ReadyFlag::wait(
            &raw const (*state).ready,
            BroadcastState::<W, N>::MAGIC,
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

impl<const W: usize, const N: usize, R: Region<BroadcastState<W, N>>> BroadcastSender<W, N, R> {
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

impl<const W: usize, const N: usize, R: Region<BroadcastState<W, N>>> SendHalf<W>
    for BroadcastSender<W, N, R>
{
    fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        BroadcastSender::send_deadline(self, record, timeout)
    }

    fn produced(&self) -> u64 {
        BroadcastSender::produced(self)
    }
}

impl<const W: usize, const N: usize, R: Region<BroadcastState<W, N>>> BroadcastReceiver<W, N, R> {
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

impl<const W: usize, const N: usize, R: Region<BroadcastState<W, N>>> RecvHalf<W>
    for BroadcastReceiver<W, N, R>
{
    fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        BroadcastReceiver::receive_deadline(self, timeout)
    }

    fn consumed(&self) -> u64 {
        BroadcastReceiver::consumed(self)
    }
}
