//! Bounded single-producer single-consumer channels.
//!
//! One record type, one capacity, three interchangeable ways to move records
//! between the two endpoints:
//!
//! - [`stream`]: an OS pipe; the kernel provides blocking and backpressure.
//! - [`slotted`]: a shared ring where every slot has its own binary lock and
//!   waits park on single-wakeup condition variables.
//! - [`broadcast`]: a shared ring under one mutex with two broadcast
//!   condition variables and single-shot waits.
//!
//! [`channel`] builds an in-process pair with the strategy chosen at runtime.
//! Cross-process channels are built from the strategy modules directly:
//! each has `create`/`open` constructors taking a shared memory path.
//!
//! Endpoints are `Send` but not `Sync`. Moving an endpoint to another thread
//! is the supported way to split the two sides; sharing one is not, which is
//! how the single-producer single-consumer discipline is enforced.

pub mod broadcast;
pub mod slotted;
pub mod stream;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::SharedMemorySafe;
use crate::record::Record;
use crate::ring::RingFault;
use crate::shm::{Shm, ShmError, ShmMode};
use crate::sync::SyncError;

/// Synchronization strategy for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Records move through an OS byte stream (strategy module [`stream`]).
    DirectStream,
    /// Per-slot binary locks with single-wakeup parking ([`slotted`]).
    PerSlotLock,
    /// One mutex, broadcast wakeups, single-shot waits ([`broadcast`]).
    GlobalBroadcast,
}

/// A strategy name that matched none of the accepted spellings.
#[derive(Debug, Error)]
#[error("unknown strategy `{0}` (expected stream, slots, or broadcast)")]
pub struct UnknownStrategy(String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" | "fifo" => Ok(Self::DirectStream),
            "slots" => Ok(Self::PerSlotLock),
            "broadcast" => Ok(Self::GlobalBroadcast),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DirectStream => "stream",
            Self::PerSlotLock => "slots",
            Self::GlobalBroadcast => "broadcast",
        })
    }
}

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A stream call moved part of a record. The stream is out of frame;
    /// this is never silently retried.
    #[error("partial transfer: moved {moved} of {expected} bytes")]
    PartialTransfer { expected: usize, moved: usize },
    /// The rendezvous state contradicted the choreography, e.g. a slot
    /// still occupied after the wakeup that was supposed to clear it.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// The peer endpoint is gone. For a receiver draining a stream this is
    /// the expected terminal condition, not a failure.
    #[error("channel closed by the peer")]
    ChannelClosed,
    /// A deadline expired before the channel became ready. Buffer state is
    /// untouched; the operation may be retried.
    #[error("timed out waiting for the channel")]
    TimedOut,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Shm(#[from] ShmError),
    /// Stream-level OS failure other than the mapped conditions above.
    #[error("stream transfer failed: {0}")]
    Stream(#[from] rustix::io::Errno),
}

impl From<RingFault> for TransportError {
    fn from(fault: RingFault) -> Self {
        match fault {
            RingFault::Occupied { .. } => Self::ProtocolViolation("slot already filled at commit"),
            RingFault::Vacant { .. } => Self::ProtocolViolation("slot still vacant at commit"),
        }
    }
}

/// Sending half of a channel, any strategy.
pub trait SendHalf<const W: usize> {
    /// Delivers one record, blocking until the channel accepts it.
    fn send(&self, record: Record<W>) -> Result<(), TransportError> {
        self.send_deadline(record, Timeout::Infinite)
    }

    /// Delivers one record, giving up with [`TransportError::TimedOut`]
    /// when the deadline expires first.
    fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError>;

    /// Records this sender has delivered.
    fn produced(&self) -> u64;
}

/// Receiving half of a channel, any strategy.
pub trait RecvHalf<const W: usize> {
    /// Takes the next record, blocking until one is available.
    fn receive(&self) -> Result<Record<W>, TransportError> {
        self.receive_deadline(Timeout::Infinite)
    }

    /// Takes the next record, giving up with [`TransportError::TimedOut`]
    /// when the deadline expires first.
    fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError>;

    /// Records this receiver has taken.
    fn consumed(&self) -> u64;
}

/// Memory home of a channel's shared state.
///
/// The rendezvous structs are `repr(C)` and self-contained, so the same
/// state serves threads and processes; only where it lives differs. An
/// `Arc` hosts it on the heap, a [`Shm`] mapping hosts it in a POSIX shared
/// memory object. Endpoints are generic over this.
pub trait Region<S>: Deref<Target = S> + Send + 'static {}

impl<S: Send + Sync + 'static> Region<S> for Arc<S> {}
impl<S: SharedMemorySafe + 'static, Mode: ShmMode + 'static> Region<S> for Shm<S, Mode> {}

/// Marker type to opt-out of `Sync` while remaining `Send`.
pub(crate) type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Zero-sized proof that a region's state finished initializing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InitProof(());

/// How long an opener waits for the creator to publish readiness.
pub(crate) const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Readiness header of region-hosted channel state.
///
/// The creator's initializer stores the strategy's magic word with `Release`
/// ordering as its final write; openers spin on `Acquire` loads until they
/// see it. The magic doubles as a strategy tag, so opening a region with the
/// wrong strategy fails even when the struct sizes happen to coincide.
#[derive(SharedMemorySafe)]
#[repr(C)]
#[repr(align(64))]
pub(crate) struct ReadyFlag(AtomicU64);

impl ReadyFlag {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Marks the state ready. Must be the initializer's final write.
    pub(crate) fn publish(&self, magic: u64) {
        self.0.store(magic, Ordering::Release);
    }

    /// Spins until `magic` is published or the timeout expires.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a mapping that stays valid for the whole call.
    pub(crate) unsafe fn wait(ptr: *const Self, magic: u64, timeout: Duration) -> Option<InitProof> {
        let start = std::time::Instant::now();
        loop {
            // SAFETY: ptr is valid per the caller contract; only the atomic
            // is read, which is the one field peers may touch pre-ready.
            if unsafe { (*ptr).0.load(Ordering::Acquire) } == magic {
                return Some(InitProof(()));
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

/// Allocates channel state on the heap, initialized at its final address.
///
/// The rendezvous structs embed pthread objects, which must never move once
/// initialized; the state is built directly inside the Arc allocation.
pub(crate) fn arc_in_place<S>(
    init: impl FnOnce(&mut MaybeUninit<S>) -> Result<(), SyncError>,
) -> Result<Arc<S>, TransportError> {
    let mut cell = Arc::<S>::new_uninit();
    let slot = Arc::get_mut(&mut cell).expect("fresh Arc is uniquely owned");
    init(slot)?;
    // SAFETY: init returned Ok, so the allocation is fully initialized.
    Ok(unsafe { cell.assume_init() })
}

/// Converts a timeout into the absolute deadline blocking loops check.
pub(crate) fn deadline_from(timeout: Timeout) -> Option<Instant> {
    match timeout {
        Timeout::Infinite => None,
        Timeout::Duration(d) => Some(Instant::now() + d),
    }
}

/// Sending half with the strategy chosen at runtime.
///
/// Built by [`channel`]; heap-backed, for endpoints that stay within one
/// process. Delegates every operation to the underlying strategy endpoint.
pub enum Sender<const W: usize, const N: usize> {
    Stream(stream::StreamSender<W>),
    Slotted(slotted::HeapSlottedSender<W, N>),
    Broadcast(broadcast::HeapBroadcastSender<W, N>),
}

/// Receiving half with the strategy chosen at runtime.
pub enum Receiver<const W: usize, const N: usize> {
    Stream(stream::StreamReceiver<W>),
    Slotted(slotted::HeapSlottedReceiver<W, N>),
    Broadcast(broadcast::HeapBroadcastReceiver<W, N>),
}

impl<const W: usize, const N: usize> SendHalf<W> for Sender<W, N> {
    fn send_deadline(&self, record: Record<W>, timeout: Timeout) -> Result<(), TransportError> {
        match self {
            Self::Stream(tx) => tx.send_deadline(record, timeout),
            Self::Slotted(tx) => tx.send_deadline(record, timeout),
            Self::Broadcast(tx) => tx.send_deadline(record, timeout),
        }
    }

    fn produced(&self) -> u64 {
        match self {
            Self::Stream(tx) => tx.produced(),
            Self::Slotted(tx) => tx.produced(),
            Self::Broadcast(tx) => tx.produced(),
        }
    }
}

impl<const W: usize, const N: usize> RecvHalf<W> for Receiver<W, N> {
    fn receive_deadline(&self, timeout: Timeout) -> Result<Record<W>, TransportError> {
        match self {
            Self::Stream(rx) => rx.receive_deadline(timeout),
            Self::Slotted(rx) => rx.receive_deadline(timeout),
            Self::Broadcast(rx) => rx.receive_deadline(timeout),
        }
    }

    fn consumed(&self) -> u64 {
        match self {
            Self::Stream(rx) => rx.consumed(),
            Self::Slotted(rx) => rx.consumed(),
            Self::Broadcast(rx) => rx.consumed(),
        }
    }
}

/// Creates an in-process channel pair using the given strategy.
///
/// `W` is the record width in bytes, `N` the capacity in slots. For the
/// stream strategy `N` does not bound the records in flight; the pipe's own
/// buffering does.
///
/// # Errors
///
/// Construction can fail on OS resource exhaustion (pipe or pthread
/// initialization).
pub fn channel<const W: usize, const N: usize>(
    strategy: Strategy,
) -> Result<(Sender<W, N>, Receiver<W, N>), TransportError> {
    match strategy {
        Strategy::DirectStream => {
            let (tx, rx) = stream::pair::<W>()?;
            Ok((Sender::Stream(tx), Receiver::Stream(rx)))
        }
        Strategy::PerSlotLock => {
            let (tx, rx) = slotted::pair::<W, N>()?;
            Ok((Sender::Slotted(tx), Receiver::Slotted(rx)))
        }
        Strategy::GlobalBroadcast => {
            let (tx, rx) = broadcast::pair::<W, N>()?;
            Ok((Sender::Broadcast(tx), Receiver::Broadcast(rx)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parses_accepted_spellings() {
        assert_eq!("stream".parse::<Strategy>().unwrap(), Strategy::DirectStream);
        assert_eq!("fifo".parse::<Strategy>().unwrap(), Strategy::DirectStream);
        assert_eq!("slots".parse::<Strategy>().unwrap(), Strategy::PerSlotLock);
        assert_eq!(
            "broadcast".parse::<Strategy>().unwrap(),
            Strategy::GlobalBroadcast
        );
    }

    #[test]
    fn test_strategy_rejects_unknown_names() {
        let err = "mutex".parse::<Strategy>().unwrap_err();
        assert!(err.to_string().contains("mutex"));
    }

    #[test]
    fn test_strategy_display_round_trips() {
        for strategy in [
            Strategy::DirectStream,
            Strategy::PerSlotLock,
            Strategy::GlobalBroadcast,
        ] {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_ready_flag_sees_published_magic() {
        let flag = ReadyFlag::new();
        flag.publish(0xFEED);
        // SAFETY: the flag is a live local for the whole call.
        let proof = unsafe { ReadyFlag::wait(&raw const flag, 0xFEED, Duration::from_millis(50)) };
        assert!(proof.is_some());
    }

    #[test]
    fn test_ready_flag_rejects_wrong_magic() {
        let flag = ReadyFlag::new();
        flag.publish(0xFEED);
        // A mismatched magic never satisfies the wait: wrong strategy tag.
        let proof = unsafe { ReadyFlag::wait(&raw const flag, 0xBEEF, Duration::from_millis(20)) };
        assert!(proof.is_none());
    }

    #[test]
    fn test_runtime_dispatch_round_trips_every_strategy() {
        for strategy in [
            Strategy::DirectStream,
            Strategy::PerSlotLock,
            Strategy::GlobalBroadcast,
        ] {
            let (tx, rx) = channel::<16, 4>(strategy).unwrap();
            for i in 0..3u8 {
                tx.send(Record::from_bytes([i; 16])).unwrap();
            }
            for i in 0..3u8 {
                assert_eq!(rx.receive().unwrap(), Record::from_bytes([i; 16]), "{strategy}");
            }
            assert_eq!(tx.produced(), 3);
            assert_eq!(rx.consumed(), 3);
        }
    }
}
