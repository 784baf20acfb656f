//! Process-shared pthread primitives.
//!
//! Wrappers over `libc` mutexes, condition variables, and semaphores,
//! configured `PTHREAD_PROCESS_SHARED` at initialization so the same struct
//! works whether the channel state lives on the heap (threads) or in a
//! shared-memory region (processes). `std::sync` types are process-local and
//! must never be placed in a region; the derive macro rejects them and points
//! here instead.
//!
//! # In-place initialization
//!
//! POSIX leaves the behavior of a moved pthread object undefined, so these
//! types have no by-value constructors. Each is brought up with `init_at` on
//! its final address (inside a region or a pinned heap allocation) and stays
//! there for the life of the memory. Nothing is ever destroyed: the region's
//! lifetime owns the primitives, and tearing one down from one process while
//! a peer still maps it would be worse than the few bytes kept. A peer dying
//! while holding a lock leaves the other side blocked; that limitation is
//! inherited from the underlying primitives.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::time::Duration;

use thiserror::Error;

use crate::shm::SharedMemorySafe;

/// Failures from the underlying pthread calls.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// A pthread or semaphore call returned an error code.
    #[error("{op} failed: {source}")]
    Posix {
        op: &'static str,
        source: rustix::io::Errno,
    },
}

impl SyncError {
    fn from_code(op: &'static str, code: libc::c_int) -> Self {
        Self::Posix {
            op,
            source: rustix::io::Errno::from_raw_os_error(code),
        }
    }

    fn last(op: &'static str) -> Self {
        let code = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL);
        Self::from_code(op, code)
    }
}

/// Maps a direct pthread return code (0 or an errno value) to a result.
fn check(op: &'static str, code: libc::c_int) -> Result<(), SyncError> {
    if code == 0 {
        Ok(())
    } else {
        Err(SyncError::from_code(op, code))
    }
}

/// A mutex that may live in memory shared between processes.
#[repr(C)]
pub struct ShmMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are built for concurrent use from any thread or
// process mapping them; the wrapper adds no state of its own.
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

// SAFETY: initialized PTHREAD_PROCESS_SHARED, the OS object is position-
// independent and valid from every mapping of the region; it holds no
// process-local pointers on Linux.
unsafe impl SharedMemorySafe for ShmMutex {}

impl ShmMutex {
    /// Initializes a mutex in place with the process-shared attribute.
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes of `Self`, and no initialization may
    /// already have happened there. The memory must not be moved or reused
    /// while any mapping can still lock the mutex.
    pub unsafe fn init_at(slot: *mut Self) -> Result<(), SyncError> {
        // Layout: repr(C) with a single UnsafeCell field, so the struct
        // pointer is the pthread object pointer.
        let raw = slot.cast::<libc::pthread_mutex_t>();
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is a local out-pointer; raw is valid per the caller
        // contract.
        unsafe {
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let result = check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            )
            .and_then(|()| check("pthread_mutex_init", libc::pthread_mutex_init(raw, attr.as_ptr())));
            let _ = libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result
        }
    }

    /// Blocks until the mutex is held; the guard unlocks on drop.
    pub fn lock(&self) -> Result<MutexGuard<'_>, SyncError> {
        // SAFETY: self was initialized in place by init_at and never moved.
        check("pthread_mutex_lock", unsafe {
            libc::pthread_mutex_lock(self.inner.get())
        })?;
        Ok(MutexGuard {
            mutex: self,
            _unsend: PhantomData,
        })
    }
}

/// Proof of mutex ownership; unlocks when dropped.
///
/// Not `Send`: POSIX requires the unlocking thread to be the locking one.
pub struct MutexGuard<'a> {
    mutex: &'a ShmMutex,
    _unsend: PhantomData<*mut ()>,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard's existence proves this thread holds the lock.
        // Unlock cannot meaningfully fail here and Drop cannot report it.
        let _ = unsafe { libc::pthread_mutex_unlock(self.mutex.inner.get()) };
    }
}

/// A condition variable that may live in shared memory.
#[repr(C)]
pub struct ShmCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: as for ShmMutex.
unsafe impl Send for ShmCondvar {}
unsafe impl Sync for ShmCondvar {}

// SAFETY: as for ShmMutex.
unsafe impl SharedMemorySafe for ShmCondvar {}

impl ShmCondvar {
    /// Initializes a condition variable in place with the process-shared
    /// attribute.
    ///
    /// # Safety
    ///
    /// Same contract as [`ShmMutex::init_at`].
    pub unsafe fn init_at(slot: *mut Self) -> Result<(), SyncError> {
        let raw = slot.cast::<libc::pthread_cond_t>();
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: as in ShmMutex::init_at.
        unsafe {
            check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            let result = check(
                "pthread_condattr_setpshared",
                libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            )
            .and_then(|()| check("pthread_cond_init", libc::pthread_cond_init(raw, attr.as_ptr())));
            let _ = libc::pthread_condattr_destroy(attr.as_mut_ptr());
            result
        }
    }

    /// Atomically releases the guard's mutex and waits for a wakeup,
    /// re-acquiring the mutex before returning.
    ///
    /// Spurious wakeups are possible; callers decide whether to re-check in
    /// a loop or treat a stale condition as a protocol error.
    pub fn wait<'a>(&self, guard: MutexGuard<'a>) -> Result<MutexGuard<'a>, SyncError> {
        // SAFETY: guard proves the mutex is held by this thread; both
        // objects were initialized in place.
        check("pthread_cond_wait", unsafe {
            libc::pthread_cond_wait(self.inner.get(), guard.mutex.inner.get())
        })?;
        Ok(guard)
    }

    /// Like [`ShmCondvar::wait`] with an upper bound on the wait.
    ///
    /// Returns the guard and whether the bound expired before a wakeup.
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a>,
        bound: Duration,
    ) -> Result<(MutexGuard<'a>, bool), SyncError> {
        let deadline = realtime_deadline(bound);
        // SAFETY: as in wait; the deadline is a plain out-of-line struct.
        let code = unsafe {
            libc::pthread_cond_timedwait(self.inner.get(), guard.mutex.inner.get(), &deadline)
        };
        match code {
            0 => Ok((guard, false)),
            libc::ETIMEDOUT => Ok((guard, true)),
            code => Err(SyncError::from_code("pthread_cond_timedwait", code)),
        }
    }

    /// Wakes at most one waiter.
    ///
    /// Only sound when at most one party can be waiting, as with a single
    /// producer and a single consumer on dedicated condvars.
    pub fn signal(&self) -> Result<(), SyncError> {
        // SAFETY: initialized in place, never moved.
        check("pthread_cond_signal", unsafe {
            libc::pthread_cond_signal(self.inner.get())
        })
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) -> Result<(), SyncError> {
        // SAFETY: initialized in place, never moved.
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.inner.get())
        })
    }
}

/// Absolute CLOCK_REALTIME deadline `bound` from now, the clock
/// `pthread_cond_timedwait` measures against by default.
fn realtime_deadline(bound: Duration) -> libc::timespec {
    let now = rustix::time::clock_gettime(rustix::time::ClockId::Realtime);
    let mut sec = now.tv_sec.saturating_add(bound.as_secs() as i64);
    let mut nsec = now.tv_nsec + i64::from(bound.subsec_nanos());
    if nsec >= 1_000_000_000 {
        sec = sec.saturating_add(1);
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as libc::c_long,
    }
}

/// A counting semaphore that may live in shared memory.
///
/// Initialized to 1 it acts as the binary slot lock of the per-slot-lock
/// strategy. Acquire/release are deliberately unpaired methods rather than a
/// guard: the strategy choreography releases and re-acquires across wait
/// loops.
#[repr(C)]
pub struct ShmSemaphore {
    inner: UnsafeCell<libc::sem_t>,
}

// SAFETY: as for ShmMutex.
unsafe impl Send for ShmSemaphore {}
unsafe impl Sync for ShmSemaphore {}

// SAFETY: initialized with pshared = 1, valid from every mapping.
unsafe impl SharedMemorySafe for ShmSemaphore {}

impl ShmSemaphore {
    /// Initializes a semaphore in place with the given count, shared
    /// between processes.
    ///
    /// # Safety
    ///
    /// Same contract as [`ShmMutex::init_at`].
    pub unsafe fn init_at(slot: *mut Self, initial: u32) -> Result<(), SyncError> {
        let raw = slot.cast::<libc::sem_t>();
        // SAFETY: raw is valid per the caller contract; pshared = 1.
        if unsafe { libc::sem_init(raw, 1, initial as libc::c_uint) } != 0 {
            return Err(SyncError::last("sem_init"));
        }
        Ok(())
    }

    /// Decrements the count, blocking while it is zero. Interrupted waits
    /// are transparently retried.
    pub fn acquire(&self) -> Result<(), SyncError> {
        loop {
            // SAFETY: initialized in place, never moved.
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(());
            }
            let err = SyncError::last("sem_wait");
            if let SyncError::Posix { source, .. } = err
                && source == rustix::io::Errno::INTR
            {
                continue;
            }
            return Err(err);
        }
    }

    /// Increments the count, waking one blocked acquirer if any.
    pub fn release(&self) -> Result<(), SyncError> {
        // SAFETY: initialized in place, never moved.
        if unsafe { libc::sem_post(self.inner.get()) } != 0 {
            return Err(SyncError::last("sem_post"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    // The tests build their fixtures the way channel states are built: an
    // Arc allocation initialized in place, never moved afterward.

    #[repr(C)]
    struct Guarded {
        mutex: ShmMutex,
        cond: ShmCondvar,
        value: UnsafeCell<u64>,
        ready: UnsafeCell<bool>,
    }

    // SAFETY: value/ready are only touched with the mutex held.
    unsafe impl Sync for Guarded {}

    fn guarded() -> Arc<Guarded> {
        let mut cell = Arc::<Guarded>::new_uninit();
        let slot = Arc::get_mut(&mut cell).expect("fresh Arc is uniquely owned");
        let ptr = slot.as_mut_ptr();
        unsafe {
            ShmMutex::init_at(&raw mut (*ptr).mutex).unwrap();
            ShmCondvar::init_at(&raw mut (*ptr).cond).unwrap();
            (&raw mut (*ptr).value).write(UnsafeCell::new(0));
            (&raw mut (*ptr).ready).write(UnsafeCell::new(false));
            cell.assume_init()
        }
    }

    #[test]
    fn test_mutex_excludes_concurrent_increments() {
        let shared = guarded();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let guard = shared.mutex.lock().unwrap();
                    unsafe { *shared.value.get() += 1 };
                    drop(guard);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let guard = shared.mutex.lock().unwrap();
        assert_eq!(unsafe { *shared.value.get() }, 4000);
        drop(guard);
    }

    #[test]
    fn test_condvar_signal_wakes_waiter() {
        let shared = guarded();
        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut guard = shared.mutex.lock().unwrap();
                while !unsafe { *shared.ready.get() } {
                    guard = shared.cond.wait(guard).unwrap();
                }
                unsafe { *shared.value.get() }
            })
        };
        thread::sleep(Duration::from_millis(50));
        {
            let guard = shared.mutex.lock().unwrap();
            unsafe {
                *shared.value.get() = 7;
                *shared.ready.get() = true;
            }
            drop(guard);
            shared.cond.signal().unwrap();
        }
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn test_condvar_wait_timeout_expires() {
        let shared = guarded();
        let guard = shared.mutex.lock().unwrap();
        let (guard, timed_out) = shared
            .cond
            .wait_timeout(guard, Duration::from_millis(20))
            .unwrap();
        assert!(timed_out);
        drop(guard);
    }

    #[repr(C)]
    struct Gate {
        sem: ShmSemaphore,
    }

    #[test]
    fn test_binary_semaphore_blocks_second_acquire() {
        let mut cell = Arc::<Gate>::new_uninit();
        let slot = Arc::get_mut(&mut cell).expect("fresh Arc is uniquely owned");
        let ptr = slot.as_mut_ptr();
        let gate = unsafe {
            ShmSemaphore::init_at(&raw mut (*ptr).sem, 1).unwrap();
            cell.assume_init()
        };

        gate.sem.acquire().unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let contender = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                gate.sem.acquire().unwrap();
                entered.store(true, Ordering::SeqCst);
                gate.sem.release().unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        gate.sem.release().unwrap();
        contender.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
