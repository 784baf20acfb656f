//! Synchronization primitives for channel state.
//!
//! Everything here is safe to embed in shared state: configured for
//! cross-process use at initialization and free of process-local pointers.

pub mod pshared;

pub use pshared::{MutexGuard, ShmCondvar, ShmMutex, ShmSemaphore, SyncError};
