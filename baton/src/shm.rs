//! POSIX shared memory regions with typed, in-place initialization.
//!
//! A [`Shm<T, Mode>`] owns one mapping of a POSIX shared memory object
//! holding exactly one `T`. The `Mode` typestate fixes cleanup at compile
//! time: a [`Creator`] unlinks the name when dropped, an [`Opener`] only
//! unmaps. [`SharedMemorySafe`] gates what may be placed in a region.
//!
//! # In-place initialization
//!
//! Channel state embeds pthread objects, and POSIX does not allow those to
//! be constructed by value and moved: they must be initialized at their
//! final address. `create` therefore maps the region first and then hands
//! the uninitialized memory to a caller-supplied initializer:
//!
//! ```text
//! shm_open(O_CREAT|O_EXCL) ──> ftruncate(size_of::<T>())
//!        ──> mmap ──> init(&mut MaybeUninit<T>) ──> Shm<T, Creator>
//! ```
//!
//! The initializer runs while the object's name is already visible, so
//! peers may map the region mid-initialization. They must not touch it
//! until the creator publishes readiness; channel state does this with a
//! magic word stored with `Release` ordering as the initializer's final
//! write, which openers poll with `Acquire` loads.
//!
//! # Crash recovery
//!
//! A crashed creator leaks the name. Long-lived services unlink leftovers
//! before creating:
//!
//! ```no_run
//! let _ = rustix::shm::unlink("/baton-demo");
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};

use crate::sync::SyncError;

/// Result alias for region operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`] and [`ShmPath`].
#[derive(Debug)]
pub enum ShmError {
    /// The shared memory name violates the POSIX portability rules.
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The existing object's size does not match `size_of::<T>()`.
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
    /// The region initializer reported a failure.
    InitFailed { path: String, source: SyncError },
    /// An opener gave up waiting for the creator to publish readiness.
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidPath { path, reason } => {
                write!(f, "invalid shared memory path `{path}`: {reason}")
            }
            ShmError::PosixError { op, path, source } => {
                write!(f, "{op} failed for `{path}`: {source}")
            }
            ShmError::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}"
            ),
            ShmError::InitFailed { path, source } => {
                write!(f, "initialization of `{path}` failed: {source}")
            }
            ShmError::InitTimeout { path } => {
                write!(f, "timed out waiting for `{path}` to become ready")
            }
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmError::PosixError { source, .. } => Some(source),
            ShmError::InitFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// For portable `shm_open` use the name must start with `/`, contain no
/// further `/`, and fit 255 bytes. Validation happens once here so the
/// constructors can take the name by type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmPath(String);

impl ShmPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must start with '/'",
            });
        }
        if path[1..].contains('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must not contain additional '/' characters",
            });
        }
        if path.len() > POSIX_NAME_MAX {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path length must be <= 255 bytes",
            });
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cleanup behavior selector for [`Shm`]; see [`Creator`] and [`Opener`].
pub trait ShmMode {
    /// Whether dropping the handle also unlinks the object name.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the side that creates the region.
///
/// Dropping a `Shm<T, Creator>` unmaps the memory and unlinks the name.
/// Peers that still hold mappings keep the memory alive; only the name
/// disappears.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for the side that opens an existing region.
///
/// Dropping a `Shm<T, Opener>` only unmaps; the creator owns the name.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in a shared memory region.
///
/// # Safety
///
/// Implementers guarantee all of the following:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]`, so peers compiled
///   separately agree on offsets.
/// - **No pointers**: no references, raw pointers, or heap handles; virtual
///   addresses do not transfer between processes.
/// - **Drop**: the type stays sound if `Drop` never runs; a `SIGKILL`ed
///   peer runs no destructors.
/// - **Concurrency**: `Send + Sync`, because peers access the memory
///   simultaneously. Process-local primitives (`std::sync::Mutex` and
///   friends) must not appear; the `sync` module provides process-shared
///   replacements.
///
/// Use `#[derive(SharedMemorySafe)]` for structs; the derive checks the
/// repr, rejects pointer-carrying and process-local field types, and bounds
/// every field by this trait.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// An owned mapping of one `T` in POSIX shared memory.
///
/// Dereferences to `&T` only: peers in other processes hold the same
/// memory, so exclusive references to the whole region never exist after
/// creation. Interior mutability (atomics, the `sync` primitives) is how
/// shared state changes.
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the handle owns a mapping of memory designed for cross-process
// concurrent access; T: SharedMemorySafe already requires Send + Sync, and
// nothing in the handle is tied to the creating thread.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates the object, maps it, and initializes it in place.
    ///
    /// `init` receives the zero-page-backed uninitialized memory at its
    /// final address and must fully initialize the `T`, finishing with
    /// whatever readiness publication the type's protocol calls for. If
    /// `init` fails or panics the mapping and the name are cleaned up
    /// before the error or panic continues.
    ///
    /// # Errors
    ///
    /// `PosixError` when the object exists (`EEXIST`), permissions deny
    /// creation (`EACCES`), or sizing/mapping fails; `InitFailed` when
    /// `init` reports an error.
    pub fn create<F>(path: ShmPath, init: F) -> Result<Self>
    where
        F: FnOnce(&mut MaybeUninit<T>) -> std::result::Result<(), SyncError>,
    {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path.as_str(), err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", path.as_str(), err));
        }

        // SAFETY: fresh fd-backed mapping of size_of::<T>() bytes; mmap
        // returns page-aligned memory, which satisfies any T's alignment,
        // and the mapping aliases no existing object in this process.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", path.as_str(), err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut T) };

        // From here on, dropping `shm` unmaps and unlinks.
        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        };

        // SAFETY: the mapping is exclusive to this handle until the
        // initializer publishes readiness; treating it as &mut
        // MaybeUninit<T> is sound because waiting peers read nothing but
        // the atomic readiness word the initializer stores last.
        let uninit = unsafe { &mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>() };
        match catch_unwind(AssertUnwindSafe(|| init(uninit))) {
            Ok(Ok(())) => Ok(shm),
            Ok(Err(source)) => {
                let path = shm.path.as_str().to_string();
                drop(shm);
                Err(ShmError::InitFailed { path, source })
            }
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens and maps an existing object, verifying its size first.
    ///
    /// The mapped state may still be mid-initialization; callers follow
    /// the type's readiness protocol before touching it.
    ///
    /// # Errors
    ///
    /// `PosixError` when the object is missing (`ENOENT`) or inaccessible,
    /// `SizeMismatch` when it was created for a different type.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path.as_str(), err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", path.as_str(), err));
            }
        };
        if stat.st_size != size_of::<T>() as i64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.as_str().to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: the object exists with the verified size; the fresh
        // mapping is page-aligned and aliases nothing local. Concurrent
        // peer access is what T: SharedMemorySafe licenses.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(ptr) => ptr,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", path.as_str(), err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut T) };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// The object name this handle maps.
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in the
        // constructor; after munmap nothing dereferences ptr again.
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.size);
        }
        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid until Drop, and
        // T: SharedMemorySafe licenses shared access from any peer.
        unsafe { &*self.ptr.as_ptr() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedMemorySafe;

    #[derive(SharedMemorySafe)]
    #[repr(C)]
    struct Counter {
        generation: AtomicU64,
        armed: AtomicBool,
    }

    fn init_counter(uninit: &mut MaybeUninit<Counter>) -> std::result::Result<(), SyncError> {
        uninit.write(Counter {
            generation: AtomicU64::new(0),
            armed: AtomicBool::new(false),
        });
        Ok(())
    }

    fn unique_path(tag: &str) -> ShmPath {
        use std::sync::atomic::AtomicUsize;
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        ShmPath::new(format!(
            "/baton-test-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
        .unwrap()
    }

    /// Permission-restricted environments cannot create shm objects; those
    /// runs skip rather than fail.
    fn skippable(err: ShmError, test: &str) -> Result<()> {
        if let ShmError::PosixError { source, .. } = err
            && source == io::Errno::ACCESS
        {
            eprintln!("Skipping {test}: {err}");
            return Ok(());
        }
        Err(err)
    }

    #[test]
    fn test_create_initializes_in_place() -> Result<()> {
        let path = unique_path("create");
        let counter = match Shm::<Counter, Creator>::create(path, init_counter) {
            Ok(counter) => counter,
            Err(err) => return skippable(err, "test_create_initializes_in_place"),
        };
        assert_eq!(counter.generation.load(Ordering::SeqCst), 0);
        counter.generation.store(42, Ordering::SeqCst);
        assert_eq!(counter.generation.load(Ordering::SeqCst), 42);
        Ok(())
    }

    #[test]
    fn test_opener_sees_creator_writes() -> Result<()> {
        let path = unique_path("visible");
        let creator = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(creator) => creator,
            Err(err) => return skippable(err, "test_opener_sees_creator_writes"),
        };
        creator.generation.store(100, Ordering::SeqCst);
        creator.armed.store(true, Ordering::SeqCst);

        {
            let opener = Shm::<Counter, Opener>::open(path)?;
            assert_eq!(opener.generation.load(Ordering::SeqCst), 100);
            assert!(opener.armed.load(Ordering::SeqCst));
            opener.generation.store(200, Ordering::SeqCst);
        } // opener drops: unmap only

        assert_eq!(creator.generation.load(Ordering::SeqCst), 200);
        Ok(())
    }

    #[test]
    fn test_creator_drop_unlinks_name() -> Result<()> {
        let path = unique_path("unlink");
        match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(creator) => drop(creator),
            Err(err) => return skippable(err, "test_creator_drop_unlinks_name"),
        }
        match Shm::<Counter, Opener>::open(path) {
            Err(ShmError::PosixError { source, .. }) => {
                assert_eq!(source, io::Errno::NOENT);
                Ok(())
            }
            Err(err) => Err(err),
            Ok(_) => panic!("name should be gone after the creator dropped"),
        }
    }

    #[test]
    fn test_failed_init_cleans_up() -> Result<()> {
        let path = unique_path("initfail");
        let result = Shm::<Counter, Creator>::create(path.clone(), |_| {
            Err(SyncError::Posix {
                op: "pthread_mutex_init",
                source: io::Errno::NOMEM,
            })
        });
        match result {
            Err(ShmError::InitFailed { source, .. }) => {
                assert!(matches!(source, SyncError::Posix { .. }));
            }
            Err(err) => return skippable(err, "test_failed_init_cleans_up"),
            Ok(_) => panic!("initializer error should propagate"),
        }
        // The name must not have leaked.
        assert!(matches!(
            Shm::<Counter, Opener>::open(path),
            Err(ShmError::PosixError { source, .. }) if source == io::Errno::NOENT
        ));
        Ok(())
    }

    #[test]
    fn test_open_size_mismatch() -> Result<()> {
        #[derive(SharedMemorySafe)]
        #[repr(C)]
        struct Wider {
            a: AtomicU64,
            b: AtomicU64,
            c: AtomicU64,
        }

        let path = unique_path("mismatch");
        let _small = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(shm) => shm,
            Err(err) => return skippable(err, "test_open_size_mismatch"),
        };

        match Shm::<Wider, Opener>::open(path) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, size_of::<Wider>());
                assert_eq!(actual, size_of::<Counter>() as i64);
                Ok(())
            }
            Err(err) => Err(err),
            Ok(_) => panic!("open with a differently sized type must fail"),
        }
    }

    #[test]
    fn test_path_rules() {
        assert!(ShmPath::new("/valid").is_ok());
        assert!(ShmPath::new("/valid-name_123").is_ok());
        assert!(matches!(
            ShmPath::new("no-slash"),
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
        assert!(matches!(
            ShmPath::new("/foo/bar"),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));
        let long = format!("/{}", "a".repeat(255));
        assert!(matches!(
            ShmPath::new(long),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path length must be <= 255 bytes"
        ));
        // 255 bytes total, including the leading slash, is the limit.
        assert!(ShmPath::new(format!("/{}", "a".repeat(254))).is_ok());
    }
}
