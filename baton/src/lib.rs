// Allow the crate to reference itself as ::baton for derive macro usage
extern crate self as baton;

pub mod channel;
pub mod pump;
pub mod record;
mod ring;
pub mod shm;
pub mod sync;
mod trace;
pub mod vocab;

#[doc(inline)]
pub use baton_derive::SharedMemorySafe;

#[doc(inline)]
pub use shm::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use shm::SharedMemorySafe as __SharedMemorySafePrivate;

// Re-export the working set so callers rarely need the module paths
pub use channel::{
    Receiver, RecvHalf, SendHalf, Sender, Strategy, Timeout, TransportError, channel,
};
pub use record::{DEFAULT_WIDTH, Record};
pub use trace::init_tracing;
