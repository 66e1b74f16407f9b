//! ChatBlue link runtime.
//!
//! Drives the pure core (`chatblue-core`) on tokio: a transport-agnostic
//! supervisor owns discovery, the accepting endpoint, outbound attempts and at
//! most one duplex session, and streams `Event`s to a single listener.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod session;
pub mod sink;
pub mod supervisor;
pub mod transport;

pub use config::LinkConfig;
pub use session::DuplexSession;
pub use sink::EventSink;
pub use supervisor::Supervisor;
pub use transport::{Call, ConnectOutcome, Connection, LinkStream, MemoryTransport, Transport};

/// A poisoned lock only means another thread panicked mid-update; the state
/// it guards is still the best we have.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
