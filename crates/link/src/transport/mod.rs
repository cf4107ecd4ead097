//! Connection-oriented, address-addressable duplex byte streams.
//!
//! Every operation takes `&self` so that a connection can be shared between its reader and
//! writer threads and closed from a third one. Closing is the cancellation mechanism: it
//! unblocks a pending `read` or `accept` with an error the caller treats as shutdown.

mod memory;
mod tcp;

use std::{io, sync::atomic::AtomicBool};

pub use memory::{JournalEntry, MemoryConnection, MemoryListener, MemoryNetwork, MemoryTransport};
pub use tcp::{TcpConnection, TcpEndpointListener, TcpTransport};

use crate::error::LinkError;

pub trait Connection: Send + Sync {
    /// Transport address of the remote side.
    fn peer(&self) -> &str;

    /// Read available bytes. `Ok(0)` means the remote side closed the stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Close both directions. Idempotent.
    fn close(&self);
}

pub trait Listener: Send + Sync {
    /// Block until a peer connects. Returns [`LinkError::Cancelled`] once the listener is
    /// closed.
    fn accept(&self) -> Result<Box<dyn Connection>, LinkError>;

    fn close(&self);
}

pub trait Transport: Send + Sync {
    fn listen(&self) -> Result<Box<dyn Listener>, LinkError>;

    /// Connect to `peer`, giving up with [`LinkError::Cancelled`] soon after `cancelled` is
    /// set. A connection is never returned once the flag was observed set.
    fn connect_cancellable(
        &self,
        peer: &str,
        cancelled: &AtomicBool,
    ) -> Result<Box<dyn Connection>, LinkError>;

    fn connect(&self, peer: &str) -> Result<Box<dyn Connection>, LinkError> {
        self.connect_cancellable(peer, &AtomicBool::new(false))
    }
}
