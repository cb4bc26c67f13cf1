//! What the engine needs from the outside world.
//!
//! Everything here is non-blocking. `ErrorKind::WouldBlock` means "not yet,
//! ask again on the next poll"; any other error is fatal to the request.

use std::io;
use std::net::SocketAddr;

/// Result of starting a name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Known immediately, for example a literal address or a cached entry.
    Ready(SocketAddr),
    /// Look for the answer with [`Network::poll_resolve`].
    Pending,
}

/// One TLS-wrapped stream connection.
pub trait Connection {
    /// `Ok(true)` once the transport is connected.
    fn poll_connect(&mut self) -> io::Result<bool>;

    /// Drive the TLS handshake one step. `Ok(())` when complete.
    fn handshake(&mut self) -> io::Result<()>;

    /// Write plaintext, returning how much was accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read decrypted bytes. `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close and release everything. Safe to call more than once.
    fn close(&mut self);
}

/// Name resolution and connection setup.
pub trait Network {
    type Conn: Connection;

    /// Start resolving `host`. At most one lookup is outstanding; starting a
    /// new one abandons the previous.
    fn resolve(&mut self, host: &str, port: u16) -> io::Result<Resolve>;

    /// Answer to the outstanding lookup, `None` while still pending.
    fn poll_resolve(&mut self) -> Option<io::Result<SocketAddr>>;

    /// Open a connection to `addr`, using `host` for the TLS session.
    fn connect(&mut self, addr: SocketAddr, host: &str) -> io::Result<Self::Conn>;
}
