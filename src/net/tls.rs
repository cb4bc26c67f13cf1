use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::net::TcpStream;
use rustls::ClientConnection;

use crate::transport::Connection;
use crate::Error;

/// Plaintext rustls will buffer ahead of the socket.
pub(crate) const SEND_BUFFER: usize = 512;

/// Non-blocking TCP stream with a rustls client session on top.
pub struct TlsConnection {
    stream: TcpStream,
    tls: ClientConnection,
    connected: bool,
    closed: bool,
}

impl TlsConnection {
    pub(crate) fn new(stream: TcpStream, mut tls: ClientConnection) -> Self {
        tls.set_buffer_limit(Some(SEND_BUFFER));
        TlsConnection {
            stream,
            tls,
            connected: false,
            closed: false,
        }
    }

    /// Push queued TLS records to the socket until it would block.
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(0) => break,
                Ok(n) => trace!("Wrote {} TLS bytes", n),
                Err(e) if Error::is_would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read TLS records from the socket and decrypt them.
    ///
    /// Returns the number of bytes read, `None` if the socket had nothing.
    fn fill_tls(&mut self) -> io::Result<Option<usize>> {
        let n = match self.tls.read_tls(&mut self.stream) {
            Ok(n) => n,
            Err(e) if Error::is_would_block(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        trace!("Read {} TLS bytes", n);

        self.tls
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(n))
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.tls.reader().read(buf) {
            // A peer that closes without close_notify has still closed.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            r => r,
        }
    }
}

impl Connection for TlsConnection {
    fn poll_connect(&mut self) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }

        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }

        match self.stream.peer_addr() {
            Ok(addr) => {
                debug!("TCP connected to {}", addr);
                self.stream.set_nodelay(true)?;
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn handshake(&mut self) -> io::Result<()> {
        if !self.tls.is_handshaking() {
            return Ok(());
        }

        self.flush_tls()?;

        if self.tls.wants_read() && self.fill_tls()? == Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            ));
        }

        self.flush_tls()?;

        if self.tls.is_handshaking() {
            Err(io::ErrorKind::WouldBlock.into())
        } else {
            Ok(())
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_tls()?;

        let n = self.tls.writer().write(buf)?;

        self.flush_tls()?;

        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Body records may still be queued behind a slow socket.
        self.flush_tls()?;

        match self.read_plaintext(buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            r => return r,
        }

        if self.fill_tls()?.is_none() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        self.read_plaintext(buf)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.tls.send_close_notify();
        if let Err(e) = self.flush_tls() {
            trace!("close_notify not sent: {}", e);
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            trace!("Shutdown: {}", e);
        }
        debug!("Connection closed");
    }
}

impl Drop for TlsConnection {
    fn drop(&mut self) {
        self.close();
    }
}
