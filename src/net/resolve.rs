use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use crate::transport::Resolve;

/// Name lookups on a helper thread, answered through a channel.
///
/// The system resolver blocks, so each lookup gets its own short-lived
/// thread. Starting a new lookup drops the receiver of the old one; its
/// thread finishes and its answer goes nowhere.
#[derive(Default)]
pub(crate) struct Resolver {
    pending: Option<Receiver<io::Result<SocketAddr>>>,
}

impl Resolver {
    pub fn start(&mut self, host: &str, port: u16) -> io::Result<Resolve> {
        self.pending = None;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Resolve::Ready(SocketAddr::new(ip, port)));
        }

        let (tx, rx) = mpsc::channel();
        let target = (host.to_string(), port);

        thread::Builder::new()
            .name("chatport-resolve".into())
            .spawn(move || {
                let result = target.to_socket_addrs().and_then(|mut addrs| {
                    addrs.next().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "no address for host")
                    })
                });
                // Nobody listening means the lookup was abandoned.
                let _ = tx.send(result);
            })?;

        self.pending = Some(rx);

        Ok(Resolve::Pending)
    }

    pub fn poll(&mut self) -> Option<io::Result<SocketAddr>> {
        let rx = self.pending.as_ref()?;

        match rx.try_recv() {
            Ok(result) => {
                self.pending = None;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.pending = None;
                Some(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "resolver thread ended without answer",
                )))
            }
        }
    }
}
