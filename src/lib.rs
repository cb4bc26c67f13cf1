//! Streaming chat-completion bridge for an emulated 8-bit machine.
//!
//! Two contexts share the work. The command context runs the emulated
//! machine and talks to the [`PortBridge`] one port access at a time. The
//! network context polls the [`Engine`], which resolves, connects, runs TLS,
//! sends the request and slices the Server-Sent-Events response into chunks.
//! The only link between them is a set of bounded, non-blocking queues.
//!
//! ```no_run
//! use std::thread;
//! use std::time::Duration;
//!
//! use chatport::{ports, ChatRequest, Config, PortDevice, Status};
//!
//! let (mut bridge, mut engine) = chatport::init_tls(Config::from_env())?;
//!
//! thread::spawn(move || loop {
//!     engine.poll();
//!     thread::sleep(Duration::from_millis(1));
//! });
//!
//! let body = ChatRequest::new("gpt-4o-mini").user("Hello").to_body()?;
//! let [lo, hi] = (body.len() as u16).to_le_bytes();
//!
//! bridge.output(ports::REQUEST, 0);
//! bridge.output(ports::LENGTH_LO, lo);
//! bridge.output(ports::LENGTH_HI, hi);
//! assert_eq!(bridge.input(ports::REQUEST), 1);
//!
//! for b in body.iter().copied().chain([0]) {
//!     while bridge.input(ports::STATUS) == Status::Busy.as_byte() {}
//!     bridge.output(ports::BODY, b);
//! }
//!
//! loop {
//!     match Status::try_from(bridge.input(ports::STATUS)) {
//!         Ok(Status::DataReady) => print!("{}", bridge.input(ports::READ) as char),
//!         Ok(Status::Eof) | Ok(Status::Failed) => break,
//!         _ => {}
//!     }
//! }
//! # Ok::<(), chatport::Error>(())
//! ```

#[macro_use]
extern crate log;

// Re-export the basis for status codes.
pub use http;

mod error;
pub use error::Error;

mod status;
pub use status::Status;

mod chunk;
pub use chunk::{Chunk, BODY_CHUNK_SIZE, CHUNK_CAPACITY};

mod channel;
pub use channel::{Channels, Queue, RequestStart, STATUS_RESERVE};

mod config;
pub use config::{Config, QueueSizes, MAX_CONTENT_LENGTH};

mod util;

mod sse;

pub mod token;

mod bus;
pub use bus::{PortBus, PortDevice};

mod port;
pub use port::{ports, PortBridge};

pub mod transport;
use transport::Network;

pub mod client;
pub use client::{Engine, State, Stats};

mod request;
pub use request::{ChatRequest, Message};

#[cfg(feature = "net")]
pub mod net;

/// Both halves of the bridge, sharing one set of queues.
pub fn init<N: Network>(config: Config, network: N) -> (PortBridge, Engine<N>) {
    debug!("Init {:?}", config);

    let channels = Channels::new(&config.queues);
    let bridge = PortBridge::new(channels.clone(), config.max_content_length);
    let engine = Engine::new(config, channels, network);

    (bridge, engine)
}

/// [`init`] with real sockets and TLS.
#[cfg(feature = "net")]
pub fn init_tls(config: Config) -> Result<(PortBridge, Engine<net::TlsNetwork>), Error> {
    let network = net::TlsNetwork::new(&config)?;
    Ok(init(config, network))
}
