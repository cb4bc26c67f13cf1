use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use http::StatusCode;

use crate::channel::{is_newer, Channels, RequestStart};
use crate::chunk::Chunk;
use crate::sse::{Progress, SseDecoder};
use crate::transport::{Connection, Network, Resolve};
use crate::{Config, Error, Status};

use super::prelude;
use super::State;

/// Decrypt/extract rounds per poll in RECEIVING.
const RECEIVE_ROUNDS: usize = 8;

/// Counters for one finished request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub http_status: Option<StatusCode>,
    pub prelude_len: usize,
    pub body_sent: usize,
    /// Prelude plus body.
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub largest_frame: usize,
    /// Highest fill of the decrypted response buffer.
    pub buffer_high_water: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} ({} body), received {}, largest frame {}, buffer high water {}",
            self.bytes_sent,
            self.body_sent,
            self.bytes_received,
            self.largest_frame,
            self.buffer_high_water
        )
    }
}

/// Everything belonging to the request in flight.
struct Context<C> {
    conn: Option<C>,
    addr: Option<SocketAddr>,
    generation: u32,
    content_length: usize,
    started: Option<Instant>,
    state_entered: Option<Instant>,

    prelude: Vec<u8>,
    prelude_sent: usize,

    /// Body bytes taken off the queue but not yet written.
    partial: Vec<u8>,
    partial_sent: usize,
    body_sent: usize,

    bytes_received: usize,
    decoder: SseDecoder,

    /// Peer closed or read failed, draining what is left.
    closing: bool,
    close_error: Option<Error>,
}

impl<C: Connection> Context<C> {
    fn new(response_buffer: usize) -> Self {
        Context {
            conn: None,
            addr: None,
            generation: 0,
            content_length: 0,
            started: None,
            state_entered: None,
            prelude: Vec::with_capacity(prelude::PRELUDE_CAPACITY),
            prelude_sent: 0,
            partial: Vec::new(),
            partial_sent: 0,
            body_sent: 0,
            bytes_received: 0,
            decoder: SseDecoder::new(response_buffer),
            closing: false,
            close_error: None,
        }
    }

    fn begin(&mut self, start: &RequestStart, now: Instant) {
        self.generation = start.generation;
        self.content_length = start.content_length;
        self.started = Some(now);
    }

    /// Close the transport and clear everything, keeping allocations.
    fn reset(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.addr = None;
        self.content_length = 0;
        self.started = None;
        self.prelude.clear();
        self.prelude_sent = 0;
        self.partial.clear();
        self.partial_sent = 0;
        self.body_sent = 0;
        self.bytes_received = 0;
        self.decoder.reset();
        self.closing = false;
        self.close_error = None;
    }

    fn stats(&self) -> Stats {
        Stats {
            http_status: self.decoder.status(),
            prelude_len: self.prelude.len(),
            body_sent: self.body_sent,
            bytes_sent: self.prelude_sent + self.body_sent,
            bytes_received: self.bytes_received,
            largest_frame: self.decoder.largest_frame(),
            buffer_high_water: self.decoder.high_water(),
        }
    }
}

/// The network-context half of the bridge.
///
/// Call [`Engine::poll`] continuously. Each call does at most one unit of
/// work and never blocks.
pub struct Engine<N: Network> {
    config: Config,
    channels: Channels,
    network: N,
    state: State,
    ctx: Context<N::Conn>,
    now: Instant,
    last_error: Option<Error>,
    last_stats: Stats,
}

impl<N: Network> Engine<N> {
    pub fn new(config: Config, channels: Channels, network: N) -> Self {
        let ctx = Context::new(config.response_buffer);
        Engine {
            config,
            channels,
            network,
            state: State::Idle,
            ctx,
            now: Instant::now(),
            last_error: None,
            last_stats: Stats::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Status code of the current response, or of the last one once idle.
    pub fn http_status(&self) -> Option<StatusCode> {
        self.ctx.decoder.status().or(self.last_stats.http_status)
    }

    /// The most recent fatal error.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Counters of the last finished request.
    pub fn stats(&self) -> &Stats {
        &self.last_stats
    }

    // pub(crate) for tests to inspect the response buffer
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.ctx.decoder.len()
    }

    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    pub fn poll_at(&mut self, now: Instant) {
        self.now = now;

        if self.state != State::Idle && self.is_superseded() {
            return self.supersede();
        }

        if self.state.is_active() && self.timed_out() {
            self.fail(Error::Timeout(self.config.request_timeout));
        }

        match self.state {
            State::Idle => self.poll_idle(),
            State::Resolving => self.poll_resolving(),
            State::Connecting => self.poll_connecting(),
            State::Handshake => self.poll_handshake(),
            State::SendingHeaders => self.poll_sending_headers(),
            State::StreamingBody => self.poll_streaming_body(),
            State::Receiving => self.poll_receiving(),
            State::Done => self.poll_terminal(Status::Eof),
            State::Error => self.poll_terminal(Status::Failed),
        }
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            debug!("{} -> {}", self.state, next);
            self.state = next;
            self.ctx.state_entered = Some(self.now);
        }
    }

    fn fail(&mut self, err: Error) {
        error!("Request failed in {}: {}", self.state, err);
        self.last_error = Some(err);
        self.set_state(State::Error);
    }

    fn is_superseded(&self) -> bool {
        self.ctx.generation != self.channels.generation()
    }

    /// Drop the request without a status. The port side has moved on.
    fn supersede(&mut self) {
        warn!(
            "Request superseded in {} (generation {} != {})",
            self.state,
            self.ctx.generation,
            self.channels.generation()
        );
        self.ctx.reset();
        self.set_state(State::Idle);
    }

    /// Drop queued body entries up to the first one of a newer request.
    fn drain_body(&self) -> usize {
        let generation = self.ctx.generation;
        self.channels
            .body
            .drain_while(|c| !is_newer(c.generation(), generation))
    }

    fn elapsed_since(&self, at: Option<Instant>) -> Duration {
        at.map(|t| self.now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    fn timed_out(&self) -> bool {
        self.elapsed_since(self.ctx.started) >= self.config.request_timeout
    }

    // ///////////////////////////////////////////////////////////////////////////////////// IDLE

    fn poll_idle(&mut self) {
        let Some(start) = self.channels.requests.try_pop() else {
            return;
        };

        if start.abort {
            let dropped = self.channels.inbound.drain();
            debug!("Abort received, dropped {} inbound chunks", dropped);
            return;
        }

        if start.generation != self.channels.generation() {
            debug!("Ignoring request of stale generation {}", start.generation);
            return;
        }

        self.ctx.begin(&start, self.now);
        info!(
            "Request start: {} body bytes to {}{}",
            start.content_length,
            self.config.authority(),
            self.config.path
        );

        self.set_state(State::Resolving);

        match self.network.resolve(&self.config.host, self.config.port) {
            Ok(Resolve::Ready(addr)) => {
                debug!("Resolved {} to {} without waiting", self.config.host, addr);
                self.ctx.addr = Some(addr);
                self.set_state(State::Connecting);
            }
            Ok(Resolve::Pending) => {}
            Err(e) => self.fail(Error::Resolve(e)),
        }
    }

    // //////////////////////////////////////////////////////////////////////////////// RESOLVING

    fn poll_resolving(&mut self) {
        match self.network.poll_resolve() {
            Some(Ok(addr)) => {
                debug!("Resolved {} to {}", self.config.host, addr);
                self.ctx.addr = Some(addr);
                self.set_state(State::Connecting);
            }
            Some(Err(e)) => self.fail(Error::Resolve(e)),
            None => {
                let timeout = self.config.resolve_timeout;
                if self.elapsed_since(self.ctx.state_entered) >= timeout {
                    self.fail(Error::ResolveTimeout(timeout));
                }
            }
        }
    }

    // /////////////////////////////////////////////////////////////////////////////// CONNECTING

    fn poll_connecting(&mut self) {
        if self.ctx.conn.is_none() {
            let Some(addr) = self.ctx.addr else {
                let e = io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved address");
                return self.fail(Error::Connect(e));
            };

            match self.network.connect(addr, &self.config.host) {
                Ok(conn) => {
                    debug!("Connecting to {}", addr);
                    self.ctx.conn = Some(conn);
                }
                Err(e) => return self.fail(Error::Connect(e)),
            }
        }

        let Some(conn) = self.ctx.conn.as_mut() else {
            return;
        };

        match conn.poll_connect() {
            Ok(true) => self.set_state(State::Handshake),
            Ok(false) => {}
            Err(e) if Error::is_would_block(&e) => {}
            Err(e) => self.fail(Error::Connect(e)),
        }
    }

    // //////////////////////////////////////////////////////////////////////////////// HANDSHAKE

    fn poll_handshake(&mut self) {
        let Some(conn) = self.ctx.conn.as_mut() else {
            return self.fail(Error::Handshake(io::ErrorKind::NotConnected.into()));
        };

        match conn.handshake() {
            Ok(()) => {
                info!("TLS session established with {}", self.config.host);
                self.set_state(State::SendingHeaders);
            }
            Err(e) if Error::is_would_block(&e) => {}
            Err(e) => self.fail(Error::Handshake(e)),
        }
    }

    // ////////////////////////////////////////////////////////////////////////// SENDING HEADERS

    fn poll_sending_headers(&mut self) {
        if self.ctx.prelude.is_empty() {
            match prelude::build(&self.config, self.ctx.content_length) {
                Ok(p) => {
                    trace!("Prelude built ({} bytes)", p.len());
                    self.ctx.prelude = p;
                }
                Err(e) => return self.fail(e),
            }
        }

        let ctx = &mut self.ctx;
        let Some(conn) = ctx.conn.as_mut() else {
            return self.fail(Error::Write(io::ErrorKind::NotConnected.into()));
        };

        match conn.write(&ctx.prelude[ctx.prelude_sent..]) {
            Ok(n) => ctx.prelude_sent += n,
            Err(e) if Error::is_would_block(&e) => {}
            Err(e) => return self.fail(Error::Write(e)),
        }

        if ctx.prelude_sent < ctx.prelude.len() {
            trace!("Prelude {}/{} bytes", ctx.prelude_sent, ctx.prelude.len());
            return;
        }

        debug!("Prelude sent ({} bytes)", ctx.prelude.len());
        self.set_state(State::StreamingBody);
    }

    // /////////////////////////////////////////////////////////////////////////// STREAMING BODY

    fn poll_streaming_body(&mut self) {
        // A remainder of the previous chunk goes before anything new.
        if !self.ctx.partial.is_empty() {
            if let Err(e) = self.write_partial() {
                return self.fail(e);
            }
            if !self.ctx.partial.is_empty() {
                return;
            }
        }

        if self.ctx.body_sent >= self.ctx.content_length {
            return self.body_finished();
        }

        let generation = self.ctx.generation;
        let popped = self
            .channels
            .body
            .try_pop_if(|c| !is_newer(c.generation(), generation));

        let Some(chunk) = popped else {
            // Empty, or the front belongs to a newer request and stays queued.
            if self.is_superseded() {
                self.supersede();
            }
            return;
        };

        if chunk.generation() != generation {
            debug!("Dropped body chunk of stale generation {}", chunk.generation());
            return;
        }

        if chunk.is_end_of_body() {
            if self.ctx.body_sent < self.ctx.content_length {
                warn!(
                    "Body ended after {} of {} declared bytes",
                    self.ctx.body_sent, self.ctx.content_length
                );
            }
            debug!("End of body");
            self.set_state(State::Receiving);
            return;
        }

        let remaining = self.ctx.content_length - self.ctx.body_sent;
        let mut bytes = chunk.as_bytes();
        if bytes.len() > remaining {
            warn!(
                "Body exceeds declared length, dropping {} bytes",
                bytes.len() - remaining
            );
            bytes = &bytes[..remaining];
        }
        self.ctx.partial.extend_from_slice(bytes);

        if let Err(e) = self.write_partial() {
            return self.fail(e);
        }

        if self.ctx.partial.is_empty() && self.ctx.body_sent >= self.ctx.content_length {
            self.body_finished();
        }
    }

    /// One write of the pending body bytes.
    fn write_partial(&mut self) -> Result<(), Error> {
        let ctx = &mut self.ctx;
        let Some(conn) = ctx.conn.as_mut() else {
            return Err(Error::Write(io::ErrorKind::NotConnected.into()));
        };

        match conn.write(&ctx.partial[ctx.partial_sent..]) {
            Ok(n) => {
                ctx.partial_sent += n;
                ctx.body_sent += n;
            }
            Err(e) if Error::is_would_block(&e) => {}
            Err(e) => return Err(Error::Write(e)),
        }

        if ctx.partial_sent == ctx.partial.len() {
            ctx.partial.clear();
            ctx.partial_sent = 0;
        } else {
            trace!(
                "Partial body write, {} bytes pending",
                ctx.partial.len() - ctx.partial_sent
            );
        }

        Ok(())
    }

    /// Declared length reached. Anything of this request still queued, the
    /// end marker included, is not part of this body.
    fn body_finished(&mut self) {
        let dropped = self.drain_body();
        debug!(
            "Body complete ({} bytes), dropped {} queued entries",
            self.ctx.body_sent, dropped
        );
        self.set_state(State::Receiving);
    }

    // //////////////////////////////////////////////////////////////////////////////// RECEIVING

    fn poll_receiving(&mut self) {
        let late = self.drain_body();
        if late > 0 {
            trace!("Dropped {} late body entries", late);
        }

        if self.ctx.closing {
            return self.poll_closing();
        }

        let generation = self.ctx.generation;

        for _ in 0..RECEIVE_ROUNDS {
            match self.ctx.decoder.process(&self.channels, generation) {
                Progress::Done => return self.set_state(State::Done),
                // Consumer is behind, decrypt nothing more.
                Progress::Blocked => return,
                Progress::Drained => {}
            }

            if self.ctx.decoder.space() == 0 {
                trace!("Response buffer full, yielding");
                return;
            }

            let ctx = &mut self.ctx;
            let Some(conn) = ctx.conn.as_mut() else {
                return self.fail(Error::Read(io::ErrorKind::NotConnected.into()));
            };

            match ctx.decoder.fill(|buf| conn.read(buf)) {
                Ok(0) => {
                    info!("Peer closed the connection");
                    ctx.closing = true;
                    return self.poll_closing();
                }
                Ok(n) => {
                    ctx.bytes_received += n;
                    trace!("Received {} bytes", n);
                }
                Err(e) if Error::is_would_block(&e) => return,
                Err(e) => {
                    ctx.closing = true;
                    ctx.close_error = Some(Error::Read(e));
                    return self.poll_closing();
                }
            }
        }
    }

    /// Deliver what is buffered, then the unterminated tail, then finish.
    fn poll_closing(&mut self) {
        let generation = self.ctx.generation;

        match self.ctx.decoder.process(&self.channels, generation) {
            Progress::Done => return self.set_state(State::Done),
            Progress::Blocked => return,
            Progress::Drained => {}
        }

        if !self.ctx.decoder.flush(&self.channels, generation) {
            return;
        }

        match self.ctx.close_error.take() {
            Some(e) => self.fail(e),
            None => self.set_state(State::Done),
        }
    }

    // ///////////////////////////////////////////////////////////////////////////// DONE / ERROR

    fn poll_terminal(&mut self, status: Status) {
        let chunk = Chunk::status(status, self.ctx.generation);
        if self.channels.inbound.try_push(chunk).is_err() {
            debug!("Inbound queue full, {:?} deferred", status);
            return;
        }

        let stats = self.ctx.stats();
        info!("Request finished with {:?}: {}", status, stats);
        if let Some(code) = stats.http_status {
            if !code.is_success() {
                warn!("Request ended with HTTP {}", code.as_u16());
            }
        }
        self.last_stats = stats;

        self.ctx.reset();
        self.set_state(State::Idle);
    }
}
