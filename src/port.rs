//! Byte-level port protocol seen by the legacy machine.
//!
//! A legacy program drives a request like this:
//!
//! ```text
//! OUT 120           reset request state
//! OUT 126, lo       content length, low byte
//! OUT 127, hi       content length, high byte (arms "ready")
//! IN  120           trigger, 1 if the request was queued
//! OUT 121, b ...    body bytes, polling IN 123 for BUSY in between
//! OUT 121, 0        end of body
//! IN  123           status: WAITING / DATA_READY / EOF / FAILED
//! IN  124           next response byte
//! ```
//!
//! Every access returns immediately. Nothing here waits for the network
//! context, which only ever sees the queues in [`Channels`].

use crate::bus::PortDevice;
use crate::channel::{Channels, RequestStart};
use crate::chunk::{Chunk, BODY_CHUNK_SIZE, CHUNK_CAPACITY};
use crate::token::{self, Token};
use crate::{Error, Status};

/// Port addresses claimed by the bridge.
pub mod ports {
    /// OUT: reset request state. IN: trigger.
    pub const REQUEST: u8 = 120;
    /// OUT: append body byte, NUL ends the body. IN: content length low byte.
    pub const BODY: u8 = 121;
    /// OUT: reset response state. IN: content length high byte.
    pub const RESPONSE: u8 = 122;
    /// IN: status.
    pub const STATUS: u8 = 123;
    /// IN: next response byte.
    pub const READ: u8 = 124;
    /// IN: 1 once the response has ended.
    pub const COMPLETE: u8 = 125;
    /// OUT: content length low byte.
    pub const LENGTH_LO: u8 = 126;
    /// OUT: content length high byte.
    pub const LENGTH_HI: u8 = 127;

    pub const FIRST: u8 = REQUEST;
    pub const LAST: u8 = LENGTH_HI;
}

/// Text kept per response chunk. One byte less than a chunk, as the legacy
/// side has always seen it.
const RESPONSE_CAPACITY: usize = CHUNK_CAPACITY - 1;

#[derive(Debug, Default)]
struct PortState {
    length_lo: u8,
    content_length: u16,
    length_ready: bool,

    request_pending: bool,
    staging: Vec<u8>,
    body_complete: bool,
    /// Body ended but the end marker is not queued yet.
    end_pending: bool,

    response: Vec<u8>,
    position: usize,
    response_complete: bool,
    status: Status,
}

/// The command-context half of the bridge.
pub struct PortBridge {
    channels: Channels,
    max_content_length: u16,
    state: PortState,
}

impl PortBridge {
    pub fn new(channels: Channels, max_content_length: u16) -> Self {
        PortBridge {
            channels,
            max_content_length,
            state: PortState {
                staging: Vec::with_capacity(BODY_CHUNK_SIZE),
                response: Vec::with_capacity(RESPONSE_CAPACITY),
                ..Default::default()
            },
        }
    }

    pub fn content_length(&self) -> u16 {
        self.state.content_length
    }

    pub fn content_length_ready(&self) -> bool {
        self.state.length_ready
    }

    pub fn request_pending(&self) -> bool {
        self.state.request_pending
    }

    /// Last status reported on the status port.
    pub fn status(&self) -> Status {
        self.state.status
    }

    // ////////////////////////////////////////////////////////////////////////////////// REQUEST

    /// Forget everything about the current request and response.
    ///
    /// The network context is not waited for. Advancing the generation tells
    /// it that whatever it is working on is no longer wanted.
    pub fn reset_request(&mut self) {
        let generation = self.channels.advance_generation();
        debug!("Reset request, generation {}", generation);

        let staging = std::mem::take(&mut self.state.staging);
        let response = std::mem::take(&mut self.state.response);
        self.state = PortState {
            staging,
            response,
            ..Default::default()
        };
        self.state.staging.clear();
        self.state.response.clear();

        self.channels.drain_all();
    }

    pub fn set_length_lo(&mut self, value: u8) {
        self.state.length_lo = value;
        trace!("Content length low byte {}", value);
    }

    /// Complete the content length. Lengths above the maximum are refused
    /// and leave the register unarmed.
    pub fn set_length_hi(&mut self, value: u8) -> Result<(), Error> {
        let length = u32::from(self.state.length_lo) | (u32::from(value) << 8);

        if length > u32::from(self.max_content_length) {
            self.state.content_length = 0;
            self.state.length_ready = false;
            return Err(Error::ContentLengthTooLarge(
                length,
                self.max_content_length,
            ));
        }

        self.state.content_length = length as u16;
        self.state.length_ready = true;
        debug!("Content length {}", length);

        Ok(())
    }

    /// Queue the request start. Returns `false` if no length is armed, the
    /// previous response has not been reset, or the request queue is full.
    pub fn trigger(&mut self) -> bool {
        let s = &mut self.state;

        if !s.length_ready || s.content_length == 0 {
            debug!("Trigger ignored, content length not set");
            return false;
        }

        if s.response_complete {
            debug!("Trigger ignored, previous response not reset");
            return false;
        }

        let start = RequestStart {
            content_length: usize::from(s.content_length),
            abort: false,
            generation: self.channels.generation(),
        };

        if self.channels.requests.try_push(start).is_err() {
            warn!("Request queue full, trigger refused");
            return false;
        }

        info!(
            "Request queued ({} bytes, generation {})",
            start.content_length, start.generation
        );

        s.length_ready = false;
        s.request_pending = true;
        s.status = Status::Waiting;

        // A new body, even when only the response was reset since the last one.
        s.staging.clear();
        s.body_complete = false;
        s.end_pending = false;

        true
    }

    /// Abandon the request in flight without waiting for the network context.
    pub fn abort(&mut self) {
        let generation = self.channels.advance_generation();

        let start = RequestStart {
            content_length: 0,
            abort: true,
            generation,
        };
        if self.channels.requests.try_push(start).is_err() {
            debug!("Request queue full, abort carried by generation only");
        }

        self.state.staging.clear();
        self.state.end_pending = false;
        self.state.request_pending = false;
        self.finish(Status::Failed);

        info!("Request aborted, generation {}", generation);
    }

    // ///////////////////////////////////////////////////////////////////////////////////// BODY

    /// Append one body byte. NUL ends the body.
    pub fn append_body_byte(&mut self, byte: u8) {
        if self.state.response_complete || self.state.body_complete {
            trace!("Body byte after end of body/response ignored");
            return;
        }

        if byte == 0 {
            self.state.body_complete = true;
            self.state.end_pending = true;
            debug!("Body complete");
            self.flush_body();
            return;
        }

        // A staged chunk that still could not be queued is retried first.
        self.flush_body();

        if self.state.staging.len() >= BODY_CHUNK_SIZE {
            error!("Body byte arrived with staging buffer and body queue full");
            self.overflow();
            return;
        }

        self.state.staging.push(byte);

        if self.state.staging.len() >= BODY_CHUNK_SIZE {
            self.flush_body();
        }
    }

    /// Move staged bytes, and the end marker if due, into the body queue.
    fn flush_body(&mut self) {
        let generation = self.channels.generation();
        let s = &mut self.state;

        let full = s.staging.len() >= BODY_CHUNK_SIZE;
        if !s.staging.is_empty() && (full || s.end_pending) {
            let chunk = Chunk::data(&s.staging, generation);
            if self.channels.body.try_push(chunk).is_err() {
                trace!("Body queue full, {} bytes stay staged", s.staging.len());
                return;
            }
            trace!("Queued body chunk ({} bytes)", s.staging.len());
            s.staging.clear();
        }

        if s.end_pending {
            let marker = Chunk::status(Status::Eof, generation);
            if self.channels.body.try_push(marker).is_err() {
                trace!("Body queue full, end marker deferred");
                return;
            }
            s.end_pending = false;
            debug!("Queued end of body");
        }
    }

    /// Outbound body path cannot take more bytes right now.
    fn body_busy(&self) -> bool {
        let s = &self.state;
        self.channels.body.is_full() || s.staging.len() >= BODY_CHUNK_SIZE || s.end_pending
    }

    fn overflow(&mut self) {
        // The network side would wait for bytes that never come.
        self.channels.advance_generation();
        self.state.staging.clear();
        self.state.end_pending = false;
        self.finish(Status::Failed);
    }

    // ///////////////////////////////////////////////////////////////////////////////// RESPONSE

    pub fn reset_response(&mut self) {
        let s = &mut self.state;
        s.response.clear();
        s.position = 0;
        s.response_complete = false;
        s.status = Status::Waiting;

        let dropped = self.channels.inbound.drain();
        debug!("Reset response, dropped {} chunks", dropped);
    }

    /// Status for the legacy side. Never consumes a response byte.
    pub fn poll_status(&mut self) -> Status {
        self.flush_body();

        if !self.has_unread() && !self.state.response_complete {
            self.advance();
        }

        let status = if self.state.response_complete && !self.has_unread() {
            self.state.status
        } else if self.body_busy() {
            Status::Busy
        } else if self.has_unread() {
            Status::DataReady
        } else {
            Status::Waiting
        };

        trace!("Status {:?}", status);
        status
    }

    /// Next response byte, or 0 if there is none. Moves on to the next queued
    /// chunk once the current one is used up.
    pub fn read_byte(&mut self) -> u8 {
        if !self.has_unread() {
            return 0;
        }

        let byte = self.state.response[self.state.position];
        self.state.position += 1;

        if !self.has_unread() {
            self.state.response.clear();
            self.state.position = 0;
            if !self.state.response_complete {
                self.advance();
            }
        }

        byte
    }

    pub fn is_complete(&self) -> bool {
        self.state.response_complete
    }

    fn has_unread(&self) -> bool {
        self.state.position < self.state.response.len()
    }

    /// Take at most one chunk of the current generation off the inbound queue.
    fn advance(&mut self) {
        let generation = self.channels.generation();

        let chunk = loop {
            match self.channels.inbound.try_pop() {
                Some(c) if c.generation() != generation => {
                    debug!(
                        "Dropped stale chunk (generation {} != {})",
                        c.generation(),
                        generation
                    );
                }
                Some(c) => break c,
                None => {
                    if self.state.status == Status::DataReady {
                        self.state.status = Status::Waiting;
                    }
                    return;
                }
            }
        };

        match chunk.status_tag() {
            Status::Eof | Status::Failed => self.finish(chunk.status_tag()),
            Status::DataReady if !chunk.is_empty() => {
                match token::parse(chunk.as_bytes(), RESPONSE_CAPACITY) {
                    Token::Finished => self.finish(Status::Eof),
                    Token::Text(text) => {
                        trace!("Token ({} bytes)", text.len());
                        self.state.response.clear();
                        self.state.response.extend_from_slice(&text);
                        self.state.position = 0;
                        self.state.status = Status::DataReady;
                    }
                    Token::Empty => {
                        trace!("Frame without content");
                        self.state.status = Status::Waiting;
                    }
                }
            }
            other => debug!("Ignored inbound chunk {:?}", other),
        }
    }

    fn finish(&mut self, status: Status) {
        let s = &mut self.state;
        if !s.response_complete {
            info!("Response ended: {:?}", status);
        }
        s.response_complete = true;
        s.request_pending = false;
        s.status = status;
    }
}

impl PortDevice for PortBridge {
    fn handles(&self, port: u8) -> bool {
        (ports::FIRST..=ports::LAST).contains(&port)
    }

    fn output(&mut self, port: u8, value: u8) {
        match port {
            ports::REQUEST => self.reset_request(),
            ports::BODY => self.append_body_byte(value),
            ports::RESPONSE => self.reset_response(),
            ports::LENGTH_LO => self.set_length_lo(value),
            ports::LENGTH_HI => {
                if let Err(e) = self.set_length_hi(value) {
                    warn!("{}", e);
                }
            }
            _ => trace!("OUT {} ignored", port),
        }
    }

    fn input(&mut self, port: u8) -> u8 {
        match port {
            ports::REQUEST => self.trigger() as u8,
            ports::BODY => self.state.content_length.to_le_bytes()[0],
            ports::RESPONSE => self.state.content_length.to_le_bytes()[1],
            ports::STATUS => self.poll_status().as_byte(),
            ports::READ => self.read_byte(),
            ports::COMPLETE => self.is_complete() as u8,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::QueueSizes;

    fn bridge() -> (PortBridge, Channels) {
        let channels = Channels::new(&QueueSizes::default());
        (PortBridge::new(channels.clone(), 32768), channels)
    }

    fn set_length(p: &mut PortBridge, len: u16) {
        let [lo, hi] = len.to_le_bytes();
        p.output(ports::LENGTH_LO, lo);
        p.output(ports::LENGTH_HI, hi);
    }

    fn respond(ch: &Channels, payload: &str) {
        ch.inbound
            .try_push(Chunk::data(payload.as_bytes(), ch.generation()))
            .unwrap();
    }

    fn read_all(p: &mut PortBridge) -> String {
        let mut out = vec![];
        while p.input(ports::STATUS) == Status::DataReady.as_byte() {
            out.push(p.input(ports::READ));
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn length_registers() {
        let (mut p, _) = bridge();
        set_length(&mut p, 300);
        assert!(p.content_length_ready());
        assert_eq!(p.input(ports::BODY), 44);
        assert_eq!(p.input(ports::RESPONSE), 1);
    }

    #[test]
    fn oversized_length_rejected() {
        let (mut p, ch) = bridge();
        set_length(&mut p, 40000);
        assert!(!p.content_length_ready());
        assert_eq!(p.content_length(), 0);
        assert_eq!(p.input(ports::REQUEST), 0);
        assert!(ch.requests.is_empty());

        p.set_length_lo(0);
        assert!(matches!(
            p.set_length_hi(0x9c),
            Err(Error::ContentLengthTooLarge(39936, 32768))
        ));

        // The maximum itself is fine.
        set_length(&mut p, 32768);
        assert!(p.content_length_ready());
    }

    #[test]
    fn trigger_needs_length() {
        let (mut p, ch) = bridge();
        assert_eq!(p.input(ports::REQUEST), 0);

        set_length(&mut p, 0);
        assert_eq!(p.input(ports::REQUEST), 0);

        set_length(&mut p, 5);
        assert_eq!(p.input(ports::REQUEST), 1);
        assert!(p.request_pending());

        let start = ch.requests.try_pop().unwrap();
        assert_eq!(start.content_length, 5);
        assert!(!start.abort);
        assert_eq!(start.generation, ch.generation());

        // Length is consumed by the trigger.
        assert_eq!(p.input(ports::REQUEST), 0);
    }

    #[test]
    fn body_bytes_staged_and_flushed_on_nul() {
        let (mut p, ch) = bridge();
        for b in b"hello" {
            p.output(ports::BODY, *b);
        }
        assert!(ch.body.is_empty());

        p.output(ports::BODY, 0);
        let c = ch.body.try_pop().unwrap();
        assert_eq!(c.as_bytes(), b"hello");
        assert!(ch.body.try_pop().unwrap().is_end_of_body());
    }

    #[test]
    fn full_staging_flushes_chunk() {
        let (mut p, ch) = bridge();
        for _ in 0..BODY_CHUNK_SIZE {
            p.output(ports::BODY, b'a');
        }
        assert_eq!(ch.body.len(), 1);
        assert_eq!(ch.body.try_pop().unwrap().len(), BODY_CHUNK_SIZE);
    }

    #[test]
    fn busy_while_body_path_full() {
        let (mut p, ch) = bridge();

        // Two chunks fill the body queue, a third stays staged.
        for _ in 0..BODY_CHUNK_SIZE * 3 {
            p.output(ports::BODY, b'a');
        }
        assert!(ch.body.is_full());
        assert_eq!(p.input(ports::STATUS), Status::Busy.as_byte());

        // The network side takes one, the staged chunk moves on.
        ch.body.try_pop().unwrap();
        assert_eq!(p.input(ports::STATUS), Status::Busy.as_byte());
        assert!(ch.body.is_full());

        ch.body.try_pop().unwrap();
        assert_eq!(p.input(ports::STATUS), Status::Waiting.as_byte());
    }

    #[test]
    fn deferred_end_marker() {
        let (mut p, ch) = bridge();
        for _ in 0..BODY_CHUNK_SIZE * 2 {
            p.output(ports::BODY, b'a');
        }
        p.output(ports::BODY, 0);
        assert_eq!(p.input(ports::STATUS), Status::Busy.as_byte());

        // The marker takes the freed slot, the queue is full again.
        ch.body.try_pop().unwrap();
        assert_eq!(p.input(ports::STATUS), Status::Busy.as_byte());

        assert_eq!(ch.body.try_pop().unwrap().len(), BODY_CHUNK_SIZE);
        assert!(ch.body.try_pop().unwrap().is_end_of_body());
        assert_eq!(p.input(ports::STATUS), Status::Waiting.as_byte());
    }

    #[test]
    fn trigger_starts_new_body() {
        let (mut p, ch) = bridge();
        set_length(&mut p, 3);
        assert!(p.trigger());
        for b in b"abc\0" {
            p.output(ports::BODY, *b);
        }
        ch.body.drain();
        ch.inbound
            .try_push(Chunk::status(Status::Eof, ch.generation()))
            .unwrap();
        assert_eq!(p.input(ports::STATUS), Status::Eof.as_byte());

        // Response reset only, the previous body stays ended until a trigger.
        p.output(ports::RESPONSE, 0);
        set_length(&mut p, 2);
        assert!(p.trigger());
        for b in b"xy\0" {
            p.output(ports::BODY, *b);
        }

        assert_eq!(ch.body.try_pop().unwrap().as_bytes(), b"xy");
        assert!(ch.body.try_pop().unwrap().is_end_of_body());
    }

    #[test]
    fn byte_into_full_staging_fails() {
        let (mut p, ch) = bridge();
        let generation = ch.generation();
        for _ in 0..BODY_CHUNK_SIZE * 3 + 1 {
            p.output(ports::BODY, b'a');
        }
        assert_eq!(p.input(ports::STATUS), Status::Failed.as_byte());
        assert_eq!(p.input(ports::COMPLETE), 1);
        assert_ne!(ch.generation(), generation);
    }

    #[test]
    fn response_tokens_read_in_order() {
        let (mut p, ch) = bridge();
        respond(&ch, r#"{"choices":[{"delta":{"role":"assistant"}}]}"#);
        respond(&ch, r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        respond(&ch, r#"{"choices":[{"delta":{"content":"lo"}}]}"#);
        respond(&ch, r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);

        // Role-only frame reads as waiting.
        assert_eq!(p.input(ports::STATUS), Status::Waiting.as_byte());

        let mut text = String::new();
        loop {
            match Status::try_from(p.input(ports::STATUS)).unwrap() {
                Status::DataReady => text.push(p.input(ports::READ) as char),
                Status::Eof => break,
                s => panic!("unexpected {:?}", s),
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(p.input(ports::COMPLETE), 1);
    }

    #[test]
    fn status_read_does_not_consume() {
        let (mut p, ch) = bridge();
        respond(&ch, r#"{"content":"ab"}"#);
        for _ in 0..5 {
            assert_eq!(p.input(ports::STATUS), Status::DataReady.as_byte());
        }
        assert_eq!(read_all(&mut p), "ab");
    }

    #[test]
    fn terminal_status_sticks() {
        let (mut p, ch) = bridge();
        ch.inbound
            .try_push(Chunk::status(Status::Failed, ch.generation()))
            .unwrap();
        respond(&ch, r#"{"content":"late"}"#);

        assert_eq!(p.input(ports::STATUS), Status::Failed.as_byte());
        assert_eq!(p.input(ports::STATUS), Status::Failed.as_byte());
        assert_eq!(p.input(ports::READ), 0);

        // Trigger needs a reset first.
        set_length(&mut p, 3);
        assert_eq!(p.input(ports::REQUEST), 0);
        p.output(ports::RESPONSE, 0);
        assert_eq!(p.input(ports::REQUEST), 1);
    }

    #[test]
    fn reset_between_requests() {
        let (mut p, ch) = bridge();
        respond(&ch, r#"{"content":"from A"}"#);
        assert_eq!(p.input(ports::STATUS), Status::DataReady.as_byte());
        p.input(ports::READ);

        let stale = ch.generation();
        p.output(ports::REQUEST, 0);

        // A late chunk from request A arrives after the reset.
        ch.inbound
            .try_push(Chunk::data(br#"{"content":"stale"}"#, stale))
            .unwrap();

        assert_eq!(p.input(ports::STATUS), Status::Waiting.as_byte());
        assert_eq!(p.input(ports::READ), 0);
        assert!(ch.inbound.is_empty());
    }

    #[test]
    fn abort_queues_descriptor() {
        let (mut p, ch) = bridge();
        set_length(&mut p, 10);
        assert!(p.trigger());
        ch.requests.try_pop();

        let before = ch.generation();
        p.abort();

        let start = ch.requests.try_pop().unwrap();
        assert!(start.abort);
        assert_eq!(start.generation, before + 1);
        assert_eq!(p.poll_status(), Status::Failed);
        assert!(!p.request_pending());
    }

    #[test]
    fn device_claims_its_ports() {
        let (p, _) = bridge();
        assert!(!p.handles(119));
        assert!((120..=127).all(|port| p.handles(port)));
        assert!(!p.handles(128));
    }
}
