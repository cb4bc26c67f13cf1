//! Server-Sent-Events frame extraction over the decrypted response buffer.
//!
//! The decoder owns the buffer that TLS decrypts into. It first strips the
//! HTTP response head, then repeatedly slices complete event frames off the
//! front and hands their `data:` payload to the inbound queue. A frame that
//! cannot be queued is put back exactly as it was, which is what holds the
//! decrypt rate to the consumer's pace.

use std::borrow::Cow;
use std::io;
use std::mem;

use http::StatusCode;

use crate::channel::{Channels, STATUS_RESERVE};
use crate::chunk::{Chunk, CHUNK_CAPACITY};
use crate::util::{find, find_blank_line, skip_blanks, trim_line_end};

const MAX_HEADERS: usize = 32;

/// Outcome of one extraction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// No complete frame left in the buffer.
    Drained,
    /// The inbound queue is full, the current frame went back in the buffer.
    Blocked,
    /// `[DONE]` was seen.
    Done,
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Queued,
    Skipped,
    Done,
    Full,
}

/// A frame taken off the buffer, with the delimiter that ended it.
struct Frame {
    bytes: Vec<u8>,
    delimiter: &'static [u8],
}

pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    capacity: usize,
    head_done: bool,
    status: Option<StatusCode>,
    done: bool,
    largest_frame: usize,
    high_water: usize,
}

impl SseDecoder {
    pub fn new(capacity: usize) -> Self {
        SseDecoder {
            buf: Vec::with_capacity(capacity),
            capacity,
            head_done: false,
            status: None,
            done: false,
            largest_frame: 0,
            high_water: 0,
        }
    }

    /// Forget everything from the previous response, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.head_done = false;
        self.status = None;
        self.done = false;
        self.largest_frame = 0;
        self.high_water = 0;
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Free space for more decrypted bytes.
    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    #[cfg(test)]
    pub fn head_complete(&self) -> bool {
        self.head_done
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn largest_frame(&self) -> usize {
        self.largest_frame
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Let `read` write into the free tail of the buffer.
    pub fn fill<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let start = self.buf.len();
        self.buf.resize(self.capacity, 0);

        let result = read(&mut self.buf[start..]);
        let n = match &result {
            Ok(n) => (*n).min(self.capacity - start),
            Err(_) => 0,
        };
        self.buf.truncate(start + n);

        if self.buf.len() > self.high_water {
            self.high_water = self.buf.len();
        }
        if n > 0 && self.buf.len() > self.capacity * 3 / 4 {
            debug!(
                "Response buffer at {}% ({}/{})",
                self.buf.len() * 100 / self.capacity,
                self.buf.len(),
                self.capacity
            );
        }

        result
    }

    /// Deliver every complete frame the inbound queue has room for.
    pub fn process(&mut self, channels: &Channels, generation: u32) -> Progress {
        if self.done {
            return Progress::Done;
        }

        if !self.head_done && !self.parse_head() {
            return Progress::Drained;
        }

        while let Some(frame) = self.pop_frame() {
            match self.deliver(&frame.bytes, channels, generation, STATUS_RESERVE) {
                Delivery::Full => {
                    self.requeue(frame);
                    return Progress::Blocked;
                }
                Delivery::Done => return Progress::Done,
                Delivery::Queued | Delivery::Skipped => {}
            }
        }

        Progress::Drained
    }

    /// Deliver trailing unterminated content as one last frame.
    ///
    /// Returns `false` when the inbound queue cannot take it yet, in which
    /// case the content stays buffered for another attempt.
    pub fn flush(&mut self, channels: &Channels, generation: u32) -> bool {
        if self.done || self.buf.is_empty() {
            return true;
        }

        if !self.head_done {
            debug!("Discarding {} bytes of incomplete response head", self.buf.len());
            self.buf.clear();
            return true;
        }

        let rest = mem::take(&mut self.buf);
        debug!("Flushing {} bytes as final frame", rest.len());

        // The final frame may use one reserved slot, the terminal status
        // needs the other.
        match self.deliver(&rest, channels, generation, 1) {
            Delivery::Full => {
                self.buf = rest;
                false
            }
            _ => true,
        }
    }

    fn parse_head(&mut self) -> bool {
        let (at, delimiter) = match find_blank_line(&self.buf) {
            Some(v) => v,
            None => return false,
        };
        let end = at + delimiter.len();

        self.status = parse_status(&self.buf[..end]);
        match self.status {
            Some(s) if s.is_success() => info!("HTTP {}", s.as_u16()),
            Some(s) => warn!("HTTP {}, response is not an event stream", s.as_u16()),
            None => warn!("Unparsable response status line"),
        }

        self.buf.drain(..end);
        self.head_done = true;

        true
    }

    fn pop_frame(&mut self) -> Option<Frame> {
        let (at, delimiter) = find_blank_line(&self.buf)?;

        let bytes = self.buf[..at].to_vec();
        self.buf.drain(..at + delimiter.len());

        if at > self.largest_frame {
            self.largest_frame = at;
        }
        trace!("Popped frame ({} bytes)", at);

        Some(Frame { bytes, delimiter })
    }

    fn requeue(&mut self, frame: Frame) {
        // The frame and its delimiter were just removed, so this always fits.
        let needed = frame.bytes.len() + frame.delimiter.len();
        if self.buf.len() + needed > self.capacity {
            error!("Response buffer full, frame lost ({} bytes)", frame.bytes.len());
            return;
        }

        let restored = frame.bytes.iter().chain(frame.delimiter).copied();
        self.buf.splice(0..0, restored);

        debug!("Backpressure: put back frame ({} bytes)", frame.bytes.len());
    }

    fn deliver(
        &mut self,
        frame: &[u8],
        channels: &Channels,
        generation: u32,
        reserve: usize,
    ) -> Delivery {
        let data = match event_data(frame) {
            Some(v) => v,
            None => {
                trace!("Frame without data field");
                return Delivery::Skipped;
            }
        };
        let payload = trim_line_end(&data);

        if payload.starts_with(b"[DONE]") {
            info!("Stream complete");
            self.done = true;
            return Delivery::Done;
        }

        if payload.is_empty() {
            return Delivery::Skipped;
        }

        if !channels.inbound_has_space(1, reserve) {
            debug!("Inbound queue full, applying backpressure");
            return Delivery::Full;
        }

        if !Chunk::fits(payload.len()) {
            warn!(
                "SSE payload truncated ({} > {})",
                payload.len(),
                CHUNK_CAPACITY
            );
        }

        match channels.inbound.try_push(Chunk::data(payload, generation)) {
            Ok(()) => {
                trace!("Queued payload ({} bytes)", payload.len());
                Delivery::Queued
            }
            Err(_) => Delivery::Full,
        }
    }
}

/// The `data:` value of an event. Several data lines are joined with `\n`.
fn event_data(frame: &[u8]) -> Option<Cow<'_, [u8]>> {
    let mut values = frame
        .split(|c| *c == b'\n')
        .filter_map(|line| line.strip_prefix(b"data:"))
        .map(|v| trim_line_end(skip_blanks(v)));

    let first = values.next()?;

    let mut joined: Option<Vec<u8>> = None;
    for more in values {
        let j = joined.get_or_insert_with(|| first.to_vec());
        j.push(b'\n');
        j.extend_from_slice(more);
    }

    Some(match joined {
        Some(v) => Cow::Owned(v),
        None => Cow::Borrowed(first),
    })
}

fn parse_status(head: &[u8]) -> Option<StatusCode> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let code = match res.parse(head) {
        Ok(_) => {
            for h in res.headers.iter() {
                if h.name.eq_ignore_ascii_case("content-type") {
                    debug!("Content-Type: {}", String::from_utf8_lossy(h.value));
                }
            }
            res.code
        }
        Err(e) => {
            debug!("Response head parse failed ({}), reading status line only", e);
            status_line_code(head)
        }
    };

    code.and_then(|c| StatusCode::from_u16(c).ok())
}

fn status_line_code(head: &[u8]) -> Option<u16> {
    let line = &head[find(head, b"HTTP/")?..];
    let sp = line.iter().position(|c| *c == b' ')?;
    let rest = &line[sp + 1..];
    let digits = rest.iter().take_while(|c| c.is_ascii_digit()).count();
    core::str::from_utf8(&rest[..digits]).ok()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::QueueSizes;
    use crate::Status;

    const HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n";

    fn channels(inbound: usize) -> Channels {
        Channels::new(&QueueSizes {
            requests: 2,
            body: 2,
            inbound,
        })
    }

    fn feed(d: &mut SseDecoder, data: &[u8]) {
        let n = d
            .fill(|buf| {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            })
            .unwrap();
        assert_eq!(n, data.len(), "test data larger than buffer space");
    }

    fn payloads(ch: &Channels) -> Vec<String> {
        let mut v = vec![];
        while let Some(c) = ch.inbound.try_pop() {
            assert_eq!(c.status_tag(), Status::DataReady);
            v.push(String::from_utf8(c.as_bytes().to_vec()).unwrap());
        }
        v
    }

    #[test]
    fn head_then_frame() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);

        feed(&mut d, HEAD);
        feed(&mut d, b"data: {\"a\":1}\n\n");

        assert_eq!(d.process(&ch, 7), Progress::Drained);
        assert!(d.head_complete());
        assert_eq!(d.status(), Some(StatusCode::OK));
        assert!(d.is_empty());

        let c = ch.inbound.try_pop().unwrap();
        assert_eq!(c.as_bytes(), b"{\"a\":1}");
        assert_eq!(c.generation(), 7);
    }

    #[test]
    fn incomplete_head_waits() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);

        feed(&mut d, b"HTTP/1.1 200 OK\r\nContent-Ty");
        assert_eq!(d.process(&ch, 0), Progress::Drained);
        assert!(!d.head_complete());
        assert!(ch.inbound.is_empty());
    }

    #[test]
    fn frame_split_across_reads() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);

        feed(&mut d, b"data: hel");
        assert_eq!(d.process(&ch, 0), Progress::Drained);
        assert!(ch.inbound.is_empty());

        feed(&mut d, b"lo\n");
        assert_eq!(d.process(&ch, 0), Progress::Drained);
        assert!(ch.inbound.is_empty());

        feed(&mut d, b"\ndata: next\n\n");
        assert_eq!(d.process(&ch, 0), Progress::Drained);
        assert_eq!(payloads(&ch), vec!["hello", "next"]);
    }

    #[test]
    fn crlf_delimiters() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        feed(&mut d, b"data: one\r\n\r\ndata: two\r\n\r\n");

        d.process(&ch, 0);
        assert_eq!(payloads(&ch), vec!["one", "two"]);
    }

    #[test]
    fn done_stops_extraction() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        feed(&mut d, b"data: a\n\ndata: [DONE]\n\ndata: late\n\n");

        assert_eq!(d.process(&ch, 0), Progress::Done);
        assert!(d.is_done());
        assert_eq!(payloads(&ch), vec!["a"]);

        // Nothing after [DONE] is ever forwarded.
        assert_eq!(d.process(&ch, 0), Progress::Done);
        assert!(d.flush(&ch, 0));
        assert!(ch.inbound.is_empty());
    }

    #[test]
    fn backpressure_puts_frame_back() {
        let ch = channels(4);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        d.process(&ch, 0);

        // Free capacity 2, below one chunk plus the reserve.
        ch.inbound.try_push(Chunk::data(b"x", 0)).unwrap();
        ch.inbound.try_push(Chunk::data(b"y", 0)).unwrap();

        let stream = b"data: {\"content\":\"first\"}\r\n\r\ndata: second\n\n";
        feed(&mut d, stream);

        assert_eq!(d.process(&ch, 0), Progress::Blocked);
        assert_eq!(ch.inbound.len(), 2);
        // Buffer is byte-identical to what was decrypted.
        assert_eq!(&d.buf[..], &stream[..]);

        // Consumer catches up.
        ch.inbound.drain();

        assert_eq!(d.process(&ch, 0), Progress::Drained);
        assert_eq!(payloads(&ch), vec!["{\"content\":\"first\"}", "second"]);
    }

    #[test]
    fn flush_trailing_partial() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        feed(&mut d, b"data: whole\n\ndata: tail");

        assert_eq!(d.process(&ch, 0), Progress::Drained);
        assert!(d.flush(&ch, 0));
        assert!(d.is_empty());
        assert_eq!(payloads(&ch), vec!["whole", "tail"]);
    }

    #[test]
    fn flush_waits_for_space() {
        let ch = channels(4);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        feed(&mut d, b"data: tail");
        d.process(&ch, 0);

        for _ in 0..3 {
            ch.inbound.try_push(Chunk::data(b"x", 0)).unwrap();
        }

        assert!(!d.flush(&ch, 0));
        assert_eq!(&d.buf[..], b"data: tail");

        ch.inbound.try_pop();
        assert!(d.flush(&ch, 0));
        assert_eq!(ch.inbound.len(), 3);
    }

    #[test]
    fn flush_without_head_discards() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, b"HTTP/1.1 200");
        assert!(d.flush(&ch, 0));
        assert!(d.is_empty());
        assert!(ch.inbound.is_empty());
    }

    #[test]
    fn comments_and_empty_data_skipped() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        feed(&mut d, b": keep-alive\n\nevent: ping\n\ndata:\n\ndata: real\n\n");

        d.process(&ch, 0);
        assert_eq!(payloads(&ch), vec!["real"]);
    }

    #[test]
    fn multiple_data_lines_joined() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);
        feed(&mut d, b"event: delta\ndata: a\ndata: b\n\n");

        d.process(&ch, 0);
        assert_eq!(payloads(&ch), vec!["a\nb"]);
    }

    #[test]
    fn oversized_payload_truncated() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, HEAD);

        let mut frame = b"data: ".to_vec();
        frame.extend(std::iter::repeat(b'z').take(CHUNK_CAPACITY + 100));
        frame.extend_from_slice(b"\n\n");
        feed(&mut d, &frame);

        d.process(&ch, 0);
        let c = ch.inbound.try_pop().unwrap();
        assert_eq!(c.len(), CHUNK_CAPACITY);
        assert_eq!(d.largest_frame(), CHUNK_CAPACITY + 106);
    }

    #[test]
    fn error_status_body_not_forwarded() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(
            &mut d,
            b"HTTP/1.1 401 Unauthorized\r\nContent-Type: application/json\r\n\r\n{\"error\":{}}",
        );

        d.process(&ch, 0);
        assert_eq!(d.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(d.flush(&ch, 0));
        assert!(ch.inbound.is_empty());
    }

    #[test]
    fn malformed_header_still_reads_status() {
        let ch = channels(8);
        let mut d = SseDecoder::new(2048);
        feed(&mut d, b"HTTP/1.1 200 OK\r\nno colon here\r\n\r\n");

        d.process(&ch, 0);
        assert!(d.head_complete());
        assert_eq!(d.status(), Some(StatusCode::OK));
    }

    #[test]
    fn fill_respects_capacity() {
        let mut d = SseDecoder::new(8);
        let n = d
            .fill(|buf| {
                assert_eq!(buf.len(), 8);
                buf[..3].copy_from_slice(b"abc");
                Ok(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(d.space(), 5);
        assert_eq!(d.high_water(), 3);

        let err = d.fill(|_| Err(io::ErrorKind::WouldBlock.into()));
        assert!(err.is_err());
        assert_eq!(d.len(), 3);
    }
}
