//! Bounded queues between the command context and the network context.
//!
//! Neither side ever blocks: a push into a full queue hands the value back,
//! a pop from an empty queue returns `None`. FIFO order within a queue is the
//! only ordering guarantee between the contexts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::QueueSizes;
use crate::Chunk;

/// Inbound slots kept free for the terminal EOF/FAILED status.
pub const STATUS_RESERVE: usize = 2;

/// Fixed-capacity FIFO shared between the two contexts.
pub struct Queue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Queue {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panicking peer must not take the other context down with it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push without blocking. A full queue returns the value.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut q = self.lock();
        if q.len() >= self.capacity {
            return Err(value);
        }
        q.push_back(value);
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Discard everything queued. Returns the number of dropped entries.
    pub fn drain(&self) -> usize {
        let mut q = self.lock();
        let n = q.len();
        q.clear();
        n
    }

    /// Pop the front entry only if `accept` takes it. The check and the pop
    /// happen under one lock.
    pub fn try_pop_if<F>(&self, accept: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut q = self.lock();
        if accept(q.front()?) {
            q.pop_front()
        } else {
            None
        }
    }

    /// Discard entries from the front until `discard` refuses one. Returns
    /// the number of dropped entries.
    pub fn drain_while<F>(&self, mut discard: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut q = self.lock();
        let mut n = 0;
        while q.front().map_or(false, &mut discard) {
            q.pop_front();
            n += 1;
        }
        n
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

/// Whether `generation` was started after `than`. Generations wrap.
pub(crate) fn is_newer(generation: u32, than: u32) -> bool {
    (generation.wrapping_sub(than) as i32) > 0
}

/// Request-start message, command context to network context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStart {
    /// Declared body length, sent as `Content-Length`.
    pub content_length: usize,
    /// Abandon the current exchange instead of starting one.
    pub abort: bool,
    /// Generation the request belongs to.
    pub generation: u32,
}

/// The three queues plus the shared request generation.
///
/// Both contexts hold a clone. The command context advances the generation on
/// reset, abort and body overflow, which tells the network context that
/// whatever it is doing has been superseded.
#[derive(Clone)]
pub struct Channels {
    pub(crate) requests: Queue<RequestStart>,
    pub(crate) body: Queue<Chunk>,
    pub(crate) inbound: Queue<Chunk>,
    generation: Arc<AtomicU32>,
}

impl Channels {
    pub fn new(sizes: &QueueSizes) -> Self {
        Channels {
            requests: Queue::new(sizes.requests),
            body: Queue::new(sizes.body),
            // Data needs at least one slot on top of the status reserve.
            inbound: Queue::new(sizes.inbound.max(STATUS_RESERVE + 2)),
            generation: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation, returning it.
    pub(crate) fn advance_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Whether `chunks` data chunks can be queued inbound while still leaving
    /// `reserve` slots for status messages.
    pub(crate) fn inbound_has_space(&self, chunks: usize, reserve: usize) -> bool {
        self.inbound.free() >= chunks + reserve
    }

    pub(crate) fn drain_all(&self) {
        let inbound = self.inbound.drain();
        let body = self.body.drain();
        let requests = self.requests.drain();
        debug!(
            "Drained queues: inbound {}, body {}, requests {}",
            inbound, body, requests
        );
    }
}
