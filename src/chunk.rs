use core::fmt;

use crate::Status;

/// Capacity of one chunk crossing between the contexts.
///
/// Raw SSE payloads of a chat stream are typically 300-400 bytes.
pub const CHUNK_CAPACITY: usize = 512;

/// Size at which the port side flushes staged body bytes into a chunk.
pub const BODY_CHUNK_SIZE: usize = 256;

/// Fixed-capacity message carried by the body and inbound queues.
///
/// Body chunks flow from the command context to the network context and
/// response chunks the other way. A zero-length chunk tagged [`Status::Eof`]
/// terminates a request body.
#[derive(Clone)]
pub struct Chunk {
    data: [u8; CHUNK_CAPACITY],
    len: usize,
    status: Status,
    generation: u32,
}

impl Chunk {
    /// Chunk carrying bytes, truncated to [`CHUNK_CAPACITY`].
    ///
    /// Callers that care about truncation check [`Chunk::fits`] first.
    pub fn data(bytes: &[u8], generation: u32) -> Self {
        let len = bytes.len().min(CHUNK_CAPACITY);
        let mut data = [0; CHUNK_CAPACITY];
        data[..len].copy_from_slice(&bytes[..len]);

        Chunk {
            data,
            len,
            status: Status::DataReady,
            generation,
        }
    }

    /// Status-only chunk, such as the end-of-body marker or a terminal status.
    pub fn status(status: Status, generation: u32) -> Self {
        Chunk {
            data: [0; CHUNK_CAPACITY],
            len: 0,
            status,
            generation,
        }
    }

    pub fn fits(len: usize) -> bool {
        len <= CHUNK_CAPACITY
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn status_tag(&self) -> Status {
        self.status
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The explicit zero-length terminator of a request body.
    pub fn is_end_of_body(&self) -> bool {
        self.status == Status::Eof && self.len == 0
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("status", &self.status)
            .field("len", &self.len)
            .field("generation", &self.generation)
            .finish()
    }
}
