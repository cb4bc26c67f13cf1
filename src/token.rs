//! Incremental text extraction from one chat-completion event payload.
//!
//! This is a targeted scan, not a JSON parser. It looks for exactly two keys
//! anywhere in the payload and does not track nesting.

use crate::util::{find, skip_blanks};

const FINISH_REASON: &[u8] = b"\"finish_reason\":";
const CONTENT: &[u8] = b"\"content\":";

/// What one payload means to the reader of the response ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A non-null `finish_reason`, the response is complete.
    Finished,
    /// Decoded `content` text.
    Text(Vec<u8>),
    /// Neither field carries anything.
    Empty,
}

/// Scan `payload`, keeping at most `capacity` bytes of text.
pub fn parse(payload: &[u8], capacity: usize) -> Token {
    if is_finished(payload) {
        return Token::Finished;
    }

    match content(payload, capacity) {
        Some(text) if !text.is_empty() => Token::Text(text),
        _ => Token::Empty,
    }
}

fn is_finished(payload: &[u8]) -> bool {
    let Some(at) = find(payload, FINISH_REASON) else {
        return false;
    };
    let value = skip_blanks(&payload[at + FINISH_REASON.len()..]);
    !value.is_empty() && !value.starts_with(b"null")
}

fn content(payload: &[u8], capacity: usize) -> Option<Vec<u8>> {
    let at = find(payload, CONTENT)?;
    let value = skip_blanks(&payload[at + CONTENT.len()..]);

    // `null` or any other non-string value.
    let value = value.strip_prefix(b"\"")?;

    let mut out = Vec::with_capacity(value.len().min(capacity));
    let mut truncated = false;
    let mut iter = value.iter();

    while let Some(c) = iter.next() {
        let decoded: &[u8] = match c {
            b'"' => break,
            b'\\' => match iter.next() {
                Some(b'n') => b"\n",
                Some(b'r') => b"\r",
                Some(b't') => b"\t",
                Some(b'"') => b"\"",
                Some(b'\\') => b"\\",
                // Unknown escapes are kept as written.
                Some(other) => {
                    push_limited(&mut out, &[b'\\', *other], capacity, &mut truncated);
                    continue;
                }
                None => b"\\",
            },
            _ => core::slice::from_ref(c),
        };
        push_limited(&mut out, decoded, capacity, &mut truncated);
    }

    if truncated {
        warn!("Content truncated to {} bytes", capacity);
    }

    Some(out)
}

fn push_limited(out: &mut Vec<u8>, bytes: &[u8], capacity: usize, truncated: &mut bool) {
    let room = capacity.saturating_sub(out.len());
    if bytes.len() > room {
        *truncated = true;
    }
    out.extend_from_slice(&bytes[..bytes.len().min(room)]);
}
