//! Streaming chat-completion client
//!
//! The [`Engine`] owns one connection at a time and moves it through a fixed
//! set of states. It never blocks: every [`Engine::poll`] does at most one
//! unit of work, and "not yet" simply means staying in the same state until
//! the next poll.
//!
//! The states are:
//!
//! * **Idle** - Waiting for a request start on the request queue.
//! * **Resolving** - Name resolution, bounded by the resolve timeout.
//! * **Connecting** - One transport connect, never re-issued.
//! * **Handshake** - TLS handshake, where "would block" is not an error.
//! * **SendingHeaders** - Request line and headers, resumed at an offset
//!   across polls.
//! * **StreamingBody** - Body chunks from the body queue, a partially
//!   written chunk is always finished first.
//! * **Receiving** - Decrypt into the response buffer and slice it into SSE
//!   frames for the inbound queue.
//! * **Done** / **Error** - Emit exactly one EOF or FAILED, tear down.
//!
//! ```text
//!                            ┌──────────────────┐
//! ┌ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ▶│       Idle       │
//!                            └──────────────────┘
//! │                                    │
//!                                      ▼
//! │                          ┌──────────────────┐
//!                            │    Resolving     │─ ─ ─ ─ ─ ─ ─ ─ ─ ─
//! │                          └──────────────────┘                   │
//!                                      │
//! │                                    ▼                            │
//!                            ┌──────────────────┐
//! │                          │    Connecting    │─ ─ ─ ─ ─ ─ ─ ─ ─ ─┤
//!                            └──────────────────┘
//! │                                    │                            │
//!                                      ▼
//! │                          ┌──────────────────┐                   │
//!                            │    Handshake     │─ ─ ─ ─ ─ ─ ─ ─ ─ ─
//! │                          └──────────────────┘                   │
//!                                      │
//! │                                    ▼                            │
//!                            ┌──────────────────┐
//! │                          │  SendingHeaders  │─ ─ ─ ─ ─ ─ ─ ─ ─ ─┤
//!                            └──────────────────┘
//! │                                    │                            │
//!                                      ▼
//! │                          ┌──────────────────┐                   │
//!                            │  StreamingBody   │─ ─ ─ ─ ─ ─ ─ ─ ─ ─
//! │                          └──────────────────┘                   │
//!                                      │
//! │                                    ▼                            │
//!                            ┌──────────────────┐
//! │                          │    Receiving     │─ ─ ─ ─ ─ ─ ─ ─ ─ ─┤
//!                            └──────────────────┘
//! │                                    │                            │
//!                                      ▼                            ▼
//! │                          ┌──────────────────┐         ┌──────────────────┐
//!  ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ │       Done       │         │      Error       │
//!                            └──────────────────┘         └──────────────────┘
//! ```
//!
//! Failures and timeouts take the edges on the right. Done and Error both
//! return to Idle once their status is queued. The request timeout spans
//! everything from Resolving to the end of Receiving. A reset on the port
//! side supersedes the request, which returns the engine straight to Idle
//! without emitting a status.

mod engine;
pub use engine::{Engine, Stats};

mod state;
pub use state::State;

mod prelude;

#[cfg(test)]
mod test;
