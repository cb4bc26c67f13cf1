use core::fmt;

/// Lifecycle of the one in-flight connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    Resolving,
    Connecting,
    Handshake,
    SendingHeaders,
    StreamingBody,
    Receiving,
    Done,
    Error,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Resolving => "RESOLVING",
            State::Connecting => "CONNECTING",
            State::Handshake => "HANDSHAKE",
            State::SendingHeaders => "SENDING_HEADERS",
            State::StreamingBody => "STREAMING_BODY",
            State::Receiving => "RECEIVING",
            State::Done => "DONE",
            State::Error => "ERROR",
        }
    }

    /// States the request timeout applies to.
    pub fn is_active(&self) -> bool {
        !matches!(self, State::Idle | State::Done | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
