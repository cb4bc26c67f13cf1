use core::fmt;

/// Status codes as seen by the legacy machine on the status port.
///
/// The same tags mark chunks travelling through the cross-context queues.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Stream finished cleanly.
    Eof = 0,
    /// Nothing to read yet.
    #[default]
    Waiting = 1,
    /// Response bytes are available.
    DataReady = 2,
    /// The request failed. Terminal until reset.
    Failed = 3,
    /// Outbound body path is full, pause writing body bytes.
    Busy = 4,
}

impl Status {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Eof and Failed end a request.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Eof | Status::Failed)
    }

    fn name(&self) -> &'static str {
        match self {
            Status::Eof => "EOF",
            Status::Waiting => "WAITING",
            Status::DataReady => "DATA_READY",
            Status::Failed => "FAILED",
            Status::Busy => "BUSY",
        }
    }
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Status::Eof,
            1 => Status::Waiting,
            2 => Status::DataReady,
            3 => Status::Failed,
            4 => Status::Busy,
            v => return Err(v),
        })
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
