use std::io::{self, Write};

use http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{Method, Version};

use crate::{Config, Error};

/// Capacity of the outgoing request line and header buffer.
pub(crate) const PRELUDE_CAPACITY: usize = 512;

/// Request line and headers for one chat completion.
pub(crate) fn build(config: &Config, content_length: usize) -> Result<Vec<u8>, Error> {
    let mut w = Writer::new(PRELUDE_CAPACITY);

    let success = w.try_write(|w| {
        write!(w, "{} {} {:?}\r\n", Method::POST, config.path, Version::HTTP_11)?;
        write!(w, "{}: {}\r\n", HOST, config.authority())?;
        write!(w, "{}: Bearer {}\r\n", AUTHORIZATION, config.api_key)?;
        write!(w, "{}: application/json\r\n", CONTENT_TYPE)?;
        write!(w, "{}: {}\r\n", CONTENT_LENGTH, content_length)?;
        write!(w, "{}: close\r\n\r\n", CONNECTION)
    });

    if !success {
        return Err(Error::PreludeOverflow(PRELUDE_CAPACITY));
    }

    Ok(w.into_inner())
}

/// Byte buffer that refuses to grow past a limit.
struct Writer {
    buf: Vec<u8>,
    limit: usize,
}

impl Writer {
    fn new(limit: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Run `f`, undoing any partial output if it fails.
    fn try_write(&mut self, f: impl FnOnce(&mut Self) -> io::Result<()>) -> bool {
        let at = self.buf.len();
        let success = f(self).is_ok();
        if !success {
            self.buf.truncate(at);
        }
        success
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.limit - self.buf.len() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
