use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};
use crate::transport::{self, Transport};

/// The maximum length of a single handshake line.
const MAX_LINE_LENGTH: usize = 16 * 1024;

const CHUNK: usize = 256;

/// Run the given I/O future unless the token is cancelled first.
pub(super) async fn cancellable<F, T>(cancel: Option<&CancellationToken>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(cancel) = cancel else {
        return future.await;
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::new(ErrorKind::Cancelled)),
        result = future => result,
    }
}

/// Reads `\r\n` terminated handshake lines and writes responses.
///
/// Reads are buffered, except when reading with [`Lines::read_line_safe`]
/// which never consumes more from the transport than the line it returns.
pub(super) struct Lines<'a, T: ?Sized> {
    transport: &'a T,
    cancel: Option<&'a CancellationToken>,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a, T> Lines<'a, T>
where
    T: ?Sized + Transport,
{
    pub(super) fn new(transport: &'a T, cancel: Option<&'a CancellationToken>) -> Self {
        Self {
            transport,
            cancel,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Write a line, appending the `\r\n` terminator.
    pub(super) async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        cancellable(self.cancel, transport::write_all(self.transport, &bytes)).await?;
        Ok(())
    }

    /// Read a line through the internal buffer.
    ///
    /// If the stream ends in the middle of a line, the partial line is
    /// returned.
    pub(super) async fn read_line(&mut self) -> Result<String> {
        loop {
            let pending = &self.buf[self.pos..];

            if let Some(n) = pending.windows(2).position(|w| w == b"\r\n") {
                let line = pending[..n].to_vec();
                self.pos += n + 2;
                self.compact();
                return into_line(line);
            }

            if pending.len() > MAX_LINE_LENGTH {
                return Err(Error::new(ErrorKind::LineTooLong(MAX_LINE_LENGTH)));
            }

            let start = self.buf.len();
            self.buf.resize(start + CHUNK, 0);

            let result = cancellable(self.cancel, self.transport.read(&mut self.buf[start..])).await;

            let n = match result {
                Ok(n) => n,
                Err(error) => {
                    self.buf.truncate(start);
                    return Err(error);
                }
            };

            self.buf.truncate(start + n);

            if n == 0 {
                let line = self.buf[self.pos..].to_vec();
                self.pos = self.buf.len();

                if line.is_empty() {
                    return Err(Error::new(ErrorKind::MissingLine));
                }

                return into_line(line);
            }
        }
    }

    /// Read a line one byte at a time so that nothing past the terminator is
    /// consumed from the transport.
    ///
    /// Bytes which are already buffered are consumed first.
    pub(super) async fn read_line_safe(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let mut last_was_cr = false;

        loop {
            let c = if self.pos < self.buf.len() {
                let c = self.buf[self.pos];
                self.pos += 1;
                c
            } else {
                let mut byte = [0u8];

                if cancellable(self.cancel, self.transport.read(&mut byte)).await? == 0 {
                    return Err(Error::new(ErrorKind::MissingLineSafe));
                }

                byte[0]
            };

            line.push(c);

            if last_was_cr && c == b'\n' {
                line.truncate(line.len() - 2);
                self.compact();
                return into_line(line);
            }

            if line.len() > MAX_LINE_LENGTH {
                return Err(Error::new(ErrorKind::LineTooLong(MAX_LINE_LENGTH)));
            }

            last_was_cr = c == b'\r';
        }
    }

    /// Take any bytes which were buffered but not consumed as a line.
    pub(super) fn into_residual(mut self) -> Vec<u8> {
        self.buf.drain(..self.pos);
        self.buf
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }
}

fn into_line(line: Vec<u8>) -> Result<String> {
    match String::from_utf8(line) {
        Ok(line) => Ok(line),
        Err(..) => Err(Error::new(ErrorKind::InvalidUtf8Line)),
    }
}
