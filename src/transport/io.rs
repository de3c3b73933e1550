use std::any::type_name;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::Result;

use super::Transport;

/// A transport over any tokio byte stream.
///
/// Streams wrapped this way carry no ancillary data, so the handshake sends a
/// plain NUL byte and file descriptors cannot be passed.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::transport::{IoTransport, Transport};
///
/// let (a, _b) = tokio::io::duplex(64);
/// let transport = IoTransport::new(a);
/// assert!(!transport.supports_fd_passing());
/// ```
pub struct IoTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> IoTransport<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap the given stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = split(stream);

        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

impl<S> Transport for IoTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    #[inline]
    fn stream_type(&self) -> &'static str {
        type_name::<S>()
    }

    async fn read<'a>(&'a self, buf: &'a mut [u8]) -> Result<usize> {
        let n = self.reader.lock().await.read(buf).await?;
        transport_debug!(bytes = n, "read");
        Ok(n)
    }

    async fn write<'a>(&'a self, buf: &'a [u8]) -> Result<usize> {
        Ok(self.writer.lock().await.write(buf).await?)
    }

    async fn flush(&self) -> Result<()> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}
