//! Byte-stream endpoints which the handshake and the worker operate over.
//!
//! A [`Transport`] is a full-duplex byte stream. Local socket transports
//! additionally carry ancillary control messages, such as credentials and
//! file descriptors, which is represented by overriding the default methods of
//! the trait.

#[cfg(test)]
mod tests;

#[cfg(all(unix, feature = "libc"))]
#[doc(inline)]
pub use self::unix::UnixTransport;
#[cfg(all(unix, feature = "libc"))]
mod unix;

#[doc(inline)]
pub use self::io::IoTransport;
mod io;

use std::future::Future;

use crate::credentials::Credentials;
use crate::error::{Error, ErrorKind, Result};
use crate::fd_list::FdList;

/// An ancillary control message received alongside stream data.
#[derive(Debug)]
#[non_exhaustive]
pub enum Ancillary {
    /// Credentials of the sending process.
    Credentials(Credentials),
    /// File descriptors passed by the peer.
    Fds(FdList),
    /// A control message this crate does not understand.
    Unknown {
        /// The `cmsg_level` of the message.
        level: i32,
        /// The `cmsg_type` of the message.
        ty: i32,
    },
}

/// A full-duplex byte stream.
///
/// Reads and writes may be issued concurrently from different tasks, but
/// there is at most one outstanding read and one outstanding write at a time.
pub trait Transport: Send + Sync + 'static {
    /// A human readable name of the stream type, used in diagnostics.
    fn stream_type(&self) -> &'static str;

    /// Read bytes into `buf`, returning how many bytes were read.
    ///
    /// Returning zero indicates that the peer closed the stream.
    fn read<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send + 'a;

    /// Read bytes into `buf`, collecting any ancillary control messages into
    /// `ancillary`.
    fn read_with_ancillary<'a>(
        &'a self,
        buf: &'a mut [u8],
        ancillary: &'a mut Vec<Ancillary>,
    ) -> impl Future<Output = Result<usize>> + Send + 'a {
        let _ = ancillary;
        self.read(buf)
    }

    /// Write bytes from `buf`, returning how many bytes were written.
    fn write<'a>(&'a self, buf: &'a [u8]) -> impl Future<Output = Result<usize>> + Send + 'a;

    /// Test if this transport can pass file descriptors.
    fn supports_fd_passing(&self) -> bool {
        false
    }

    /// Write a single byte with `fds` attached as ancillary data.
    fn send_with_fds<'a>(
        &'a self,
        byte: u8,
        fds: &'a FdList,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let _ = (byte, fds);
        let error = Error::new(ErrorKind::FdPassingUnsupportedStream(self.stream_type()));
        async move { Err(error) }
    }

    /// Flush buffered output.
    fn flush(&self) -> impl Future<Output = Result<()>> + Send + '_;

    /// Close the stream.
    fn close(&self) -> impl Future<Output = Result<()>> + Send + '_;

    /// Write the leading NUL byte of the authentication handshake, attaching
    /// the credentials of the current process if the transport supports it.
    ///
    /// Returns the credentials which were sent, if any.
    fn send_credentials(&self) -> impl Future<Output = Result<Option<Credentials>>> + Send + '_ {
        async move {
            write_all(self, &[0]).await?;
            Ok(None)
        }
    }

    /// Read the leading NUL byte of the authentication handshake, collecting
    /// the credentials of the peer if the transport supports it.
    fn receive_credentials(
        &self,
    ) -> impl Future<Output = Result<Option<Credentials>>> + Send + '_ {
        async move {
            let mut byte = [0];

            if self.read(&mut byte).await? == 0 {
                return Err(Error::new(ErrorKind::ZeroRead));
            }

            Ok(None)
        }
    }

    /// Query the credentials of the peer through the socket itself.
    ///
    /// Fails with [`Category::NotSupported`] if this is not possible.
    ///
    /// [`Category::NotSupported`]: crate::error::Category::NotSupported
    fn peer_credentials(&self) -> Result<Credentials> {
        Err(Error::new(ErrorKind::CredentialsUnsupported))
    }
}

/// Write all of `buf` to the transport.
pub(crate) async fn write_all<T>(transport: &T, mut buf: &[u8]) -> Result<()>
where
    T: ?Sized + Transport,
{
    while !buf.is_empty() {
        let n = transport.write(buf).await?;

        if n == 0 {
            return Err(Error::from(std::io::Error::from(
                std::io::ErrorKind::WriteZero,
            )));
        }

        transport_debug!(bytes = n, "wrote");
        buf = &buf[n..];
    }

    Ok(())
}
