//! The message codec consumed by the worker.
//!
//! The worker never looks inside a message. It reads whole blobs off the
//! transport using the fixed header prefix, and hands them to a [`Message`]
//! implementation to decode. Outgoing messages are written as the blob they
//! were enqueued with, unless a [`Handler`] replaces them.
//!
//! [`Handler`]: crate::worker::Handler

#[cfg(test)]
mod tests;

use std::fmt;

use crate::error::{ErrorKind, Result};
use crate::fd_list::FdList;
use crate::protocol::{self, Header, HEADER_PREFIX};
use crate::sasl::Capabilities;

/// A message which can be decoded from and encoded into a blob.
pub trait Message: Sized + Send + 'static {
    /// Decode a message from a complete blob.
    fn decode(blob: &[u8], capabilities: Capabilities) -> Result<Self>;

    /// Encode the message into a blob.
    fn encode(&self, capabilities: Capabilities) -> Result<Vec<u8>>;

    /// The file descriptors attached to the message.
    fn fds(&self) -> Option<&FdList> {
        None
    }

    /// Attach file descriptors received alongside the message.
    ///
    /// The default implementation closes them.
    fn attach_fds(&mut self, fds: FdList) {
        let _ = fds;
    }
}

/// A message which is kept as its raw blob.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::message::RawMessage;
/// use tokio_dbus_peer::protocol::{Endianness, Header, MessageType};
///
/// let header = Header {
///     endianness: Endianness::LITTLE,
///     message_type: MessageType::SIGNAL,
///     flags: 0,
///     version: 1,
///     body_length: 4,
///     serial: 1,
///     fields_length: 0,
/// };
///
/// let mut blob = header.to_bytes().to_vec();
/// blob.extend_from_slice(b"ping");
///
/// let message = RawMessage::new(blob)?;
/// assert_eq!(message.header().serial, 1);
/// assert_eq!(message.body(), b"ping");
/// # Ok::<_, tokio_dbus_peer::Error>(())
/// ```
pub struct RawMessage {
    header: Header,
    blob: Vec<u8>,
    fds: FdList,
}

impl RawMessage {
    /// Construct a message from a blob, checking that its length matches the
    /// one declared by the header.
    pub fn new(blob: Vec<u8>) -> Result<Self> {
        if blob.len() < HEADER_PREFIX {
            return Err(ErrorKind::MessageTooShort(blob.len()).into());
        }

        let header = Header::parse(&blob)?;

        if protocol::bytes_needed(&blob)? != blob.len() {
            return Err(ErrorKind::MalformedBlob.into());
        }

        Ok(Self {
            header,
            blob,
            fds: FdList::new(),
        })
    }

    /// The fixed header of the message.
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The complete blob.
    #[inline]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// The body of the message.
    pub fn body(&self) -> &[u8] {
        let len = self.header.body_length as usize;
        &self.blob[self.blob.len() - len..]
    }

    /// Attach file descriptors to send with the message.
    pub fn with_fds(mut self, fds: FdList) -> Self {
        self.fds = fds;
        self
    }

    /// Take the attached file descriptors.
    pub fn take_fds(&mut self) -> FdList {
        std::mem::take(&mut self.fds)
    }
}

impl Message for RawMessage {
    #[inline]
    fn decode(blob: &[u8], _: Capabilities) -> Result<Self> {
        Self::new(blob.to_vec())
    }

    #[inline]
    fn encode(&self, _: Capabilities) -> Result<Vec<u8>> {
        Ok(self.blob.clone())
    }

    #[inline]
    fn fds(&self) -> Option<&FdList> {
        Some(&self.fds)
    }

    #[inline]
    fn attach_fds(&mut self, fds: FdList) {
        self.fds.append(fds);
    }
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("header", &self.header)
            .field("len", &self.blob.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}
