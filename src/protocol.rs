//! Low level details of the D-Bus message framing.
//!
//! The worker never interprets message contents, but it does need to know how
//! large a message is once the fixed part of the header has been received.


use crate::error::{ErrorKind, Result};

/// The size of the fixed header prefix which is needed to determine the size
/// of a message.
pub const HEADER_PREFIX: usize = 16;

/// The maximum length of a message.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 27;

raw_enum! {
    /// The endianness of a message.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian.
        LITTLE = b'l',
        /// Big endian.
        BIG = b'B',
    }
}

impl Endianness {
    /// Native endian.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// Native endian.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;

    #[inline]
    fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::BIG => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        }
    }
}

raw_enum! {
    /// The type of a message.
    #[repr(u8)]
    pub enum MessageType {
        /// Method call. This message type may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply. If the first argument exists and is a string, it is an
        /// error message.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

/// The fixed header prefix of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// The endianness of the message.
    pub endianness: Endianness,
    /// The type of the message.
    pub message_type: MessageType,
    /// Raw message flags.
    pub flags: u8,
    /// The major protocol version.
    pub version: u8,
    /// The length of the body in bytes.
    pub body_length: u32,
    /// The serial of the message.
    pub serial: u32,
    /// The length in bytes of the header field array which follows the
    /// prefix.
    pub fields_length: u32,
}

impl Header {
    /// Parse the fixed header prefix.
    pub fn parse(bytes: &[u8]) -> Result<Header> {
        let Some(&[e, message_type, flags, version, ..]) = bytes.get(..HEADER_PREFIX) else {
            return Err(ErrorKind::MalformedBlob.into());
        };

        let endianness = Endianness(e);

        if !matches!(endianness, Endianness::LITTLE | Endianness::BIG) {
            return Err(ErrorKind::MalformedBlob.into());
        }

        let word = |at: usize| {
            let mut out = [0; 4];
            out.copy_from_slice(&bytes[at..at + 4]);
            endianness.read_u32(out)
        };

        Ok(Header {
            endianness,
            message_type: MessageType(message_type),
            flags,
            version,
            body_length: word(4),
            serial: word(8),
            fields_length: word(12),
        })
    }

    /// Write the fixed header prefix.
    pub fn to_bytes(&self) -> [u8; HEADER_PREFIX] {
        let word = |value: u32| match self.endianness {
            Endianness::BIG => value.to_be_bytes(),
            _ => value.to_le_bytes(),
        };

        let mut out = [0; HEADER_PREFIX];
        out[0] = self.endianness.0;
        out[1] = self.message_type.0;
        out[2] = self.flags;
        out[3] = self.version;
        out[4..8].copy_from_slice(&word(self.body_length));
        out[8..12].copy_from_slice(&word(self.serial));
        out[12..16].copy_from_slice(&word(self.fields_length));
        out
    }

    /// The total size of the message described by this header.
    pub fn message_length(&self) -> Result<usize> {
        let fields = HEADER_PREFIX + self.fields_length as usize;
        let len = fields + padding_to(8, fields) + self.body_length as usize;

        if len > MAX_MESSAGE_LENGTH {
            return Err(ErrorKind::MessageTooLong.into());
        }

        Ok(len)
    }
}

/// Compute the number of bytes a message occupies given its first
/// [`HEADER_PREFIX`] bytes.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::protocol;
///
/// let mut prefix = [0u8; 16];
/// prefix[0] = b'l';
/// prefix[1] = 1;
/// prefix[3] = 1;
/// prefix[4..8].copy_from_slice(&4u32.to_le_bytes());
/// prefix[12..16].copy_from_slice(&3u32.to_le_bytes());
///
/// // 16 + 3 fields, padded to 24, plus 4 bytes of body.
/// assert_eq!(protocol::bytes_needed(&prefix)?, 28);
/// # Ok::<_, tokio_dbus_peer::Error>(())
/// ```
pub fn bytes_needed(prefix: &[u8]) -> Result<usize> {
    Header::parse(prefix)?.message_length()
}

/// Calculate padding with a known alignment.
#[inline]
pub(crate) fn padding_to(align: usize, len: usize) -> usize {
    let mask = align - 1;
    (align - (len & mask)) & mask
}
