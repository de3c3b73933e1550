//! The SASL authentication handshake which D-Bus performs before any message
//! is exchanged.
//!
//! Use [`ClientAuth`] on the connecting side and [`ServerAuth`] on the
//! accepting side. Both run over any [`Transport`] and return the negotiated
//! [`Capabilities`] when the peer sends or receives `BEGIN`.
//!
//! [`Transport`]: crate::transport::Transport

#[cfg(test)]
mod tests;

#[doc(inline)]
pub use self::client::{ClientAuth, ClientOutcome};
mod client;

#[doc(inline)]
pub use self::server::{ServerAuth, ServerOutcome};
mod server;

#[doc(inline)]
pub use self::keyring::Keyring;
pub mod keyring;

pub mod mechanism;

mod line;

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::credentials::Credentials;
use crate::error::{Error, ErrorKind, Result};

raw_set! {
    /// Capabilities negotiated during the handshake.
    #[repr(u8)]
    pub enum Capabilities {
        /// No capabilities.
        EMPTY = 0,
        /// The peers can pass file descriptors alongside messages.
        UNIX_FD_PASSING = 1 << 0,
    }
}

/// Hooks which lets the owner of a connection influence authentication.
///
/// Every method has a permissive default.
pub trait Observer: Send + Sync {
    /// Test if the mechanism with the given name may be used.
    fn allow_mechanism(&self, name: &str) -> bool {
        let _ = name;
        true
    }

    /// Authorize a peer which successfully authenticated.
    ///
    /// Returning `false` fails the handshake.
    fn authorize_authenticated_peer(&self, credentials: Option<&Credentials>) -> bool {
        let _ = credentials;
        true
    }
}

/// A D-Bus GUID.
///
/// This is always 32 hexadecimal characters.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::sasl::Guid;
///
/// let guid: Guid = "0123456789abcdef0123456789abcdef".parse()?;
/// assert_eq!(guid.as_str(), "0123456789abcdef0123456789abcdef");
///
/// assert!("0123".parse::<Guid>().is_err());
/// assert!(Guid::is_valid(Guid::generate().as_str()));
/// # Ok::<_, tokio_dbus_peer::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Guid(Box<str>);

impl Guid {
    /// The length of a GUID.
    pub const LEN: usize = 32;

    /// Test if the given string is a valid GUID.
    pub fn is_valid(guid: &str) -> bool {
        guid.len() == Self::LEN && guid.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Generate a new unique GUID.
    ///
    /// This is three random 32-bit values followed by the current time in
    /// seconds since the unix epoch.
    pub fn generate() -> Self {
        let mut rng = OsRng;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        let guid = format!(
            "{:08x}{:08x}{:08x}{:08x}",
            rng.next_u32(),
            rng.next_u32(),
            rng.next_u32(),
            now
        );

        Self(guid.into())
    }

    /// Access the GUID as a string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !Self::is_valid(s) {
            return Err(Error::new(ErrorKind::InvalidGuid(s.into())));
        }

        Ok(Self(s.into()))
    }
}

impl fmt::Display for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Guid").field(&self.0).finish()
    }
}

/// Encode bytes as lowercase hex as used by `AUTH` and `DATA` lines.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::sasl::hex_encode;
///
/// assert_eq!(hex_encode(b"1000"), "31303030");
/// ```
pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex payload as used by `AUTH` and `DATA` lines.
///
/// Decoding is case insensitive.
///
/// # Examples
///
/// ```
/// use tokio_dbus_peer::sasl::hex_decode;
///
/// assert_eq!(hex_decode("31303030")?, b"1000");
/// assert_eq!(hex_decode("CAFE")?, [0xca, 0xfe]);
///
/// let error = hex_decode("abc").unwrap_err();
/// assert_eq!(error.to_string(), "Error hexdecoding string 'abc' around position 2");
/// # Ok::<_, tokio_dbus_peer::Error>(())
/// ```
pub fn hex_decode(input: &str) -> Result<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);

    for (n, pair) in bytes.chunks(2).enumerate() {
        let (Some(upper), Some(lower)) = (
            pair.first().and_then(|&b| nibble(b)),
            pair.get(1).and_then(|&b| nibble(b)),
        ) else {
            return Err(Error::new(ErrorKind::HexDecode {
                input: input.into(),
                position: n * 2,
            }));
        };

        out.push(upper << 4 | lower);
    }

    Ok(out)
}

#[inline]
fn nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
