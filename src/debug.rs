//! Debug output controlled through the `G_DBUS_DEBUG` environment variable.
//!
//! The variable holds a list of keys separated by `,`, `:`, `;` or
//! whitespace. Each key enables one category of diagnostics which is emitted
//! through [`tracing`] at the `DEBUG` level. The special key `all` enables
//! everything and `help` logs the list of known keys.
//!
//! ```
//! use tokio_dbus_peer::debug::DebugFlags;
//!
//! let flags = DebugFlags::parse("authentication,payload");
//! assert!(flags & DebugFlags::AUTHENTICATION);
//! assert!(flags & DebugFlags::MESSAGE);
//! assert!(!(flags & DebugFlags::TRANSPORT));
//! ```

#[cfg(test)]
mod tests;

use std::env;
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

raw_set! {
    /// Categories of debug output.
    #[repr(u16)]
    pub enum DebugFlags {
        /// No debug output.
        EMPTY = 0,
        /// Steps of the authentication handshake.
        AUTHENTICATION = 1 << 0,
        /// Bytes read from and written to the transport.
        TRANSPORT = 1 << 1,
        /// Messages passing through the worker.
        MESSAGE = 1 << 2,
        /// Hexdumps of message payloads. Implies [`DebugFlags::MESSAGE`].
        PAYLOAD = 1 << 3,
        /// Method calls.
        CALL = 1 << 4,
        /// Signal subscriptions.
        SIGNAL = 1 << 5,
        /// Incoming method calls.
        INCOMING = 1 << 6,
        /// Method returns.
        RETURN = 1 << 7,
        /// Signal emissions.
        EMISSION = 1 << 8,
        /// Address resolution.
        ADDRESS = 1 << 9,
        /// Proxies.
        PROXY = 1 << 10,
    }
}

/// The name of the environment variable holding debug flags.
pub const ENVIRONMENT: &str = "G_DBUS_DEBUG";

const KEYS: [(&str, DebugFlags); 11] = [
    ("authentication", DebugFlags::AUTHENTICATION),
    ("transport", DebugFlags::TRANSPORT),
    ("message", DebugFlags::MESSAGE),
    ("payload", DebugFlags::PAYLOAD),
    ("call", DebugFlags::CALL),
    ("signal", DebugFlags::SIGNAL),
    ("incoming", DebugFlags::INCOMING),
    ("return", DebugFlags::RETURN),
    ("emission", DebugFlags::EMISSION),
    ("address", DebugFlags::ADDRESS),
    ("proxy", DebugFlags::PROXY),
];

impl DebugFlags {
    /// Every debug flag.
    pub fn all() -> Self {
        let mut flags = DebugFlags::EMPTY;

        for (_, flag) in KEYS {
            flags |= flag;
        }

        flags
    }

    /// Parse debug flags from a string in the format accepted by
    /// `G_DBUS_DEBUG`.
    ///
    /// Unknown keys are ignored.
    pub fn parse(value: &str) -> Self {
        let mut flags = DebugFlags::EMPTY;

        let keys = value
            .split(|c: char| matches!(c, ',' | ':' | ';') || c.is_ascii_whitespace())
            .filter(|key| !key.is_empty());

        for key in keys {
            if key.eq_ignore_ascii_case("all") {
                flags |= DebugFlags::all();
                continue;
            }

            if key.eq_ignore_ascii_case("help") {
                let known = KEYS.iter().map(|(name, _)| *name).collect::<Vec<_>>();
                tracing::info!("Supported values for {ENVIRONMENT}: {} all help", known.join(" "));
                continue;
            }

            let found = KEYS
                .iter()
                .find(|(name, _)| key.replace('-', "_").eq_ignore_ascii_case(name));

            if let Some((_, flag)) = found {
                flags |= *flag;
            }
        }

        if flags & DebugFlags::PAYLOAD {
            flags |= DebugFlags::MESSAGE;
        }

        flags
    }
}

static FLAGS: OnceLock<DebugFlags> = OnceLock::new();
static PRINT_LOCK: Mutex<()> = Mutex::new(());

/// Access the process-wide debug flags.
///
/// These are parsed from `G_DBUS_DEBUG` the first time this is called.
pub fn flags() -> DebugFlags {
    *FLAGS.get_or_init(|| match env::var(ENVIRONMENT) {
        Ok(value) => DebugFlags::parse(&value),
        Err(..) => DebugFlags::EMPTY,
    })
}

#[inline]
pub(crate) fn authentication() -> bool {
    flags() & DebugFlags::AUTHENTICATION
}

#[inline]
pub(crate) fn transport() -> bool {
    flags() & DebugFlags::TRANSPORT
}

#[inline]
pub(crate) fn message() -> bool {
    flags() & DebugFlags::MESSAGE
}

#[inline]
pub(crate) fn payload() -> bool {
    flags() & DebugFlags::PAYLOAD
}

/// Acquire the process-wide lock serializing debug output.
pub fn print_lock() -> MutexGuard<'static, ()> {
    PRINT_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Format `data` as a hexdump with 16 bytes per row and an ASCII column.
///
/// ```
/// use tokio_dbus_peer::debug::hexdump;
///
/// let dump = hexdump(b"hello", 2);
/// let line = dump.lines().next().unwrap();
/// assert!(line.starts_with("  0000: 68 65 6c 6c  6f "));
/// assert!(line.ends_with("   hello"));
/// ```
pub fn hexdump(data: &[u8], indent: usize) -> String {
    let mut out = String::new();

    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:indent$}{:04x}: ", "", row * 16);

        for n in 0..16 {
            if n > 0 && n % 4 == 0 {
                out.push(' ');
            }

            match chunk.get(n) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }

        out.push_str("   ");

        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }

        out.push('\n');
    }

    out
}

/// Emit an authentication debug line when enabled.
macro_rules! auth_debug {
    ($($arg:tt)*) => {
        if $crate::debug::authentication() {
            let _guard = $crate::debug::print_lock();
            tracing::debug!(target: "tokio_dbus_peer::auth", $($arg)*);
        }
    };
}

/// Emit a transport debug line when enabled.
macro_rules! transport_debug {
    ($($arg:tt)*) => {
        if $crate::debug::transport() {
            let _guard = $crate::debug::print_lock();
            tracing::debug!(target: "tokio_dbus_peer::transport", $($arg)*);
        }
    };
}

/// Emit a message debug line when enabled.
macro_rules! message_debug {
    ($($arg:tt)*) => {
        if $crate::debug::message() {
            let _guard = $crate::debug::print_lock();
            tracing::debug!(target: "tokio_dbus_peer::message", $($arg)*);
        }
    };
}
