//! Peer-to-peer D-Bus plumbing for Tokio.
//!
//! This crate covers what happens on a D-Bus connection below the message
//! layer:
//!
//! * The [SASL handshake] which authenticates a peer, in both the client and
//!   the server role, with the `EXTERNAL`, `ANONYMOUS` and
//!   `DBUS_COOKIE_SHA1` mechanisms.
//! * The [credentials] of a connected process.
//! * A [worker] which reads and writes whole messages concurrently once the
//!   handshake is complete.
//!
//! [SASL handshake]: crate::sasl
//! [credentials]: crate::credentials
//! [worker]: crate::worker

#[macro_use]
mod macros;

#[macro_use]
pub mod debug;

#[doc(inline)]
pub use self::error::{Category, Error, Result};
mod error;

pub mod protocol;

pub mod credentials;

pub mod fd_list;

pub mod transport;

pub mod sasl;

#[doc(inline)]
pub use self::message::Message;
pub mod message;

pub mod worker;
