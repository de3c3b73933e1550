//! Authentication mechanisms.
//!
//! A [`Mechanism`] instance is used for a single authentication attempt on
//! either the client or the server side. Which side is decided by whether
//! `client_initiate` or `server_initiate` is called first. Calling a method of
//! the other side, or calling a method in a state which does not permit it, is
//! a programming error which is logged and otherwise ignored.


#[doc(inline)]
pub use self::anonymous::Anonymous;
mod anonymous;

#[doc(inline)]
pub use self::external::External;
mod external;

#[doc(inline)]
pub use self::cookie_sha1::CookieSha1;
mod cookie_sha1;

use std::cmp::Reverse;
use std::fmt;

use crate::credentials::Credentials;

use super::Keyring;

/// The state of a mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismState {
    /// The mechanism has not been initiated, or was used incorrectly.
    Invalid,
    /// The mechanism expects data from the peer.
    WaitingForData,
    /// The mechanism has data to send to the peer.
    HaveDataToSend,
    /// Authentication succeeded.
    Accepted,
    /// Authentication failed.
    Rejected,
}

/// The operations of an authentication mechanism.
pub trait Mechanism: Send {
    /// The wire name of the mechanism.
    fn name(&self) -> &'static str;

    /// Start authenticating as a client, returning the initial response if
    /// any.
    fn client_initiate(&mut self) -> Option<Vec<u8>>;

    /// The client side state.
    fn client_state(&self) -> MechanismState;

    /// Feed data received from the server.
    fn client_data_receive(&mut self, data: &[u8]);

    /// Take data to send to the server.
    fn client_data_send(&mut self) -> Option<Vec<u8>>;

    /// Release the client side.
    fn client_shutdown(&mut self);

    /// Start authenticating as a server, with the initial response sent by
    /// the client if any.
    fn server_initiate(&mut self, initial_response: Option<&[u8]>);

    /// The server side state.
    fn server_state(&self) -> MechanismState;

    /// Feed data received from the client.
    fn server_data_receive(&mut self, data: &[u8]);

    /// Take data to send to the client.
    ///
    /// Returns `None` if producing the data failed, in which case the
    /// mechanism moved to [`MechanismState::Rejected`].
    fn server_data_send(&mut self) -> Option<Vec<u8>>;

    /// The reason the mechanism rejected the client.
    fn server_reject_reason(&self) -> Option<String>;

    /// Release the server side.
    fn server_shutdown(&mut self);
}

/// The mechanisms known to this crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MechanismKind {
    /// `EXTERNAL`, authentication through credentials of the transport.
    External,
    /// `ANONYMOUS`, no authentication.
    Anonymous,
    /// `DBUS_COOKIE_SHA1`, proof of access to a shared keyring.
    CookieSha1,
}

impl MechanismKind {
    /// Every known mechanism, in order of preference.
    ///
    /// Mechanisms are ordered by descending priority, ties broken by
    /// descending name.
    ///
    /// ```
    /// use tokio_dbus_peer::sasl::mechanism::MechanismKind;
    ///
    /// let names = MechanismKind::all().map(MechanismKind::name);
    /// assert_eq!(names, ["EXTERNAL", "ANONYMOUS", "DBUS_COOKIE_SHA1"]);
    /// ```
    pub fn all() -> [MechanismKind; 3] {
        let mut all = [
            MechanismKind::Anonymous,
            MechanismKind::CookieSha1,
            MechanismKind::External,
        ];

        all.sort_by_key(|kind| (Reverse(kind.priority()), Reverse(kind.name())));
        all
    }

    /// Look up a mechanism by its wire name.
    pub fn from_name(name: &str) -> Option<MechanismKind> {
        match name {
            External::NAME => Some(MechanismKind::External),
            Anonymous::NAME => Some(MechanismKind::Anonymous),
            CookieSha1::NAME => Some(MechanismKind::CookieSha1),
            _ => None,
        }
    }

    /// The wire name of the mechanism.
    pub fn name(self) -> &'static str {
        match self {
            MechanismKind::External => External::NAME,
            MechanismKind::Anonymous => Anonymous::NAME,
            MechanismKind::CookieSha1 => CookieSha1::NAME,
        }
    }

    /// The priority of the mechanism. Higher is preferred.
    pub fn priority(self) -> i32 {
        match self {
            MechanismKind::External => 100,
            MechanismKind::Anonymous => 50,
            MechanismKind::CookieSha1 => 0,
        }
    }

    /// Test if the mechanism can be used given the credentials exchanged with
    /// the leading NUL byte.
    pub fn is_supported(self, credentials: Option<&Credentials>) -> bool {
        match self {
            MechanismKind::External => credentials.is_some(),
            MechanismKind::Anonymous | MechanismKind::CookieSha1 => true,
        }
    }

    /// Construct a new instance of the mechanism.
    ///
    /// The credentials are the ones sent on the client side, or the ones
    /// received on the server side.
    pub fn instantiate(
        self,
        credentials: Option<Credentials>,
        keyring: &Keyring,
    ) -> Box<dyn Mechanism> {
        match self {
            MechanismKind::External => Box::new(External::new(credentials)),
            MechanismKind::Anonymous => Box::new(Anonymous::new()),
            MechanismKind::CookieSha1 => Box::new(CookieSha1::new(keyring.clone())),
        }
    }
}

impl fmt::Debug for MechanismKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for MechanismKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The side a mechanism instance was initiated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    None,
    Client,
    Server,
}

impl Side {
    /// Test that the mechanism is on the expected side and in the expected
    /// state, logging an error otherwise.
    fn check(
        self,
        expected: Side,
        state: MechanismState,
        allowed: &[MechanismState],
        name: &str,
        operation: &str,
    ) -> bool {
        if self == expected && (allowed.is_empty() || allowed.contains(&state)) {
            return true;
        }

        tracing::error!(
            mechanism = name,
            operation,
            side = ?self,
            ?state,
            "Authentication mechanism used incorrectly"
        );

        false
    }

    /// Test that the mechanism has not been initiated yet.
    fn check_fresh(self, name: &str, operation: &str) -> bool {
        self.check(Side::None, MechanismState::Invalid, &[], name, operation)
    }
}

/// The real user id of the current process, as used by mechanisms which
/// assert identity in their initial response.
#[cfg(all(unix, feature = "libc"))]
fn process_uid() -> Option<u32> {
    // SAFETY: getuid has no preconditions and cannot fail.
    Some(unsafe { libc::getuid() })
}

#[cfg(not(all(unix, feature = "libc")))]
fn process_uid() -> Option<u32> {
    None
}

/// Parse a decimal uid as sent in an initial response.
fn parse_uid(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}
