use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::sasl::Keyring;

use super::{parse_uid, process_uid, Mechanism, MechanismState, Side};

/// The cookie context used by servers.
pub const COOKIE_CONTEXT: &str = "org_gtk_gdbus_general";

const CHALLENGE_LENGTH: usize = 16;

/// The `DBUS_COOKIE_SHA1` mechanism.
///
/// The server hands out a cookie id and a challenge. The client proves that it
/// can read the cookie from the shared keyring by returning a SHA-1 over both
/// peers' challenges and the cookie.
pub struct CookieSha1 {
    side: Side,
    state: MechanismState,
    keyring: Keyring,
    reject_reason: Option<String>,
    to_send: Option<String>,
    cookie: Option<String>,
    server_challenge: Option<String>,
}

impl CookieSha1 {
    /// The wire name of the mechanism.
    pub const NAME: &'static str = "DBUS_COOKIE_SHA1";

    /// Construct a new instance using the given keyring.
    pub fn new(keyring: Keyring) -> Self {
        Self {
            side: Side::None,
            state: MechanismState::Invalid,
            keyring,
            reject_reason: None,
            to_send: None,
            cookie: None,
            server_challenge: None,
        }
    }

    fn reject(&mut self, reason: String) {
        auth_debug!(reason = %reason, "DBUS_COOKIE_SHA1 rejected");
        self.reject_reason = Some(reason);
        self.state = MechanismState::Rejected;
    }
}

/// Generate a random challenge from `[A-Za-z0-9]`.
fn random_challenge() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(CHALLENGE_LENGTH)
        .map(char::from)
        .collect()
}

/// Compute the lowercase hex SHA-1 of `server:client:cookie`.
pub(crate) fn sha1_response(server_challenge: &str, client_challenge: &str, cookie: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_challenge.as_bytes());
    hasher.update(b":");
    hasher.update(client_challenge.as_bytes());
    hasher.update(b":");
    hasher.update(cookie.as_bytes());
    hex::encode(hasher.finalize())
}

impl Mechanism for CookieSha1 {
    #[inline]
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn client_initiate(&mut self) -> Option<Vec<u8>> {
        if !self.side.check_fresh(Self::NAME, "client_initiate") {
            return None;
        }

        self.side = Side::Client;

        let Some(uid) = process_uid() else {
            self.state = MechanismState::Rejected;
            return None;
        };

        self.state = MechanismState::WaitingForData;
        Some(uid.to_string().into_bytes())
    }

    fn client_state(&self) -> MechanismState {
        if !self.side.check(Side::Client, self.state, &[], Self::NAME, "client_state") {
            return MechanismState::Invalid;
        }

        self.state
    }

    fn client_data_receive(&mut self, data: &[u8]) {
        if !self.side.check(
            Side::Client,
            self.state,
            &[MechanismState::WaitingForData],
            Self::NAME,
            "client_data_receive",
        ) {
            return;
        }

        let data = String::from_utf8_lossy(data);
        let tokens = data.split(' ').collect::<Vec<_>>();

        let [context, id, server_challenge] = tokens[..] else {
            self.reject(format!("Malformed data '{data}'"));
            return;
        };

        let Ok(id) = id.parse::<u32>() else {
            self.reject(format!("Malformed cookie_id '{id}'"));
            return;
        };

        let cookie = match self.keyring.lookup(context, id) {
            Ok(cookie) => cookie,
            Err(error) => {
                self.reject(format!("Problems looking up entry in keyring: {error}"));
                return;
            }
        };

        let client_challenge = random_challenge();
        let sha1 = sha1_response(server_challenge, &client_challenge, &cookie);
        self.to_send = Some(format!("{client_challenge} {sha1}"));
        self.state = MechanismState::HaveDataToSend;
    }

    fn client_data_send(&mut self) -> Option<Vec<u8>> {
        if !self.side.check(
            Side::Client,
            self.state,
            &[MechanismState::HaveDataToSend],
            Self::NAME,
            "client_data_send",
        ) {
            return None;
        }

        let data = self.to_send.take()?;
        self.state = MechanismState::Accepted;
        Some(data.into_bytes())
    }

    fn client_shutdown(&mut self) {
        if self.side.check(Side::Client, self.state, &[], Self::NAME, "client_shutdown") {
            self.side = Side::None;
        }
    }

    fn server_initiate(&mut self, initial_response: Option<&[u8]>) {
        if !self.side.check_fresh(Self::NAME, "server_initiate") {
            return;
        }

        self.side = Side::Server;
        self.state = MechanismState::Rejected;

        let Some(data) = initial_response.filter(|data| !data.is_empty()) else {
            return;
        };

        if let (Some(alleged), Some(uid)) = (parse_uid(data), process_uid()) {
            if alleged == i64::from(uid) {
                self.state = MechanismState::HaveDataToSend;
            }
        }
    }

    fn server_state(&self) -> MechanismState {
        if !self.side.check(Side::Server, self.state, &[], Self::NAME, "server_state") {
            return MechanismState::Invalid;
        }

        self.state
    }

    fn server_data_receive(&mut self, data: &[u8]) {
        if !self.side.check(
            Side::Server,
            self.state,
            &[MechanismState::WaitingForData],
            Self::NAME,
            "server_data_receive",
        ) {
            return;
        }

        let data = String::from_utf8_lossy(data);
        let tokens = data.split(' ').collect::<Vec<_>>();

        let [client_challenge, alleged] = tokens[..] else {
            self.reject(format!("Malformed data '{data}'"));
            return;
        };

        let (Some(server_challenge), Some(cookie)) = (&self.server_challenge, &self.cookie) else {
            self.reject(String::from("SHA-1 mismatch"));
            return;
        };

        let expected = sha1_response(server_challenge, client_challenge, cookie);

        if bool::from(expected.as_bytes().ct_eq(alleged.as_bytes())) {
            self.state = MechanismState::Accepted;
        } else {
            self.reject(String::from("SHA-1 mismatch"));
        }
    }

    fn server_data_send(&mut self) -> Option<Vec<u8>> {
        if !self.side.check(
            Side::Server,
            self.state,
            &[MechanismState::HaveDataToSend],
            Self::NAME,
            "server_data_send",
        ) {
            return None;
        }

        let (id, cookie) = match self.keyring.generate(COOKIE_CONTEXT) {
            Ok(entry) => entry,
            Err(error) => {
                self.reject(format!("Error adding entry to keyring: {error}"));
                return None;
            }
        };

        let challenge = random_challenge();
        let data = format!("{COOKIE_CONTEXT} {id} {challenge}");

        self.cookie = Some(cookie);
        self.server_challenge = Some(challenge);
        self.state = MechanismState::WaitingForData;
        Some(data.into_bytes())
    }

    fn server_reject_reason(&self) -> Option<String> {
        if !self.side.check(
            Side::Server,
            self.state,
            &[MechanismState::Rejected],
            Self::NAME,
            "server_reject_reason",
        ) {
            return None;
        }

        self.reject_reason.clone()
    }

    fn server_shutdown(&mut self) {
        if self.side.check(Side::Server, self.state, &[], Self::NAME, "server_shutdown") {
            self.side = Side::None;
        }
    }
}
