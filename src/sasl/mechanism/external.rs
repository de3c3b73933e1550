use crate::credentials::Credentials;

use super::{parse_uid, Mechanism, MechanismState, Side};

/// The `EXTERNAL` mechanism, which authenticates through the credentials
/// passed alongside the leading NUL byte.
///
/// The client asserts its uid, which the server compares against the
/// credentials it received from the transport.
pub struct External {
    side: Side,
    state: MechanismState,
    credentials: Option<Credentials>,
}

impl External {
    /// The wire name of the mechanism.
    pub const NAME: &'static str = "EXTERNAL";

    /// Construct a new instance.
    ///
    /// On the client these are the credentials which were sent, on the server
    /// the credentials which were received.
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            side: Side::None,
            state: MechanismState::Invalid,
            credentials,
        }
    }

    fn matches_credentials(&self, data: &[u8]) -> bool {
        let Some(credentials) = &self.credentials else {
            return false;
        };

        let Some(alleged) = parse_uid(data) else {
            return false;
        };

        match credentials.unix_user() {
            Ok(uid) => i64::from(uid) == alleged,
            Err(..) => false,
        }
    }
}

impl Mechanism for External {
    #[inline]
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn client_initiate(&mut self) -> Option<Vec<u8>> {
        if !self.side.check_fresh(Self::NAME, "client_initiate") {
            return None;
        }

        self.side = Side::Client;
        self.state = MechanismState::Rejected;

        let uid = self.credentials.as_ref()?.unix_user().ok()?;
        self.state = MechanismState::Accepted;
        Some(uid.to_string().into_bytes())
    }

    fn client_state(&self) -> MechanismState {
        if !self.side.check(Side::Client, self.state, &[], Self::NAME, "client_state") {
            return MechanismState::Invalid;
        }

        self.state
    }

    fn client_data_receive(&mut self, _: &[u8]) {
        self.side.check(
            Side::Client,
            self.state,
            &[MechanismState::WaitingForData],
            Self::NAME,
            "client_data_receive",
        );
    }

    fn client_data_send(&mut self) -> Option<Vec<u8>> {
        self.side.check(
            Side::Client,
            self.state,
            &[MechanismState::HaveDataToSend],
            Self::NAME,
            "client_data_send",
        );

        None
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

        self.state = match initial_response {
            Some(data) if self.matches_credentials(data) => MechanismState::Accepted,
            Some(..) => MechanismState::Rejected,
            None => MechanismState::WaitingForData,
        };
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

        self.state = if self.matches_credentials(data) {
            MechanismState::Accepted
        } else {
            MechanismState::Rejected
        };
    }

    fn server_data_send(&mut self) -> Option<Vec<u8>> {
        self.side.check(
            Side::Server,
            self.state,
            &[MechanismState::HaveDataToSend],
            Self::NAME,
            "server_data_send",
        );

        None
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

        Some(String::from("Credentials do not match the claimed uid"))
    }

    fn server_shutdown(&mut self) {
        if self.side.check(Side::Server, self.state, &[], Self::NAME, "server_shutdown") {
            self.side = Side::None;
        }
    }
}
