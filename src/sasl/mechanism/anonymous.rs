use super::{Mechanism, MechanismState, Side};

/// The initial response sent by the client. The mechanism allows any trace
/// string.
const TRACE: &[u8] = b"GDBus 0.1";

/// The `ANONYMOUS` mechanism, which always succeeds.
pub struct Anonymous {
    side: Side,
    state: MechanismState,
}

impl Anonymous {
    /// The wire name of the mechanism.
    pub const NAME: &'static str = "ANONYMOUS";

    /// Construct a new instance.
    pub fn new() -> Self {
        Self {
            side: Side::None,
            state: MechanismState::Invalid,
        }
    }
}

impl Default for Anonymous {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Mechanism for Anonymous {
    #[inline]
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn client_initiate(&mut self) -> Option<Vec<u8>> {
        if !self.side.check_fresh(Self::NAME, "client_initiate") {
            return None;
        }

        self.side = Side::Client;
        self.state = MechanismState::Accepted;
        Some(TRACE.to_vec())
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

    fn server_initiate(&mut self, _: Option<&[u8]>) {
        if !self.side.check_fresh(Self::NAME, "server_initiate") {
            return;
        }

        self.side = Side::Server;
        self.state = MechanismState::Accepted;
    }

    fn server_state(&self) -> MechanismState {
        if !self.side.check(Side::Server, self.state, &[], Self::NAME, "server_state") {
            return MechanismState::Invalid;
        }

        self.state
    }

    fn server_data_receive(&mut self, _: &[u8]) {
        self.side.check(
            Side::Server,
            self.state,
            &[MechanismState::WaitingForData],
            Self::NAME,
            "server_data_receive",
        );
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
        self.side.check(
            Side::Server,
            self.state,
            &[MechanismState::Rejected],
            Self::NAME,
            "server_reject_reason",
        );

        None
    }

    fn server_shutdown(&mut self) {
        if self.side.check(Side::Server, self.state, &[], Self::NAME, "server_shutdown") {
            self.side = Side::None;
        }
    }
}
