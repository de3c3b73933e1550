use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::credentials::Credentials;
use crate::error::{Error, ErrorKind, Result};
use crate::transport::Transport;

use super::line::{cancellable, Lines};
use super::mechanism::{Mechanism, MechanismKind, MechanismState};
use super::{hex_decode, hex_encode, Capabilities, Guid, Keyring, Observer};

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForData,
    WaitingForOk,
    WaitingForAgreeUnixFd,
}

/// The result of a successful client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ClientOutcome {
    /// The GUID of the server.
    pub guid: Guid,
    /// The capabilities which were negotiated.
    pub capabilities: Capabilities,
}

/// Authenticate to a server.
///
/// # Examples
///
/// ```no_run
/// use tokio_dbus_peer::sasl::{Capabilities, ClientAuth};
/// use tokio_dbus_peer::transport::UnixTransport;
///
/// # #[tokio::main] async fn main() -> tokio_dbus_peer::Result<()> {
/// let stream = std::os::unix::net::UnixStream::connect("/run/user/1000/bus")?;
/// let transport = UnixTransport::new(stream)?;
///
/// let outcome = ClientAuth::new()
///     .offer(Capabilities::UNIX_FD_PASSING)
///     .run(&transport)
///     .await?;
///
/// println!("Connected to {}", outcome.guid);
/// # Ok(()) }
/// ```
#[derive(Default)]
pub struct ClientAuth {
    offer: Capabilities,
    observer: Option<Arc<dyn Observer>>,
    keyring: Option<Keyring>,
    cancellation: Option<CancellationToken>,
}

impl ClientAuth {
    /// Construct a new client handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities to offer to the server.
    pub fn offer(&mut self, capabilities: Capabilities) -> &mut Self {
        self.offer = capabilities;
        self
    }

    /// Observer which may veto mechanisms.
    pub fn observer<O>(&mut self, observer: O) -> &mut Self
    where
        O: 'static + Observer,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The keyring used to look up cookies for `DBUS_COOKIE_SHA1`.
    ///
    /// Defaults to [`Keyring::from_env`].
    pub fn keyring(&mut self, keyring: Keyring) -> &mut Self {
        self.keyring = Some(keyring);
        self
    }

    /// Token which cancels the handshake.
    pub fn cancellation(&mut self, token: CancellationToken) -> &mut Self {
        self.cancellation = Some(token);
        self
    }

    /// The mechanisms available locally, in order of preference.
    fn mechanisms(&self) -> Vec<MechanismKind> {
        MechanismKind::all()
            .into_iter()
            .filter(|kind| match &self.observer {
                Some(observer) => observer.allow_mechanism(kind.name()),
                None => true,
            })
            .collect()
    }

    /// Run the handshake over the given transport.
    ///
    /// On success the transport is positioned right after the `BEGIN` line.
    pub async fn run<T>(&self, transport: &T) -> Result<ClientOutcome>
    where
        T: ?Sized + Transport,
    {
        let cancel = self.cancellation.as_ref();
        let keyring = self.keyring.clone().unwrap_or_else(Keyring::from_env);
        let mechanisms = self.mechanisms();

        let credentials = cancellable(cancel, transport.send_credentials()).await?;

        match &credentials {
            Some(credentials) => {
                auth_debug!(%credentials, "CLIENT: sent credentials");
            }
            None => {
                auth_debug!("CLIENT: didn't send any credentials");
            }
        }

        let mut lines = Lines::new(transport, cancel);
        let mut session = Session {
            mechanisms: &mechanisms,
            credentials: credentials.as_ref(),
            keyring: &keyring,
            supported: Vec::new(),
            attempted: Vec::new(),
            guid: None,
        };

        auth_debug!("CLIENT: writing 'AUTH'");
        lines.write_line("AUTH").await?;

        auth_debug!("CLIENT: WaitingForReject");
        let line = lines.read_line().await?;
        auth_debug!(%line, "CLIENT: WaitingForReject, read");

        let mut mechanism = session.rejected(&mut lines, &line).await?;
        let mut state = initial_state(mechanism.as_ref());
        let mut capabilities = Capabilities::EMPTY;

        loop {
            auth_debug!(?state, "CLIENT");
            let line = lines.read_line().await?;
            auth_debug!(?state, %line, "CLIENT: read");

            match state {
                State::WaitingForOk => {
                    if let Some(guid) = line.strip_prefix("OK ") {
                        let Ok(guid) = guid.parse::<Guid>() else {
                            return Err(Error::new(ErrorKind::InvalidOk(line.into())));
                        };

                        mechanism.client_shutdown();

                        if self.offer.contains(Capabilities::UNIX_FD_PASSING) {
                            lines.write_line("NEGOTIATE_UNIX_FD").await?;
                            state = State::WaitingForAgreeUnixFd;
                            session.guid = Some(guid);
                            continue;
                        }

                        lines.write_line("BEGIN").await?;
                        return Ok(ClientOutcome { guid, capabilities });
                    }

                    if line.starts_with("REJECTED ") {
                        mechanism = session.rejected(&mut lines, &line).await?;
                        state = initial_state(mechanism.as_ref());
                        continue;
                    }

                    return Err(Error::new(ErrorKind::UnexpectedResponse(
                        "WaitingForOk",
                        line.into(),
                    )));
                }
                State::WaitingForAgreeUnixFd => {
                    if line == "AGREE_UNIX_FD" {
                        capabilities |= Capabilities::UNIX_FD_PASSING;
                    } else if !is_error(&line) {
                        return Err(Error::new(ErrorKind::UnexpectedResponse(
                            "WaitingForAgreeUnixFd",
                            line.into(),
                        )));
                    }

                    lines.write_line("BEGIN").await?;

                    let Some(guid) = session.guid.take() else {
                        return Err(Error::new(ErrorKind::UnexpectedResponse(
                            "WaitingForAgreeUnixFd",
                            line.into(),
                        )));
                    };

                    return Ok(ClientOutcome { guid, capabilities });
                }
                State::WaitingForData => {
                    if let Some(encoded) = line.strip_prefix("DATA ") {
                        let data = hex_decode(encoded.trim())
                            .map_err(|e| e.with_prefix("DATA response is malformed: "))?;

                        mechanism.client_data_receive(&data);

                        if mechanism.client_state() == MechanismState::HaveDataToSend {
                            if let Some(data) = mechanism.client_data_send() {
                                let line = format!("DATA {}", hex_encode(&data));
                                auth_debug!(%line, "CLIENT: writing");
                                lines.write_line(&line).await?;
                            }
                        }

                        state = State::WaitingForOk;
                        continue;
                    }

                    if line.starts_with("REJECTED ") {
                        mechanism = session.rejected(&mut lines, &line).await?;
                        state = initial_state(mechanism.as_ref());
                        continue;
                    }

                    return Err(Error::new(ErrorKind::UnexpectedResponse(
                        "WaitingForData",
                        line.into(),
                    )));
                }
            }
        }
    }
}

/// Mechanism selection state of a single handshake.
struct Session<'a> {
    mechanisms: &'a [MechanismKind],
    credentials: Option<&'a Credentials>,
    keyring: &'a Keyring,
    supported: Vec<String>,
    attempted: Vec<&'static str>,
    guid: Option<Guid>,
}

impl Session<'_> {
    /// Handle a `REJECTED` line by picking the next mechanism and sending its
    /// `AUTH` line.
    ///
    /// The list of mechanisms supported by the server is recorded from the
    /// first `REJECTED` line only.
    async fn rejected<T>(
        &mut self,
        lines: &mut Lines<'_, T>,
        line: &str,
    ) -> Result<Box<dyn Mechanism>>
    where
        T: ?Sized + Transport,
    {
        let Some(list) = line.strip_prefix("REJECTED ") else {
            return Err(Error::new(ErrorKind::ExpectedRejected(line.into())));
        };

        if self.supported.is_empty() {
            self.supported = list.split(' ').map(String::from).collect();
        }

        loop {
            auth_debug!("CLIENT: Trying to choose mechanism");

            let Some(kind) = self.choose() else {
                auth_debug!("CLIENT: Exhausted all available mechanisms");

                return Err(Error::new(ErrorKind::Exhausted {
                    tried: self.attempted.iter().map(|name| String::from(*name)).collect(),
                    available: self.supported.clone(),
                }));
            };

            auth_debug!(mechanism = kind.name(), "CLIENT: Trying mechanism");
            self.attempted.push(kind.name());

            if !kind.is_supported(self.credentials) {
                auth_debug!(
                    mechanism = kind.name(),
                    "CLIENT: Mechanism says it is not supported"
                );
                continue;
            }

            let mut mechanism = kind.instantiate(self.credentials.cloned(), self.keyring);

            let line = match mechanism.client_initiate() {
                Some(initial) => format!("AUTH {} {}", kind.name(), hex_encode(&initial)),
                None => format!("AUTH {}", kind.name()),
            };

            auth_debug!(%line, "CLIENT: writing");
            lines.write_line(&line).await?;
            return Ok(mechanism);
        }
    }

    /// The most preferred local mechanism which the server supports and which
    /// has not been attempted.
    fn choose(&self) -> Option<MechanismKind> {
        self.mechanisms.iter().copied().find(|kind| {
            self.supported.iter().any(|name| name == kind.name())
                && !self.attempted.contains(&kind.name())
        })
    }
}

fn initial_state(mechanism: &dyn Mechanism) -> State {
    if mechanism.client_state() == MechanismState::WaitingForData {
        State::WaitingForData
    } else {
        State::WaitingForOk
    }
}

/// Test for an `ERROR` line, optionally followed by a message.
fn is_error(line: &str) -> bool {
    match line.strip_prefix("ERROR") {
        Some(rest) => rest.is_empty() || rest.starts_with(|c: char| c.is_ascii_whitespace()),
        None => false,
    }
}
