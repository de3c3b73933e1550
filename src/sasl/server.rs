use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::credentials::Credentials;
use crate::error::{Category, Error, ErrorKind, Result};
use crate::transport::Transport;

use super::line::{cancellable, Lines};
use super::mechanism::{Mechanism, MechanismKind, MechanismState};
use super::{hex_decode, hex_encode, Capabilities, Guid, Keyring, Observer};

/// The result of a successful server handshake.
#[derive(Debug)]
#[non_exhaustive]
pub struct ServerOutcome {
    /// The capabilities which were negotiated.
    pub capabilities: Capabilities,
    /// The credentials of the peer, if they could be determined.
    pub credentials: Option<Credentials>,
    /// Bytes which were read past the `BEGIN` line.
    ///
    /// These belong to the first message sent by the client and must be fed
    /// to whatever reads messages next, such as [`WorkerBuilder::prefetched`].
    ///
    /// [`WorkerBuilder::prefetched`]: crate::worker::WorkerBuilder::prefetched
    pub residual: Vec<u8>,
}

/// Authenticate a connecting client.
///
/// # Examples
///
/// ```no_run
/// use tokio_dbus_peer::sasl::{Capabilities, Guid, ServerAuth};
/// use tokio_dbus_peer::transport::UnixTransport;
///
/// # #[tokio::main] async fn main() -> tokio_dbus_peer::Result<()> {
/// let listener = std::os::unix::net::UnixListener::bind("/tmp/example.sock")?;
/// let (stream, _) = listener.accept()?;
/// let transport = UnixTransport::new(stream)?;
///
/// let outcome = ServerAuth::new(Guid::generate())
///     .require_same_user(true)
///     .offer(Capabilities::UNIX_FD_PASSING)
///     .run(&transport)
///     .await?;
///
/// println!("Authenticated {:?}", outcome.credentials);
/// # Ok(()) }
/// ```
pub struct ServerAuth {
    guid: Guid,
    allow_anonymous: bool,
    require_same_user: bool,
    offer: Capabilities,
    observer: Option<Arc<dyn Observer>>,
    keyring: Option<Keyring>,
    cancellation: Option<CancellationToken>,
}

impl ServerAuth {
    /// Construct a new server handshake announcing the given GUID.
    pub fn new(guid: Guid) -> Self {
        Self {
            guid,
            allow_anonymous: false,
            require_same_user: false,
            offer: Capabilities::EMPTY,
            observer: None,
            keyring: None,
            cancellation: None,
        }
    }

    /// Permit clients to use the `ANONYMOUS` mechanism.
    pub fn allow_anonymous(&mut self, allow_anonymous: bool) -> &mut Self {
        self.allow_anonymous = allow_anonymous;
        self
    }

    /// Require that the client runs as the same user as the server.
    pub fn require_same_user(&mut self, require_same_user: bool) -> &mut Self {
        self.require_same_user = require_same_user;
        self
    }

    /// Capabilities to offer to the client.
    pub fn offer(&mut self, capabilities: Capabilities) -> &mut Self {
        self.offer = capabilities;
        self
    }

    /// Observer which may veto mechanisms and authenticated peers.
    pub fn observer<O>(&mut self, observer: O) -> &mut Self
    where
        O: 'static + Observer,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// The keyring used to hand out cookies for `DBUS_COOKIE_SHA1`.
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

    /// The mechanisms advertised to the client, in order of preference.
    fn mechanisms(&self) -> Vec<MechanismKind> {
        MechanismKind::all()
            .into_iter()
            .filter(|kind| self.allow_anonymous || *kind != MechanismKind::Anonymous)
            .filter(|kind| match &self.observer {
                Some(observer) => observer.allow_mechanism(kind.name()),
                None => true,
            })
            .collect()
    }

    /// Run the handshake over the given transport.
    ///
    /// On success nothing past the `BEGIN` line has been consumed from the
    /// transport, except for what is returned in [`ServerOutcome::residual`].
    pub async fn run<T>(&self, transport: &T) -> Result<ServerOutcome>
    where
        T: ?Sized + Transport,
    {
        if !Guid::is_valid(self.guid.as_str()) {
            return Err(Error::new(ErrorKind::InvalidGuid(self.guid.as_str().into())));
        }

        let cancel = self.cancellation.as_ref();
        let keyring = self.keyring.clone().unwrap_or_else(Keyring::from_env);
        let mechanisms = self.mechanisms();

        let rejected = format!(
            "REJECTED {}",
            mechanisms
                .iter()
                .map(|kind| kind.name())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let credentials = receive_credentials(transport, cancel).await?;

        match &credentials {
            Some(credentials) => {
                auth_debug!(%credentials, "SERVER: received credentials");
            }
            None => {
                auth_debug!("SERVER: didn't receive any credentials");
            }
        }

        let own_credentials = Credentials::current();
        let mut lines = Lines::new(transport, cancel);
        let mut capabilities = Capabilities::EMPTY;
        let mut mechanism: Option<Box<dyn Mechanism>> = None;
        let mut state = State::WaitingForAuth;

        loop {
            auth_debug!(?state, "SERVER");

            state = match state {
                State::WaitingForAuth => {
                    let line = lines.read_line().await?;
                    auth_debug!(%line, "SERVER: WaitingForAuth, read");

                    if line == "AUTH" {
                        write(&mut lines, &rejected).await?;
                        continue;
                    }

                    if !line.starts_with("AUTH ") {
                        return Err(Error::new(ErrorKind::UnexpectedLine(
                            "WaitingForAuth",
                            line.into(),
                        )));
                    }

                    let tokens = line.split(' ').collect::<Vec<_>>();

                    let (name, encoded) = match tokens[..] {
                        [_, name] => (name, None),
                        [_, name, encoded] => (name, Some(encoded)),
                        _ => {
                            return Err(Error::new(ErrorKind::UnexpectedLine(
                                "WaitingForAuth",
                                line.as_str().into(),
                            )));
                        }
                    };

                    let Some(kind) = MechanismKind::from_name(name)
                        .filter(|kind| mechanisms.contains(kind))
                    else {
                        auth_debug!(mechanism = name, "SERVER: unsupported mechanism");
                        write(&mut lines, &rejected).await?;
                        continue;
                    };

                    let initial_response = match encoded {
                        Some(encoded) => Some(
                            hex_decode(encoded)
                                .map_err(|e| e.with_prefix("Initial response is malformed: "))?,
                        ),
                        None => None,
                    };

                    if let Some(mut old) = mechanism.take() {
                        old.server_shutdown();
                    }

                    let mut new = kind.instantiate(credentials.clone(), &keyring);
                    new.server_initiate(initial_response.as_deref());
                    mechanism = Some(new);
                    State::ChangeState
                }
                State::ChangeState => {
                    let Some(current) = mechanism.as_mut() else {
                        state = State::WaitingForAuth;
                        continue;
                    };

                    match current.server_state() {
                        MechanismState::Accepted => {
                            if self.require_same_user
                                && !is_same_user(credentials.as_ref(), &own_credentials)
                            {
                                return Err(Error::new(ErrorKind::NotSameUser));
                            }

                            if let Some(observer) = &self.observer {
                                if !observer.authorize_authenticated_peer(credentials.as_ref()) {
                                    return Err(Error::new(ErrorKind::PeerNotAuthorized));
                                }
                            }

                            write(&mut lines, &format!("OK {}", self.guid)).await?;
                            State::WaitingForBegin
                        }
                        MechanismState::WaitingForData => State::WaitingForData,
                        MechanismState::HaveDataToSend => {
                            if let Some(data) = current.server_data_send() {
                                write(&mut lines, &format!("DATA {}", hex_encode(&data))).await?;
                            }

                            State::ChangeState
                        }
                        other => {
                            if other == MechanismState::Invalid {
                                tracing::error!(
                                    mechanism = current.name(),
                                    "Mechanism ended up in an invalid state"
                                );
                            } else if let Some(reason) = current.server_reject_reason() {
                                auth_debug!(mechanism = current.name(), %reason, "SERVER: rejected");
                            }

                            write(&mut lines, &rejected).await?;
                            State::WaitingForAuth
                        }
                    }
                }
                State::WaitingForData => {
                    let line = lines.read_line().await?;
                    auth_debug!(%line, "SERVER: WaitingForData, read");

                    let Some(encoded) = line.strip_prefix("DATA ") else {
                        return Err(Error::new(ErrorKind::UnexpectedLine(
                            "WaitingForData",
                            line.into(),
                        )));
                    };

                    let data = hex_decode(encoded.trim())
                        .map_err(|e| e.with_prefix("DATA response is malformed: "))?;

                    if let Some(current) = mechanism.as_mut() {
                        current.server_data_receive(&data);
                    }

                    State::ChangeState
                }
                State::WaitingForBegin => {
                    let line = lines.read_line_safe().await?;
                    auth_debug!(%line, "SERVER: WaitingForBegin, read");

                    match line.as_str() {
                        "BEGIN" => break,
                        "NEGOTIATE_UNIX_FD" => {
                            if self.offer.contains(Capabilities::UNIX_FD_PASSING) {
                                capabilities |= Capabilities::UNIX_FD_PASSING;
                                write(&mut lines, "AGREE_UNIX_FD").await?;
                            } else {
                                write(&mut lines, "ERROR \"fd passing not offered\"").await?;
                            }
                        }
                        _ => {
                            tracing::debug!(%line, "Unexpected line while in WaitingForBegin state");
                            write(&mut lines, "ERROR \"Unknown Command\"").await?;
                        }
                    }

                    State::WaitingForBegin
                }
            };
        }

        if let Some(mut mechanism) = mechanism {
            mechanism.server_shutdown();
        }

        Ok(ServerOutcome {
            capabilities,
            credentials,
            residual: lines.into_residual(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForAuth,
    ChangeState,
    WaitingForData,
    WaitingForBegin,
}

async fn write<T>(lines: &mut Lines<'_, T>, line: &str) -> Result<()>
where
    T: ?Sized + Transport,
{
    auth_debug!(%line, "SERVER: writing");
    lines.write_line(line).await
}

/// Read the leading NUL byte, collecting the peer credentials.
///
/// Credentials are queried from the socket first, and otherwise taken from
/// the control message attached to the NUL byte.
async fn receive_credentials<T>(
    transport: &T,
    cancel: Option<&CancellationToken>,
) -> Result<Option<Credentials>>
where
    T: ?Sized + Transport,
{
    let credentials = match transport.peer_credentials() {
        Ok(credentials) => Some(credentials),
        Err(error) if error.category() == Category::NotSupported => None,
        Err(error) => return Err(error),
    };

    if credentials.is_some() {
        let mut byte = [0];

        if cancellable(cancel, transport.read(&mut byte)).await? == 0 {
            return Err(Error::new(ErrorKind::ZeroRead));
        }

        return Ok(credentials);
    }

    match cancellable(cancel, transport.receive_credentials()).await {
        Ok(credentials) => Ok(credentials),
        Err(error) if error.category() == Category::NotSupported => Ok(None),
        Err(error) => Err(error),
    }
}

fn is_same_user(credentials: Option<&Credentials>, own: &Credentials) -> bool {
    match credentials {
        Some(credentials) => credentials.is_same_user(own).unwrap_or(false),
        None => false,
    }
}
