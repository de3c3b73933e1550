use anyhow::Result;
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::credentials::Credentials;
use crate::error::Category;
use crate::transport::IoTransport;

use super::{hex_decode, hex_encode, Capabilities, ClientAuth, Guid, Observer, ServerAuth};

const GUID: &str = "0123456789abcdef0123456789abcdef";

/// The raw side of a handshake, scripted by a test.
struct Peer {
    io: BufReader<DuplexStream>,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            io: BufReader::new(stream),
        }
    }

    async fn read_nul(&mut self) -> Result<()> {
        let mut byte = [1];
        self.io.read_exact(&mut byte).await?;
        assert_eq!(byte, [0]);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.io.read_until(b'\n', &mut buf).await?;
        assert!(buf.ends_with(b"\r\n"), "{:?}", bstr::BStr::new(&buf));
        buf.truncate(buf.len() - 2);
        Ok(String::from_utf8(buf)?)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.get_mut().write_all(bytes).await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.write(format!("{line}\r\n").as_bytes()).await
    }
}

fn scripted() -> (IoTransport<DuplexStream>, Peer) {
    let (a, b) = duplex(4096);
    (IoTransport::new(a), Peer::new(b))
}

struct Deny(&'static str);

impl Observer for Deny {
    fn allow_mechanism(&self, name: &str) -> bool {
        name != self.0
    }
}

struct Unauthorized;

impl Observer for Unauthorized {
    fn authorize_authenticated_peer(&self, _: Option<&Credentials>) -> bool {
        false
    }
}

#[test]
fn test_hex() -> Result<()> {
    assert_eq!(hex_encode(b"GDBus 0.1"), "474442757320302e31");
    assert_eq!(hex_decode("474442757320302E31")?, b"GDBus 0.1");
    assert_eq!(hex_decode("")?, b"");

    assert_eq!(
        hex_decode("31zz").unwrap_err().to_string(),
        "Error hexdecoding string '31zz' around position 2"
    );
    Ok(())
}

#[test]
fn test_guid() {
    assert!(Guid::is_valid(GUID));
    assert!(Guid::is_valid("0123456789ABCDEF0123456789ABCDEF"));
    assert!(!Guid::is_valid("0123456789abcdef0123456789abcde"));
    assert!(!Guid::is_valid("0123456789abcdef0123456789abcdeg"));

    let error = "bogus".parse::<Guid>().unwrap_err();
    assert_eq!(error.to_string(), "The given GUID 'bogus' is not valid");
    assert_eq!(error.category(), Category::InvalidData);

    let a = Guid::generate();
    let b = Guid::generate();
    assert!(Guid::is_valid(a.as_str()));
    assert_ne!(a, b);
}

#[test]
fn test_capabilities() {
    let mut capabilities = Capabilities::EMPTY;
    assert!(capabilities.is_empty());
    capabilities |= Capabilities::UNIX_FD_PASSING;
    assert!(capabilities.contains(Capabilities::UNIX_FD_PASSING));
}

#[tokio::test]
async fn test_client_anonymous_wire() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ClientAuth::new();

    let script = async {
        peer.read_nul().await?;
        assert_eq!(peer.read_line().await?, "AUTH");
        peer.write_line("REJECTED EXTERNAL ANONYMOUS DBUS_COOKIE_SHA1")
            .await?;
        // No credentials were sent, so EXTERNAL is skipped.
        assert_eq!(peer.read_line().await?, "AUTH ANONYMOUS 474442757320302e31");
        peer.write_line(&format!("OK {GUID}")).await?;
        assert_eq!(peer.read_line().await?, "BEGIN");
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    let outcome = outcome?;
    assert_eq!(outcome.guid.as_str(), GUID);
    assert!(outcome.capabilities.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_anonymous_handshake() -> Result<()> {
    let (a, b) = duplex(4096);
    let client = IoTransport::new(a);
    let server = IoTransport::new(b);

    let guid = Guid::generate();
    let client_auth = ClientAuth::new();
    let mut server_auth = ServerAuth::new(guid.clone());
    server_auth.allow_anonymous(true);

    let (client_outcome, server_outcome) =
        tokio::join!(client_auth.run(&client), server_auth.run(&server));

    let client_outcome = client_outcome?;
    let server_outcome = server_outcome?;

    assert_eq!(client_outcome.guid, guid);
    assert!(client_outcome.capabilities.is_empty());
    assert!(server_outcome.capabilities.is_empty());
    assert!(server_outcome.credentials.is_none());
    assert!(server_outcome.residual.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_fd_passing_agreed() -> Result<()> {
    let (a, b) = duplex(4096);
    let client = IoTransport::new(a);
    let server = IoTransport::new(b);

    let mut client_auth = ClientAuth::new();
    client_auth.offer(Capabilities::UNIX_FD_PASSING);

    let mut server_auth = ServerAuth::new(GUID.parse()?);
    server_auth
        .allow_anonymous(true)
        .offer(Capabilities::UNIX_FD_PASSING);

    let (client_outcome, server_outcome) =
        tokio::join!(client_auth.run(&client), server_auth.run(&server));

    assert_eq!(client_outcome?.capabilities, Capabilities::UNIX_FD_PASSING);
    assert_eq!(server_outcome?.capabilities, Capabilities::UNIX_FD_PASSING);
    Ok(())
}

#[tokio::test]
async fn test_fd_passing_not_offered() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ClientAuth::new();
    auth.offer(Capabilities::UNIX_FD_PASSING);

    let script = async {
        peer.read_nul().await?;
        assert_eq!(peer.read_line().await?, "AUTH");
        peer.write_line("REJECTED ANONYMOUS").await?;
        assert!(peer.read_line().await?.starts_with("AUTH ANONYMOUS "));
        peer.write_line(&format!("OK {GUID}")).await?;
        assert_eq!(peer.read_line().await?, "NEGOTIATE_UNIX_FD");
        peer.write_line("ERROR \"fd passing not offered\"").await?;
        assert_eq!(peer.read_line().await?, "BEGIN");
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;
    assert!(outcome?.capabilities.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_client_exhausted() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ClientAuth::new();

    let script = async {
        peer.read_nul().await?;
        assert_eq!(peer.read_line().await?, "AUTH");
        peer.write_line("REJECTED KERBEROS_V4").await?;
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    assert_eq!(
        outcome.unwrap_err().to_string(),
        "Exhausted all available authentication mechanisms (tried: ) (available: KERBEROS_V4)"
    );
    Ok(())
}

#[tokio::test]
async fn test_client_keeps_first_rejected_list() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ClientAuth::new();

    let script = async {
        peer.read_nul().await?;
        assert_eq!(peer.read_line().await?, "AUTH");
        peer.write_line("REJECTED DBUS_COOKIE_SHA1 ANONYMOUS").await?;
        assert!(peer.read_line().await?.starts_with("AUTH ANONYMOUS "));
        peer.write_line("REJECTED EXTERNAL").await?;
        assert!(peer.read_line().await?.starts_with("AUTH DBUS_COOKIE_SHA1 "));
        peer.write_line("REJECTED EXTERNAL").await?;
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    assert_eq!(
        outcome.unwrap_err().to_string(),
        "Exhausted all available authentication mechanisms (tried: ANONYMOUS, DBUS_COOKIE_SHA1) (available: DBUS_COOKIE_SHA1, ANONYMOUS)"
    );
    Ok(())
}

#[tokio::test]
async fn test_client_observer_filters_mechanisms() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ClientAuth::new();
    auth.observer(Deny("ANONYMOUS"));

    let script = async {
        peer.read_nul().await?;
        assert_eq!(peer.read_line().await?, "AUTH");
        peer.write_line("REJECTED ANONYMOUS").await?;
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    assert_eq!(
        outcome.unwrap_err().to_string(),
        "Exhausted all available authentication mechanisms (tried: ) (available: ANONYMOUS)"
    );
    Ok(())
}

#[tokio::test]
async fn test_client_expects_rejected() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ClientAuth::new();

    let script = async {
        peer.read_nul().await?;
        assert_eq!(peer.read_line().await?, "AUTH");
        peer.write_line(&format!("OK {GUID}")).await?;
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    assert_eq!(
        outcome.unwrap_err().to_string(),
        format!("In WaitingForReject: Expected 'REJECTED am1 am2 ... amN', got 'OK {GUID}'")
    );
    Ok(())
}

#[tokio::test]
async fn test_client_unexpected_responses() -> Result<()> {
    for (response, expected, category) in [
        (
            String::from("DATA 00"),
            String::from("In WaitingForOk: unexpected response 'DATA 00'"),
            Category::Failed,
        ),
        (
            String::from("OK nothex"),
            String::from("Invalid OK response 'OK nothex'"),
            Category::InvalidData,
        ),
    ] {
        let (transport, mut peer) = scripted();
        let auth = ClientAuth::new();

        let script = async {
            peer.read_nul().await?;
            assert_eq!(peer.read_line().await?, "AUTH");
            peer.write_line("REJECTED ANONYMOUS").await?;
            assert!(peer.read_line().await?.starts_with("AUTH ANONYMOUS "));
            peer.write_line(&response).await?;
            Ok::<_, anyhow::Error>(())
        };

        let (outcome, script) = tokio::join!(auth.run(&transport), script);
        script?;

        let error = outcome.unwrap_err();
        assert_eq!(error.to_string(), expected);
        assert_eq!(error.category(), category);
    }

    Ok(())
}

#[tokio::test]
async fn test_client_cancelled() -> Result<()> {
    let (transport, _peer) = scripted();
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();

    let mut auth = ClientAuth::new();
    auth.cancellation(token);

    let error = auth.run(&transport).await.unwrap_err();
    assert!(error.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn test_server_rejects_anonymous_unless_allowed() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ServerAuth::new(GUID.parse()?);

    let script = async {
        peer.write(b"\0AUTH\r\n").await?;
        assert_eq!(peer.read_line().await?, "REJECTED EXTERNAL DBUS_COOKIE_SHA1");
        peer.write_line("AUTH ANONYMOUS 474442757320302e31").await?;
        assert_eq!(peer.read_line().await?, "REJECTED EXTERNAL DBUS_COOKIE_SHA1");
        peer.write_line("AUTH KERBEROS_V4").await?;
        assert_eq!(peer.read_line().await?, "REJECTED EXTERNAL DBUS_COOKIE_SHA1");
        peer.write_line("BOGUS").await?;
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    assert_eq!(
        outcome.unwrap_err().to_string(),
        "Unexpected line 'BOGUS' while in WaitingForAuth state"
    );
    Ok(())
}

#[tokio::test]
async fn test_server_observer_filters_mechanisms() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ServerAuth::new(GUID.parse()?);
    auth.allow_anonymous(true).observer(Deny("DBUS_COOKIE_SHA1"));

    let script = async {
        peer.write(b"\0AUTH\r\n").await?;
        assert_eq!(peer.read_line().await?, "REJECTED EXTERNAL ANONYMOUS");
        peer.write_line("AUTH DBUS_COOKIE_SHA1 31303030").await?;
        assert_eq!(peer.read_line().await?, "REJECTED EXTERNAL ANONYMOUS");
        peer.write_line("AUTH A B C").await?;
        Ok::<_, anyhow::Error>(())
    };

    let (outcome, script) = tokio::join!(auth.run(&transport), script);
    script?;

    assert_eq!(
        outcome.unwrap_err().to_string(),
        "Unexpected line 'AUTH A B C' while in WaitingForAuth state"
    );
    Ok(())
}

#[tokio::test]
async fn test_server_malformed_initial_response() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ServerAuth::new(GUID.parse()?);
    auth.allow_anonymous(true);

    peer.write(b"\0AUTH ANONYMOUS zz\r\n").await?;

    assert_eq!(
        auth.run(&transport).await.unwrap_err().to_string(),
        "Initial response is malformed: Error hexdecoding string 'zz' around position 0"
    );
    Ok(())
}

#[tokio::test]
async fn test_server_keeps_pipelined_bytes() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ServerAuth::new(GUID.parse()?);
    auth.allow_anonymous(true);

    peer.write(b"\0AUTH ANONYMOUS\r\nNEGOTIATE_UNIX_FD\r\nSTARTTLS\r\nBEGIN\r\nl\x01\x00\x01")
        .await?;

    let outcome = auth.run(&transport).await?;
    assert_eq!(outcome.residual, b"l\x01\x00\x01");
    assert!(outcome.capabilities.is_empty());

    assert_eq!(peer.read_line().await?, format!("OK {GUID}"));
    assert_eq!(peer.read_line().await?, "ERROR \"fd passing not offered\"");
    assert_eq!(peer.read_line().await?, "ERROR \"Unknown Command\"");
    Ok(())
}

#[tokio::test]
async fn test_server_require_same_user() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ServerAuth::new(GUID.parse()?);
    auth.allow_anonymous(true).require_same_user(true);

    // No credentials can be received over an in-memory stream.
    peer.write(b"\0AUTH ANONYMOUS\r\n").await?;

    assert_eq!(
        auth.run(&transport).await.unwrap_err().to_string(),
        "User IDs must be the same for peer and server"
    );
    Ok(())
}

#[tokio::test]
async fn test_server_observer_denies_peer() -> Result<()> {
    let (transport, mut peer) = scripted();
    let mut auth = ServerAuth::new(GUID.parse()?);
    auth.allow_anonymous(true).observer(Unauthorized);

    peer.write(b"\0AUTH ANONYMOUS\r\n").await?;

    let error = auth.run(&transport).await.unwrap_err();
    assert_eq!(error.to_string(), "Cancelled via authorize-authenticated-peer");
    assert_eq!(error.category(), Category::Failed);
    Ok(())
}

#[tokio::test]
async fn test_server_unexpected_data_line() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ServerAuth::new(GUID.parse()?);

    // EXTERNAL without an initial response waits for data.
    peer.write(b"\0AUTH EXTERNAL\r\nCANCEL\r\n").await?;

    assert_eq!(
        auth.run(&transport).await.unwrap_err().to_string(),
        "Unexpected line 'CANCEL' while in WaitingForData state"
    );
    Ok(())
}

#[cfg(all(unix, feature = "libc"))]
mod unix {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use anyhow::Result;
    use tokio::io::duplex;

    use crate::sasl::{ClientAuth, Guid, Keyring, ServerAuth};
    use crate::transport::IoTransport;

    use super::Deny;

    #[tokio::test]
    async fn test_cookie_sha1_handshake() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
        let keyring = Keyring::with_directory(dir.path());

        let (a, b) = duplex(4096);
        let client = IoTransport::new(a);
        let server = IoTransport::new(b);

        let mut client_auth = ClientAuth::new();
        client_auth.keyring(keyring.clone());

        let guid = Guid::generate();
        let mut server_auth = ServerAuth::new(guid.clone());
        server_auth.keyring(keyring).observer(Deny("EXTERNAL"));

        let (client_outcome, server_outcome) =
            tokio::join!(client_auth.run(&client), server_auth.run(&server));

        assert_eq!(client_outcome?.guid, guid);
        server_outcome?;

        let contents = fs::read_to_string(dir.path().join("org_gtk_gdbus_general"))?;
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("1 "));
        Ok(())
    }
}

#[cfg(all(target_os = "linux", feature = "libc"))]
mod linux {
    use anyhow::Result;

    use crate::credentials::Credentials;
use crate::error::Category;
    use crate::sasl::{ClientAuth, Guid, ServerAuth};
    use crate::transport::UnixTransport;

    #[tokio::test]
    async fn test_external_handshake() -> Result<()> {
        let (client, server) = UnixTransport::pair()?;

        let client_auth = ClientAuth::new();
        let mut server_auth = ServerAuth::new(Guid::generate());
        server_auth.require_same_user(true);

        let (client_outcome, server_outcome) =
            tokio::join!(client_auth.run(&client), server_auth.run(&server));

        client_outcome?;
        let server_outcome = server_outcome?;

        let credentials = server_outcome.credentials.expect("peer credentials");
        assert_eq!(credentials.unix_user()?, Credentials::current().unix_user()?);
        Ok(())
    }
}

#[tokio::test]
async fn test_server_line_too_long() -> Result<()> {
    let (transport, mut peer) = scripted();
    let auth = ServerAuth::new(GUID.parse()?);

    let mut line = b"\0AUTH ".to_vec();
    line.resize(line.len() + 16 * 1024 + 100, b'A');

    let (result, written) = tokio::join!(auth.run(&transport), peer.write(&line));
    written?;

    assert_eq!(
        result.unwrap_err().to_string(),
        "Line exceeds the maximum length of 16384 bytes"
    );
    Ok(())
}
