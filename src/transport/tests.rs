use anyhow::Result;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use crate::error::Category;
use crate::fd_list::FdList;

use super::{write_all, IoTransport, Transport};

#[tokio::test]
async fn test_io_transport() -> Result<()> {
    let (a, mut b) = duplex(64);
    let transport = IoTransport::new(a);

    write_all(&transport, b"hello").await?;
    transport.flush().await?;

    let mut buf = [0; 5];
    b.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello");

    b.write_all(b"world").await?;
    let mut buf = [0; 16];
    let n = transport.read(&mut buf).await?;
    assert_eq!(&buf[..n], &b"world"[..n]);

    transport.close().await?;
    assert_eq!(b.read(&mut buf).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_io_transport_has_no_ancillary() -> Result<()> {
    let (a, mut b) = duplex(64);
    let transport = IoTransport::new(a);

    assert!(!transport.supports_fd_passing());

    let error = transport
        .send_with_fds(0, &FdList::new())
        .await
        .expect_err("cannot pass file descriptors");
    assert_eq!(error.category(), Category::NotSupported);

    let error = transport.peer_credentials().expect_err("no peer credentials");
    assert_eq!(error.category(), Category::NotSupported);

    assert!(transport.send_credentials().await?.is_none());
    let mut nul = [1];
    b.read_exact(&mut nul).await?;
    assert_eq!(nul, [0]);

    b.write_all(&[0]).await?;
    assert!(transport.receive_credentials().await?.is_none());

    drop(b);
    let error = transport
        .receive_credentials()
        .await
        .expect_err("peer is gone");
    assert_eq!(
        error.to_string(),
        "Underlying stream returned 0 bytes on an async read"
    );
    Ok(())
}

#[cfg(all(unix, feature = "libc"))]
mod unix {
    use std::fs::File;
    use std::os::fd::OwnedFd;

    use anyhow::Result;

    use crate::fd_list::FdList;
    use crate::transport::{Ancillary, Transport, UnixTransport};

    #[tokio::test]
    async fn test_fd_passing() -> Result<()> {
        let (a, b) = UnixTransport::pair()?;
        assert!(a.supports_fd_passing());

        let mut fds = FdList::new();
        fds.push(OwnedFd::from(File::open("/dev/null")?));
        fds.push(OwnedFd::from(File::open("/dev/null")?));

        a.send_with_fds(b'l', &fds).await?;

        let mut buf = [0; 8];
        let mut ancillary = Vec::new();
        let n = b.read_with_ancillary(&mut buf, &mut ancillary).await?;
        assert_eq!(&buf[..n], b"l");

        let received = ancillary
            .into_iter()
            .map(|ancillary| match ancillary {
                Ancillary::Fds(fds) => fds.len(),
                other => panic!("unexpected ancillary {other:?}"),
            })
            .sum::<usize>();

        assert_eq!(received, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_is_seen_by_peer() -> Result<()> {
        let (a, b) = UnixTransport::pair()?;
        a.close().await?;

        let mut buf = [0; 8];
        assert_eq!(b.read(&mut buf).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_sent_credentials_are_our_own() -> Result<()> {
        let (a, b) = UnixTransport::pair()?;

        // SAFETY: This has no preconditions.
        let uid = unsafe { libc::geteuid() };

        let sent = a.send_credentials().await?.expect("sent credentials");
        assert_eq!(sent.unix_user()?, uid);

        // Whether or not the credentials came along, the NUL byte did.
        if let Some(received) = b.receive_credentials().await? {
            assert_eq!(received.unix_user()?, uid);
        }

        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_credentials() -> Result<()> {
        let (a, b) = UnixTransport::pair()?;

        // SAFETY: This has no preconditions.
        let uid = unsafe { libc::geteuid() };

        let sent = a.send_credentials().await?.expect("sent credentials");
        assert_eq!(sent.unix_user()?, uid);

        let received = b.receive_credentials().await?.expect("received credentials");
        assert_eq!(received.unix_user()?, uid);
        assert!(received.is_same_user(&sent)?);

        let peer = b.peer_credentials()?;
        assert_eq!(peer.unix_user()?, uid);
        assert_eq!(peer.unix_pid()?, std::process::id() as i32);
        Ok(())
    }
}
