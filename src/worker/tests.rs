use std::time::Duration;

use anyhow::Result;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::Error;
use crate::message::{Message, RawMessage};
use crate::protocol::{Endianness, Header, MessageType};
use crate::sasl::Capabilities;
use crate::transport::IoTransport;

use super::{Handler, Outgoing, Worker, WorkerBuilder};

const QUIET: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Event {
    Message(RawMessage),
    Disconnected(bool, Option<Error>),
}

struct Events(mpsc::UnboundedSender<Event>);

impl Handler<RawMessage> for Events {
    fn on_message(&mut self, message: RawMessage) {
        let _ = self.0.send(Event::Message(message));
    }

    fn on_disconnected(&mut self, remote_peer_vanished: bool, error: Option<Error>) {
        let _ = self.0.send(Event::Disconnected(remote_peer_vanished, error));
    }
}

/// Drops the message with serial 2 and renumbers the message with serial 3.
struct Rewrite(Events);

impl Handler<RawMessage> for Rewrite {
    fn on_message(&mut self, message: RawMessage) {
        <Events as Handler<RawMessage>>::on_message(&mut self.0, message);
    }

    fn on_outgoing(&mut self, message: RawMessage) -> Outgoing<RawMessage> {
        match message.header().serial {
            2 => Outgoing::Dropped,
            3 => Outgoing::Replaced(blob(30, message.body())),
            _ => Outgoing::Unchanged(message),
        }
    }

    fn on_disconnected(&mut self, remote_peer_vanished: bool, error: Option<Error>) {
        <Events as Handler<RawMessage>>::on_disconnected(
            &mut self.0,
            remote_peer_vanished,
            error,
        );
    }
}

/// A message which refuses to decode.
struct Refused;

impl Message for Refused {
    fn decode(_: &[u8], _: Capabilities) -> crate::Result<Self> {
        Err(Error::invalid_message("refused"))
    }

    fn encode(&self, _: Capabilities) -> crate::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

impl Handler<Refused> for Events {
    fn on_message(&mut self, _: Refused) {}

    fn on_disconnected(&mut self, remote_peer_vanished: bool, error: Option<Error>) {
        let _ = self.0.send(Event::Disconnected(remote_peer_vanished, error));
    }
}

fn bytes(serial: u32, body: &[u8]) -> Vec<u8> {
    let header = Header {
        endianness: Endianness::LITTLE,
        message_type: MessageType::SIGNAL,
        flags: 0,
        version: 1,
        body_length: body.len() as u32,
        serial,
        fields_length: 0,
    };

    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

fn blob(serial: u32, body: &[u8]) -> RawMessage {
    RawMessage::new(bytes(serial, body)).expect("valid message")
}

type Setup = (Worker<RawMessage>, DuplexStream, mpsc::UnboundedReceiver<Event>);

fn setup(builder: &WorkerBuilder) -> Result<Setup> {
    let (a, b) = duplex(4096);
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = builder.build(IoTransport::new(a), Events(tx))?;
    Ok((worker, b, rx))
}

fn send(worker: &Worker<RawMessage>, serial: u32, body: &[u8]) -> Result<()> {
    worker.send_message(blob(serial, body), bytes(serial, body))?;
    Ok(())
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Result<Event> {
    match timeout(Duration::from_secs(5), rx.recv()).await? {
        Some(event) => Ok(event),
        None => anyhow::bail!("handler dropped"),
    }
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Event>) -> Result<RawMessage> {
    match next(rx).await? {
        Event::Message(message) => Ok(message),
        event => anyhow::bail!("expected message, got {event:?}"),
    }
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

#[tokio::test]
async fn test_receive_in_order() -> Result<()> {
    let (_worker, mut peer, mut rx) = setup(&WorkerBuilder::new())?;

    let mut wire = bytes(1, b"first");
    wire.extend(bytes(2, b"second"));
    peer.write_all(&wire).await?;

    let first = next_message(&mut rx).await?;
    assert_eq!(first.header().serial, 1);
    assert_eq!(first.body(), b"first");

    let second = next_message(&mut rx).await?;
    assert_eq!(second.header().serial, 2);
    assert_eq!(second.body(), b"second");
    Ok(())
}

#[tokio::test]
async fn test_send_in_order() -> Result<()> {
    let (worker, mut peer, _rx) = setup(&WorkerBuilder::new())?;

    let mut expected = Vec::new();

    for serial in 1..=3 {
        send(&worker, serial, b"ping")?;
        expected.extend(bytes(serial, b"ping"));
    }

    worker.flush().await?;

    let mut actual = vec![0; expected.len()];
    peer.read_exact(&mut actual).await?;
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test]
async fn test_flush_without_messages() -> Result<()> {
    let (worker, _peer, _rx) = setup(&WorkerBuilder::new())?;
    worker.flush().await?;
    worker.flush().await?;
    Ok(())
}

#[tokio::test]
async fn test_frozen_until_unfrozen() -> Result<()> {
    let (worker, mut peer, mut rx) = setup(WorkerBuilder::new().frozen(true))?;

    peer.write_all(&bytes(1, b"held")).await?;
    peer.write_all(&bytes(2, b"held")).await?;
    assert_quiet(&mut rx).await;

    worker.unfreeze();

    assert_eq!(next_message(&mut rx).await?.header().serial, 1);
    assert_eq!(next_message(&mut rx).await?.header().serial, 2);

    peer.write_all(&bytes(3, b"live")).await?;
    assert_eq!(next_message(&mut rx).await?.header().serial, 3);
    Ok(())
}

#[tokio::test]
async fn test_prefetched() -> Result<()> {
    let wire = bytes(7, b"split across");
    let (head, tail) = wire.split_at(5);

    let (_worker, mut peer, mut rx) = setup(WorkerBuilder::new().prefetched(head.to_vec()))?;
    peer.write_all(tail).await?;

    let message = next_message(&mut rx).await?;
    assert_eq!(message.header().serial, 7);
    assert_eq!(message.body(), b"split across");
    Ok(())
}

#[tokio::test]
async fn test_outgoing_filter() -> Result<()> {
    let (a, mut peer) = duplex(4096);
    let (tx, _rx) = mpsc::unbounded_channel();
    let worker = WorkerBuilder::new().build(IoTransport::new(a), Rewrite(Events(tx)))?;

    for serial in 1..=3 {
        send(&worker, serial, b"data")?;
    }

    // The dropped message still counts towards the flush.
    worker.flush().await?;

    let mut expected = bytes(1, b"data");
    expected.extend(bytes(30, b"data"));

    let mut actual = vec![0; expected.len()];
    peer.read_exact(&mut actual).await?;
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test]
async fn test_remote_disconnect() -> Result<()> {
    let (worker, peer, mut rx) = setup(&WorkerBuilder::new())?;
    drop(peer);

    match next(&mut rx).await? {
        Event::Disconnected(true, Some(..)) => {}
        event => panic!("unexpected event {event:?}"),
    }

    // Closing a transport whose peer is gone may fail, but no further
    // disconnect is reported.
    let _ = worker.close().await;
    assert_quiet(&mut rx).await;
    Ok(())
}

#[tokio::test]
async fn test_malformed_header_disconnects() -> Result<()> {
    let (_worker, mut peer, mut rx) = setup(&WorkerBuilder::new())?;

    let mut wire = bytes(1, b"");
    wire[0] = b'x';
    peer.write_all(&wire).await?;

    assert!(matches!(next(&mut rx).await?, Event::Disconnected(true, Some(..))));
    Ok(())
}

#[tokio::test]
async fn test_decode_error_disconnects() -> Result<()> {
    let (a, mut peer) = duplex(4096);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _worker = WorkerBuilder::new().build::<_, Refused, _>(IoTransport::new(a), Events(tx))?;

    peer.write_all(&bytes(1, b"nope")).await?;

    match next(&mut rx).await? {
        Event::Disconnected(true, Some(error)) => {
            assert_eq!(error.to_string(), "refused");
        }
        event => panic!("unexpected event {event:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_close() -> Result<()> {
    let (worker, mut peer, mut rx) = setup(&WorkerBuilder::new())?;

    send(&worker, 1, b"before")?;
    worker.flush().await?;
    worker.close().await?;

    assert!(matches!(next(&mut rx).await?, Event::Disconnected(false, None)));

    assert!(send(&worker, 2, b"after").is_err());
    assert!(worker.flush().await.is_err());

    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await?;
    assert_eq!(rest, bytes(1, b"before"));

    assert_quiet(&mut rx).await;
    Ok(())
}

#[tokio::test]
async fn test_stop_suppresses_callbacks() -> Result<()> {
    let (worker, mut peer, mut rx) = setup(&WorkerBuilder::new())?;

    worker.stop();
    let _ = peer.write_all(&bytes(1, b"ignored")).await;
    drop(peer);

    assert_quiet(&mut rx).await;
    Ok(())
}

#[tokio::test]
async fn test_send_message_checks() -> Result<()> {
    let (worker, _peer, _rx) = setup(&WorkerBuilder::new())?;

    let header = bytes(1, b"");
    let error = worker
        .send_message(blob(1, b""), header)
        .expect_err("blob without body");
    assert_eq!(
        error.to_string(),
        "Message blob of 16 bytes is shorter than the fixed header"
    );

    assert_eq!(worker.capabilities(), Capabilities::EMPTY);
    Ok(())
}

#[tokio::test]
async fn test_flush_sync_from_runtime() -> Result<()> {
    let (worker, _peer, _rx) = setup(&WorkerBuilder::new())?;
    let error = worker.flush_sync().expect_err("inside a runtime");
    assert_eq!(
        error.to_string(),
        "Cannot block on a flush from within an asynchronous runtime"
    );
    Ok(())
}

#[test]
fn test_flush_sync() -> Result<()> {
    let (a, mut peer) = duplex(4096);
    let (tx, _rx) = mpsc::unbounded_channel();
    let worker = WorkerBuilder::new().build::<_, RawMessage, _>(IoTransport::new(a), Events(tx))?;

    send(&worker, 1, b"blocking")?;
    worker.flush_sync()?;

    let runtime = tokio::runtime::Builder::new_current_thread().build()?;

    let actual = runtime.block_on(async move {
        let mut actual = vec![0; bytes(1, b"blocking").len()];
        peer.read_exact(&mut actual).await?;
        Ok::<_, anyhow::Error>(actual)
    })?;

    assert_eq!(actual, bytes(1, b"blocking"));
    Ok(())
}

#[test]
fn test_flush_sync_after_send_on_other_thread() -> Result<()> {
    let (a, mut peer) = duplex(4096);
    let (tx, _rx) = mpsc::unbounded_channel();
    let worker = WorkerBuilder::new().build::<_, RawMessage, _>(IoTransport::new(a), Events(tx))?;

    std::thread::scope(|scope| {
        scope
            .spawn(|| send(&worker, 1, b"from elsewhere"))
            .join()
            .map_err(|_| anyhow::anyhow!("sending thread panicked"))??;

        scope
            .spawn(|| worker.flush_sync())
            .join()
            .map_err(|_| anyhow::anyhow!("flushing thread panicked"))??;

        Ok::<_, anyhow::Error>(())
    })?;

    // Everything is already on the wire, so a reader with no time to wait
    // still sees the whole message.
    let expected = bytes(1, b"from elsewhere");
    let mut actual = vec![0; expected.len()];

    let runtime = tokio::runtime::Builder::new_current_thread().build()?;
    runtime.block_on(async { peer.read_exact(&mut actual).await })?;

    assert_eq!(actual, expected);
    Ok(())
}

#[cfg(all(unix, feature = "libc"))]
#[tokio::test]
async fn test_fds_between_workers() -> Result<()> {
    use std::fs::File;
    use std::os::fd::OwnedFd;

    use crate::fd_list::FdList;
    use crate::transport::UnixTransport;

    let (a, b) = UnixTransport::pair()?;

    let (tx, _rx) = mpsc::unbounded_channel();
    let sender = WorkerBuilder::new()
        .capabilities(Capabilities::UNIX_FD_PASSING)
        .build::<_, RawMessage, _>(a, Events(tx))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _receiver = WorkerBuilder::new()
        .capabilities(Capabilities::UNIX_FD_PASSING)
        .build::<_, RawMessage, _>(b, Events(tx))?;

    let mut fds = FdList::new();
    fds.push(OwnedFd::from(File::open("/dev/null")?));

    sender.send_message(blob(1, b"with fd").with_fds(fds), bytes(1, b"with fd"))?;
    sender.flush().await?;

    let mut message = next_message(&mut rx).await?;
    assert_eq!(message.header().serial, 1);
    assert_eq!(message.body(), b"with fd");
    assert_eq!(message.take_fds().len(), 1);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_fds_require_negotiation() -> Result<()> {
    use std::fs::File;
    use std::os::fd::OwnedFd;

    use crate::fd_list::FdList;

    let (worker, _peer, _rx) = setup(&WorkerBuilder::new())?;

    let mut fds = FdList::new();
    fds.push(OwnedFd::from(File::open("/dev/null")?));

    let error = worker
        .send_message(blob(1, b"fd").with_fds(fds), bytes(1, b"fd"))
        .expect_err("fd passing was not negotiated");

    assert_eq!(
        error.to_string(),
        "Tried sending a file descriptor but remote peer does not support this capability"
    );
    Ok(())
}
