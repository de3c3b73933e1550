use std::sync::Arc;

use crate::debug;
use crate::error::{Error, ErrorKind, Result};
use crate::fd_list::FdList;
use crate::message::Message;
use crate::protocol::{self, HEADER_PREFIX};
use crate::transport::{Ancillary, Transport};

use super::{Action, Outgoing, Queued, Shared};

const MIN_READ: usize = 4096;

/// Reads whole message blobs off a transport.
struct Reader {
    buf: Vec<u8>,
    fds: FdList,
    ancillary: Vec<Ancillary>,
}

impl Reader {
    fn new(prefetched: Vec<u8>) -> Self {
        Self {
            buf: prefetched,
            fds: FdList::new(),
            ancillary: Vec::new(),
        }
    }

    /// Read the next blob along with any file descriptors received while
    /// reading it.
    async fn next<T>(&mut self, transport: &T) -> Result<(Vec<u8>, FdList)>
    where
        T: ?Sized + Transport,
    {
        self.fill(transport, HEADER_PREFIX).await?;
        let needed = protocol::bytes_needed(&self.buf[..HEADER_PREFIX])?;
        self.fill(transport, needed).await?;

        let rest = self.buf.split_off(needed);
        let blob = std::mem::replace(&mut self.buf, rest);
        Ok((blob, std::mem::take(&mut self.fds)))
    }

    async fn fill<T>(&mut self, transport: &T, target: usize) -> Result<()>
    where
        T: ?Sized + Transport,
    {
        while self.buf.len() < target {
            let start = self.buf.len();
            let want = (target - start).max(MIN_READ);
            self.buf.resize(start + want, 0);

            let result = transport
                .read_with_ancillary(&mut self.buf[start..], &mut self.ancillary)
                .await;

            let n = match result {
                Ok(n) => n,
                Err(error) => {
                    self.buf.truncate(start);
                    return Err(error);
                }
            };

            self.buf.truncate(start + n);

            for ancillary in self.ancillary.drain(..) {
                match ancillary {
                    Ancillary::Fds(fds) => {
                        self.fds.append(fds);
                    }
                    Ancillary::Credentials(..) => {}
                    Ancillary::Unknown { level, ty } => {
                        return Err(Error::new(ErrorKind::UnexpectedAncillary { level, ty }));
                    }
                }
            }

            if n == 0 {
                return Err(Error::new(ErrorKind::ZeroRead));
            }
        }

        Ok(())
    }
}

/// Read messages until the transport fails or the worker is closed.
pub(super) async fn read_loop<T, M>(shared: Arc<Shared<M>>, transport: Arc<T>, prefetched: Vec<u8>)
where
    T: Transport,
    M: Message,
{
    let mut reader = Reader::new(prefetched);

    let error = loop {
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => {
                break None;
            }
            result = reader.next(&*transport) => result,
        };

        let (blob, fds) = match result {
            Ok(read) => read,
            Err(error) => break Some(error),
        };

        let mut message = match M::decode(&blob, shared.capabilities) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    %error,
                    len = blob.len(),
                    "Failed to decode message\n{}",
                    debug::hexdump(&blob, 2)
                );

                break Some(error);
            }
        };

        if !fds.is_empty() {
            message.attach_fds(fds);
        }

        message_debug!(len = blob.len(), "Received message");

        if debug::payload() {
            message_debug!("\n{}", debug::hexdump(&blob, 2));
        }

        shared.deliver(message);
    };

    shared.reader_done.cancel();

    match error {
        Some(error) if !error.is_cancelled() && !shared.close_expected() => {
            shared.emit_disconnected(true, Some(error));
        }
        _ => {
            shared.emit_disconnected(false, None);
        }
    }
}

/// Write queued messages, flushes and the final close in order.
pub(super) async fn write_loop<T, M>(shared: Arc<Shared<M>>, transport: Arc<T>)
where
    T: Transport,
    M: Message,
{
    loop {
        match shared.next_action() {
            Action::Idle => {
                shared.wake.notified().await;
            }
            Action::Close => {
                shared.reader_done.cancelled().await;
                let result = transport.close().await;

                if let Err(error) = &result {
                    message_debug!(%error, "Failed to close transport");
                }

                shared.closed(result);
                return;
            }
            Action::Flush => {
                let result = transport.flush().await;
                shared.flushed(result);
            }
            Action::Write(queued) => {
                if let Some((message, blob)) = filter(&shared, queued) {
                    if let Err(error) = write_message(&*transport, &blob, message.fds()).await {
                        shared.emit_disconnected(true, Some(error));
                    }
                }

                shared.written();
            }
        }
    }
}

/// Pass a queued message through the outgoing filter, producing the message
/// and the blob to write for it.
fn filter<M>(shared: &Shared<M>, queued: Queued<M>) -> Option<(M, Vec<u8>)>
where
    M: Message,
{
    let Queued { message, blob } = queued;

    let (message, blob) = match shared.emit_outgoing(message) {
        Outgoing::Unchanged(message) => (message, blob),
        Outgoing::Replaced(message) => match message.encode(shared.capabilities) {
            Ok(encoded) => (message, encoded),
            Err(error) => {
                tracing::warn!(%error, "Failed to encode replaced message, sending original");
                (message, blob)
            }
        },
        Outgoing::Dropped => {
            message_debug!(len = blob.len(), "Dropped outgoing message");
            return None;
        }
    };

    message_debug!(
        len = blob.len(),
        fds = message.fds().map_or(0, FdList::len),
        "Sending message"
    );

    if debug::payload() {
        message_debug!("\n{}", debug::hexdump(&blob, 2));
    }

    Some((message, blob))
}

async fn write_message<T>(transport: &T, mut blob: &[u8], fds: Option<&FdList>) -> Result<()>
where
    T: ?Sized + Transport,
{
    if let Some(fds) = fds.filter(|fds| !fds.is_empty()) {
        let Some((&first, rest)) = blob.split_first() else {
            return Ok(());
        };

        transport.send_with_fds(first, fds).await?;
        blob = rest;
    }

    crate::transport::write_all(transport, blob).await
}
