//! The worker which moves messages between a [`Transport`] and the owner of a
//! connection once authentication has completed.
//!
//! Every worker in the process runs on one dedicated thread. Messages are
//! enqueued with [`Worker::send_message`] from any thread and written in the
//! order they were enqueued. Received messages are handed to the [`Handler`]
//! in the order they were read.
//!
//! [`Transport`]: crate::transport::Transport

#[cfg(test)]
mod tests;

pub(crate) mod runtime;
mod task;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::protocol::HEADER_PREFIX;
use crate::sasl::Capabilities;
use crate::transport::Transport;

/// Callbacks through which a worker reports to the owner of a connection.
///
/// Every callback is invoked from the worker thread.
pub trait Handler<M>: Send + 'static {
    /// A message was received.
    fn on_message(&mut self, message: M);

    /// A message is about to be written.
    ///
    /// The default implementation sends the message unchanged.
    fn on_outgoing(&mut self, message: M) -> Outgoing<M> {
        Outgoing::Unchanged(message)
    }

    /// The connection was lost.
    ///
    /// This is called exactly once, and no other callback follows it.
    /// `remote_peer_vanished` is `false` if the disconnect was caused by
    /// closing the worker.
    fn on_disconnected(&mut self, remote_peer_vanished: bool, error: Option<Error>);
}

/// The decision of [`Handler::on_outgoing`].
#[derive(Debug)]
pub enum Outgoing<M> {
    /// Send the message as it was enqueued.
    Unchanged(M),
    /// Send a different message, which is encoded again before it's written.
    Replaced(M),
    /// Don't send the message.
    Dropped,
}

/// Builder of a [`Worker`].
///
/// # Examples
///
/// ```no_run
/// use tokio_dbus_peer::message::RawMessage;
/// use tokio_dbus_peer::sasl::{Guid, ServerAuth};
/// use tokio_dbus_peer::transport::UnixTransport;
/// use tokio_dbus_peer::worker::{Handler, WorkerBuilder};
/// use tokio_dbus_peer::Error;
///
/// struct Print;
///
/// impl Handler<RawMessage> for Print {
///     fn on_message(&mut self, message: RawMessage) {
///         println!("{message:?}");
///     }
///
///     fn on_disconnected(&mut self, vanished: bool, error: Option<Error>) {
///         println!("disconnected: {vanished} {error:?}");
///     }
/// }
///
/// # #[tokio::main] async fn main() -> tokio_dbus_peer::Result<()> {
/// let (stream, _) = std::os::unix::net::UnixListener::bind("/tmp/example.sock")?.accept()?;
/// let transport = UnixTransport::new(stream)?;
///
/// let outcome = ServerAuth::new(Guid::generate()).run(&transport).await?;
///
/// let worker = WorkerBuilder::new()
///     .capabilities(outcome.capabilities)
///     .prefetched(outcome.residual)
///     .build::<_, RawMessage, _>(transport, Print)?;
///
/// worker.flush().await?;
/// # Ok(()) }
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    frozen: bool,
    capabilities: Capabilities,
    prefetched: Vec<u8>,
}

impl WorkerBuilder {
    /// Construct a new worker builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start out frozen, holding on to received messages until
    /// [`Worker::unfreeze`] is called.
    pub fn frozen(&mut self, frozen: bool) -> &mut Self {
        self.frozen = frozen;
        self
    }

    /// The capabilities negotiated during authentication.
    pub fn capabilities(&mut self, capabilities: Capabilities) -> &mut Self {
        self.capabilities = capabilities;
        self
    }

    /// Bytes which were already read from the transport, such as
    /// [`ServerOutcome::residual`].
    ///
    /// [`ServerOutcome::residual`]: crate::sasl::ServerOutcome::residual
    pub fn prefetched(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.prefetched = bytes;
        self
    }

    /// Start a worker which takes ownership of the transport.
    pub fn build<T, M, H>(&self, transport: T, handler: H) -> Result<Worker<M>>
    where
        T: Transport,
        M: Message,
        H: Handler<M>,
    {
        let runtime = runtime::handle()?;

        let shared = Arc::new(Shared {
            capabilities: self.capabilities,
            write: Mutex::new(WriteState::new()),
            read: Mutex::new(ReadState {
                frozen: self.frozen,
                queue: VecDeque::new(),
            }),
            handler: Mutex::new(Box::new(handler)),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            reader_done: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        });

        let transport = Arc::new(transport);

        runtime.spawn(task::read_loop(
            shared.clone(),
            transport.clone(),
            self.prefetched.clone(),
        ));

        runtime.spawn(task::write_loop(shared.clone(), transport));
        Ok(Worker { shared, runtime })
    }
}

/// A running worker.
///
/// Dropping the worker stops it.
pub struct Worker<M>
where
    M: Message,
{
    shared: Arc<Shared<M>>,
    runtime: &'static Handle,
}

impl<M> Worker<M>
where
    M: Message,
{
    /// The capabilities the worker was built with.
    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.shared.capabilities
    }

    /// Enqueue a message together with its encoded blob.
    ///
    /// Messages carrying file descriptors are refused unless
    /// [`Capabilities::UNIX_FD_PASSING`] was negotiated.
    pub fn send_message(&self, message: M, blob: Vec<u8>) -> Result<()> {
        if blob.len() <= HEADER_PREFIX {
            return Err(Error::new(ErrorKind::MessageTooShort(blob.len())));
        }

        if let Some(fds) = message.fds() {
            if !fds.is_empty() && !self.shared.capabilities.contains(Capabilities::UNIX_FD_PASSING) {
                return Err(Error::new(ErrorKind::FdPassingNotNegotiated));
            }
        }

        {
            let mut write = lock(&self.shared.write);

            if write.close_requested {
                return Err(Error::new(ErrorKind::WorkerClosed));
            }

            write.queue.push_back(Queued { message, blob });
        }

        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait until every message enqueued before this call has been written
    /// and the transport has been flushed.
    pub async fn flush(&self) -> Result<()> {
        match self.shared.schedule_flush()? {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::new(ErrorKind::WorkerClosed))),
            None => Ok(()),
        }
    }

    /// Block the current thread until every message enqueued before this
    /// call has been written and the transport has been flushed.
    ///
    /// This fails when called from within an asynchronous runtime, which
    /// includes the worker thread. Use [`Worker::flush`] there instead.
    pub fn flush_sync(&self) -> Result<()> {
        if Handle::try_current().is_ok() {
            return Err(Error::new(ErrorKind::FlushFromWorker));
        }

        match self.shared.schedule_flush()? {
            Some(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| Err(Error::new(ErrorKind::WorkerClosed))),
            None => Ok(()),
        }
    }

    /// Close the transport and wait for it to complete.
    ///
    /// Messages which have not been written yet are discarded, and pending
    /// flushes fail as cancelled.
    pub async fn close(&self) -> Result<()> {
        match self.shared.schedule_close() {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(Error::new(ErrorKind::WorkerClosed))),
            None => Ok(()),
        }
    }

    /// Close the transport without invoking any further callbacks.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.shared.schedule_close();
    }

    /// Deliver every message held while frozen and resume normal delivery.
    ///
    /// This takes effect on the worker thread, after this call returns.
    pub fn unfreeze(&self) {
        let shared = self.shared.clone();
        self.runtime.spawn(async move { shared.unfreeze() });
    }
}

impl<M> Drop for Worker<M>
where
    M: Message,
{
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputPending {
    None,
    Write,
    Flush,
    Close,
}

struct Queued<M> {
    message: M,
    blob: Vec<u8>,
}

/// A flush barrier which completes once `number` messages have been written
/// and flushed.
struct Barrier {
    number: u64,
    tx: oneshot::Sender<Result<()>>,
}

struct WriteState<M> {
    queue: VecDeque<Queued<M>>,
    flushes: Vec<Barrier>,
    closes: Vec<oneshot::Sender<Result<()>>>,
    output_pending: OutputPending,
    messages_written: u64,
    messages_flushed: u64,
    close_requested: bool,
    close_expected: bool,
    closed: bool,
}

impl<M> WriteState<M> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            flushes: Vec::new(),
            closes: Vec::new(),
            output_pending: OutputPending::None,
            messages_written: 0,
            messages_flushed: 0,
            close_requested: false,
            close_expected: false,
            closed: false,
        }
    }
}

struct ReadState<M> {
    frozen: bool,
    queue: VecDeque<M>,
}

/// The next thing the writer should do.
enum Action<M> {
    Idle,
    Close,
    Flush,
    Write(Queued<M>),
}

/// State shared between a [`Worker`] and its tasks.
struct Shared<M> {
    capabilities: Capabilities,
    write: Mutex<WriteState<M>>,
    read: Mutex<ReadState<M>>,
    handler: Mutex<Box<dyn Handler<M>>>,
    wake: Notify,
    /// Triggered when closing, aborting any read in progress.
    cancel: CancellationToken,
    /// Triggered once the reader has finished.
    reader_done: CancellationToken,
    stopped: AtomicBool,
    disconnected: AtomicBool,
}

impl<M> Shared<M>
where
    M: Message,
{
    fn schedule_flush(&self) -> Result<Option<oneshot::Receiver<Result<()>>>> {
        let rx = {
            let mut write = lock(&self.write);

            if write.closed {
                return Err(Error::new(ErrorKind::WorkerClosed));
            }

            let mut pending = write.queue.len() as u64;

            // A write in flight is only covered by the flush which follows it.
            if write.output_pending == OutputPending::Write {
                pending += 1;
            }

            if pending == 0 && write.messages_written == write.messages_flushed {
                return Ok(None);
            }

            let (tx, rx) = oneshot::channel();
            let number = write.messages_written + pending;
            write.flushes.push(Barrier { number, tx });
            rx
        };

        self.wake.notify_one();
        Ok(Some(rx))
    }

    fn schedule_close(&self) -> Option<oneshot::Receiver<Result<()>>> {
        self.cancel.cancel();

        let rx = {
            let mut write = lock(&self.write);

            if write.closed {
                return None;
            }

            let (tx, rx) = oneshot::channel();
            write.close_requested = true;
            write.closes.push(tx);
            rx
        };

        self.wake.notify_one();
        Some(rx)
    }

    fn close_expected(&self) -> bool {
        lock(&self.write).close_expected
    }

    /// Pick the next action of the writer, in order of priority.
    fn next_action(&self) -> Action<M> {
        let mut write = lock(&self.write);

        if write.close_requested {
            write.close_expected = true;
            write.output_pending = OutputPending::Close;
            return Action::Close;
        }

        let written = write.messages_written;

        if write.flushes.iter().any(|barrier| barrier.number <= written) {
            write.output_pending = OutputPending::Flush;
            return Action::Flush;
        }

        if let Some(queued) = write.queue.pop_front() {
            write.output_pending = OutputPending::Write;
            return Action::Write(queued);
        }

        Action::Idle
    }

    /// Mark the message in flight as done, whether or not it was
    /// successfully written.
    fn written(&self) {
        let mut write = lock(&self.write);
        write.messages_written += 1;
        write.output_pending = OutputPending::None;
    }

    fn flushed(&self, result: Result<()>) {
        let satisfied = {
            let mut write = lock(&self.write);
            let written = write.messages_written;
            write.messages_flushed = written;
            write.output_pending = OutputPending::None;

            let (satisfied, pending) = write
                .flushes
                .drain(..)
                .partition::<Vec<_>, _>(|barrier| barrier.number <= written);

            write.flushes = pending;
            satisfied
        };

        for barrier in satisfied {
            let _ = barrier.tx.send(result.clone());
        }
    }

    fn closed(&self, result: Result<()>) {
        let (closes, flushes, queue) = {
            let mut write = lock(&self.write);
            write.output_pending = OutputPending::None;
            write.closed = true;

            (
                std::mem::take(&mut write.closes),
                std::mem::take(&mut write.flushes),
                std::mem::take(&mut write.queue),
            )
        };

        for tx in closes {
            let _ = tx.send(result.clone());
        }

        if !queue.is_empty() {
            message_debug!(discarded = queue.len(), "Discarding unsent messages on close");
        }

        drop(queue);

        for barrier in flushes {
            let _ = barrier.tx.send(Err(Error::new(ErrorKind::Cancelled)));
        }
    }

    /// Deliver a received message, or hold on to it while frozen.
    fn deliver(&self, message: M) {
        {
            let mut read = lock(&self.read);

            if read.frozen {
                read.queue.push_back(message);
                return;
            }
        }

        self.emit_message(message);
    }

    fn unfreeze(&self) {
        loop {
            let message = {
                let mut read = lock(&self.read);

                let Some(message) = read.queue.pop_front() else {
                    read.frozen = false;
                    return;
                };

                message
            };

            self.emit_message(message);
        }
    }

    fn emit_message(&self, message: M) {
        let mut handler = lock(&self.handler);

        if self.stopped.load(Ordering::SeqCst) || self.disconnected.load(Ordering::SeqCst) {
            return;
        }

        handler.on_message(message);
    }

    fn emit_outgoing(&self, message: M) -> Outgoing<M> {
        if self.stopped.load(Ordering::SeqCst) {
            return Outgoing::Unchanged(message);
        }

        lock(&self.handler).on_outgoing(message)
    }

    fn emit_disconnected(&self, remote_peer_vanished: bool, error: Option<Error>) {
        let mut handler = lock(&self.handler);

        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        message_debug!(remote_peer_vanished, ?error, "Disconnected");

        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        handler.on_disconnected(remote_peer_vanished, error);
    }
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
