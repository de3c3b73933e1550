//! The event loop shared by every worker in the process.

use std::future;
use std::io;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;

use tokio::runtime::{Builder, Handle};

const THREAD_NAME: &str = "tokio-dbus-peer-worker";

static HANDLE: OnceLock<Handle> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Access the shared worker runtime, starting its thread on first use.
///
/// All workers of the process run on a single thread driving a
/// current-thread runtime, and all handler callbacks are invoked from it.
pub(crate) fn handle() -> io::Result<&'static Handle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle);
    }

    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(handle) = HANDLE.get() {
        return Ok(handle);
    }

    let runtime = Builder::new_current_thread().enable_all().build()?;
    let handle = runtime.handle().clone();

    thread::Builder::new()
        .name(THREAD_NAME.to_owned())
        .spawn(move || {
            runtime.block_on(future::pending::<()>());
        })?;

    tracing::trace!(thread = THREAD_NAME, "Started worker runtime");

    Ok(HANDLE.get_or_init(|| handle))
}
