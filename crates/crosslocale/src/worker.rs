//! Worker side of a backend.
//!
//! A [`Worker`] owns the far end of the duplex connection and runs on the
//! backend's dedicated thread until it returns or panics. Either way its
//! [`WorkerPort`] is dropped on exit, which the host observes once it has
//! drained everything already sent: as `BACKEND_DISCONNECTED` after a return,
//! as `GENERIC_RUST_PANIC` after a panic.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::BackendId;

pub use crate::bridge::channel::WorkerPort;

/// Body of a backend thread.
pub trait Worker: Send + 'static {
    /// Serve the connection. An `Err` is logged and treated as a normal exit.
    fn run(self: Box<Self>, port: WorkerPort) -> anyhow::Result<()>;
}

impl<F> Worker for F
where
    F: FnOnce(WorkerPort) -> anyhow::Result<()> + Send + 'static,
{
    fn run(self: Box<Self>, port: WorkerPort) -> anyhow::Result<()> {
        (*self)(port)
    }
}

/// Answers every value with itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct Loopback;

impl Worker for Loopback {
    fn run(self: Box<Self>, port: WorkerPort) -> anyhow::Result<()> {
        let mut echoed = 0u64;
        while let Ok(value) = port.recv() {
            if port.send(value).is_err() {
                // Host disconnected its inbound side.
                break;
            }
            echoed += 1;
        }
        tracing::debug!(echoed, "Loopback worker finished");
        Ok(())
    }
}

/// How a worker's `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Returned,
    Failed,
    Panicked,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// Run a worker to completion, containing any panic it raises.
///
/// `panicked` is set before the host can observe the disconnection.
pub(crate) fn run_guarded(
    worker: Box<dyn Worker>,
    port: WorkerPort,
    backend_id: BackendId,
    panicked: &AtomicBool,
) -> Exit {
    let _span = tracing::info_span!("backend_worker", %backend_id).entered();
    tracing::debug!("Worker starting");

    // Unwinding drops `port`; this keeps the host waiting until the exit is recorded.
    let inbound = port.sender();
    let exit = match panic::catch_unwind(AssertUnwindSafe(move || worker.run(port))) {
        Ok(Ok(())) => {
            tracing::debug!("Worker exited");
            Exit::Returned
        }
        Ok(Err(e)) => {
            tracing::error!(error = %format!("{e:#}"), "Worker failed");
            Exit::Failed
        }
        Err(payload) => {
            tracing::error!(panic = panic_message(payload.as_ref()), "Worker panicked");
            panicked.store(true, Ordering::Release);
            Exit::Panicked
        }
    };
    drop(inbound);
    exit
}
