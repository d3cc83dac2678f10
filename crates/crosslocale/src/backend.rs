//! Bridge handle: one logical connection to a backend worker thread.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use uuid::Uuid;

use crate::bridge::channel::{HalfReceiver, HalfSender, HostPort, duplex};
use crate::error::{BackendError, CodecError};
use crate::value::Value;
use crate::version::FFI_BRIDGE_VERSION;
use crate::worker::{Worker, run_guarded};

/// Environment variable overriding the worker thread's stack size (bytes).
pub const STACK_SIZE_ENV: &str = "CROSSLOCALE_WORKER_STACK_SIZE";

/// Lifecycle of a live handle. A freed handle no longer exists.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Open = 0,
    /// `close` was called by the host.
    ClosedLocally = 1,
    /// The worker side went away first.
    Disconnected = 2,
}

impl BackendState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::ClosedLocally,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::ClosedLocally => "closed",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Per-instance identifier, used as a tracing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(Uuid);

impl BackendId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BackendId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Worker thread settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub thread_name: String,
    /// `None` keeps the platform default.
    pub stack_size: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            thread_name: "crosslocale-backend".to_string(),
            stack_size: None,
        }
    }
}

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the stack size taken from `CROSSLOCALE_WORKER_STACK_SIZE`.
    pub fn from_env() -> Self {
        Self::default().with_stack_size_var(std::env::var(STACK_SIZE_ENV).ok().as_deref())
    }

    fn with_stack_size_var(self, raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return self;
        };
        match raw.trim().parse::<usize>() {
            Ok(size) if size > 0 => self.with_stack_size(size),
            _ => {
                tracing::warn!(value = raw, "Ignoring invalid {STACK_SIZE_ENV}");
                self
            }
        }
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    fn thread_builder(&self) -> thread::Builder {
        let builder = thread::Builder::new().name(self.thread_name.clone());
        match self.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}

/// The closure a spawner must run on the new thread.
pub type WorkerTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a running backend worker.
///
/// `send` and `recv` may be called concurrently from any number of threads.
/// The two directions never block each other; only `recv` blocks, and only
/// until a value arrives or the connection ends.
pub struct Backend {
    id: BackendId,
    bridge_version: u32,
    outbound: HalfSender,
    inbound: HalfReceiver,
    state: AtomicU8,
    panicked: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Spawn `worker` on a thread configured with [`BackendConfig::from_env`].
    pub fn new(worker: impl Worker) -> Result<Self, BackendError> {
        Self::with_config(worker, BackendConfig::from_env())
    }

    pub fn with_config(worker: impl Worker, config: BackendConfig) -> Result<Self, BackendError> {
        Self::with_spawner(worker, config, |builder, task| builder.spawn(task))
    }

    /// Like [`Backend::with_config`], with control over how the thread is
    /// started. The spawner receives a builder prepared from `config`.
    pub fn with_spawner<S>(
        worker: impl Worker,
        config: BackendConfig,
        spawner: S,
    ) -> Result<Self, BackendError>
    where
        S: FnOnce(thread::Builder, WorkerTask) -> io::Result<JoinHandle<()>>,
    {
        let id = BackendId::new();
        let (HostPort { outbound, inbound }, port) = duplex();
        let panicked = Arc::new(AtomicBool::new(false));

        let task: WorkerTask = {
            let worker: Box<dyn Worker> = Box::new(worker);
            let panicked = Arc::clone(&panicked);
            Box::new(move || {
                run_guarded(worker, port, id, &panicked);
            })
        };

        let handle = spawner(config.thread_builder(), task).map_err(|e| {
            tracing::error!(backend_id = %id, error = %e, "Failed to spawn backend thread");
            BackendError::SpawnThread(e)
        })?;

        tracing::debug!(
            backend_id = %id,
            thread_name = %config.thread_name,
            stack_size = ?config.stack_size,
            "Backend started"
        );

        Ok(Self {
            id,
            bridge_version: FFI_BRIDGE_VERSION,
            outbound,
            inbound,
            state: AtomicU8::new(BackendState::Open as u8),
            panicked,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    /// Bridge version this handle was built against.
    pub fn bridge_version(&self) -> u32 {
        self.bridge_version
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: BackendState, to: BackendState) -> bool {
        let changed = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if changed {
            tracing::debug!(backend_id = %self.id, %from, %to, "Backend state changed");
        }
        changed
    }

    fn mark_disconnected(&self) {
        self.transition(BackendState::Open, BackendState::Disconnected);
    }

    /// Error for a connection that has ended: a worker panic outranks a
    /// plain disconnection.
    fn ended(&self) -> BackendError {
        if self.panicked.load(Ordering::Acquire) {
            BackendError::Panicked
        } else {
            BackendError::Disconnected
        }
    }

    /// Queue a value for the worker. Never blocks.
    ///
    /// `Invalid` children are dropped; an `Invalid` value on its own is
    /// rejected without touching the connection.
    pub fn send(&self, value: Value) -> Result<(), BackendError> {
        if self.state() != BackendState::Open {
            return Err(self.ended());
        }
        let value = value.prune().ok_or(CodecError::InvalidTopLevel)?;
        tracing::trace!(backend_id = %self.id, message = %value, "Sending message");
        self.outbound.send(value).map_err(|_| {
            self.mark_disconnected();
            self.ended()
        })
    }

    /// Block until the worker produces a value or the connection ends.
    ///
    /// Values the worker sent before it went away are still delivered; after
    /// that every call fails with [`BackendError::Disconnected`], or with
    /// [`BackendError::Panicked`] if the worker panicked.
    pub fn recv(&self) -> Result<Value, BackendError> {
        match self.inbound.recv() {
            Ok(value) => {
                tracing::trace!(backend_id = %self.id, message = %value, "Received message");
                Ok(value)
            }
            Err(_) => {
                self.mark_disconnected();
                Err(self.ended())
            }
        }
    }

    /// [`Backend::recv`] on tokio's blocking pool.
    pub async fn recv_async(self: &Arc<Self>) -> Result<Value, BackendError> {
        let this = Arc::clone(self);
        match tokio::task::spawn_blocking(move || this.recv()).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(BackendError::Panicked),
            Err(_) => Err(BackendError::Disconnected),
        }
    }

    /// Stop sending. The worker still drains what was already queued, and
    /// its replies remain receivable. Idempotent.
    pub fn close(&self) {
        self.transition(BackendState::Open, BackendState::ClosedLocally);
        self.outbound.close();
    }

    /// False only while the handle is open and the worker may still produce
    /// values.
    pub fn is_closed(&self) -> bool {
        match self.state() {
            BackendState::Open if self.inbound.is_disconnected() => {
                self.mark_disconnected();
                true
            }
            BackendState::Open => false,
            BackendState::ClosedLocally | BackendState::Disconnected => true,
        }
    }

    /// Close both directions and join the worker thread.
    ///
    /// Any thread blocked in `recv` wakes with an error. Returns
    /// [`BackendError::Panicked`] if the worker panicked. Idempotent.
    pub fn shutdown(&self) -> Result<(), BackendError> {
        self.close();
        self.inbound.disconnect();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                tracing::warn!(backend_id = %self.id, "Backend shut down from its own worker thread");
            } else if handle.join().is_err() {
                self.panicked.store(true, Ordering::Release);
            }
            tracing::debug!(backend_id = %self.id, "Backend worker joined");
        }

        if self.panicked.load(Ordering::Acquire) {
            Err(BackendError::Panicked)
        } else {
            Ok(())
        }
    }

    /// Shut down and release the handle.
    pub fn free(self) -> Result<(), BackendError> {
        self.shutdown()
    }

    fn worker_joined(&mut self) -> bool {
        self.worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.worker_joined() {
            return;
        }
        if let Err(e) = self.shutdown() {
            tracing::warn!(backend_id = %self.id, error = %e, "Backend dropped with error");
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("bridge_version", &self.bridge_version)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
