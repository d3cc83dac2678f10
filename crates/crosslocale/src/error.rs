//! Error taxonomy shared by every boundary surface.
//!
//! [`ErrorCode`] is the closed set of result codes crossing the C ABI. Values
//! are part of the wire contract and are never renumbered; new codes are only
//! ever appended. [`BackendError`] and [`CodecError`] are the Rust-side errors
//! that collapse into those codes.

use std::ffi::CStr;
use std::io;

/// Result code reported across the boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    /// The worker's execution faulted unrecoverably.
    GenericPanic = 1,
    /// The peer of a half-channel is gone.
    BackendDisconnected = 2,
    /// A string payload failed UTF-8 validation.
    NonUtf8String = 3,
    /// The worker thread could not be started.
    SpawnThreadFailed = 4,
    /// A top-level value could not be represented on the wire.
    InvalidMessage = 5,
}

impl ErrorCode {
    pub const ALL: &'static [Self] = &[
        Self::Ok,
        Self::GenericPanic,
        Self::BackendDisconnected,
        Self::NonUtf8String,
        Self::SpawnThreadFailed,
        Self::InvalidMessage,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| *code as i32 == raw)
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        let text = self.description_c().to_bytes();
        // SAFETY: every literal in `description_c` is ASCII.
        unsafe { std::str::from_utf8_unchecked(text) }
    }

    /// Symbolic identifier, identical to the constant name in `crosslocale.h`.
    pub fn id(self) -> &'static str {
        let text = self.id_c().to_bytes();
        // SAFETY: every literal in `id_c` is ASCII.
        unsafe { std::str::from_utf8_unchecked(text) }
    }

    /// NUL-terminated description with static lifetime, for the C ABI.
    pub fn description_c(self) -> &'static CStr {
        match self {
            Self::Ok => c"OK",
            Self::GenericPanic => c"a generic Rust panic has occurred",
            Self::BackendDisconnected => c"the backend thread has disconnected",
            Self::NonUtf8String => c"a provided string was not valid UTF-8",
            Self::SpawnThreadFailed => c"failed to spawn a thread",
            Self::InvalidMessage => c"the message contains no representable value",
        }
    }

    /// NUL-terminated identifier with static lifetime, for the C ABI.
    pub fn id_c(self) -> &'static CStr {
        match self {
            Self::Ok => c"CROSSLOCALE_OK",
            Self::GenericPanic => c"CROSSLOCALE_ERR_GENERIC_RUST_PANIC",
            Self::BackendDisconnected => c"CROSSLOCALE_ERR_BACKEND_DISCONNECTED",
            Self::NonUtf8String => c"CROSSLOCALE_ERR_NON_UTF8_STRING",
            Self::SpawnThreadFailed => c"CROSSLOCALE_ERR_SPAWN_THREAD_FAILED",
            Self::InvalidMessage => c"CROSSLOCALE_ERR_INVALID_MESSAGE",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Once observed, the handle must be closed and freed.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::GenericPanic | Self::BackendDisconnected)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.id())
    }
}

/// Failures of the wire codecs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An unrepresentable value was encoded at the top level.
    #[error("top-level value is not representable")]
    InvalidTopLevel,

    #[error("string payload is not valid UTF-8")]
    NonUtf8String,

    /// JSON has no spelling for NaN or infinities.
    #[error("float {0} cannot be represented in a JSON frame")]
    NonFiniteFloat(f64),

    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by a [`Backend`](crate::Backend) handle.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend worker panicked")]
    Panicked,

    #[error("backend disconnected")]
    Disconnected,

    #[error("failed to spawn backend thread: {0}")]
    SpawnThread(#[source] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BackendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Panicked => ErrorCode::GenericPanic,
            Self::Disconnected => ErrorCode::BackendDisconnected,
            Self::SpawnThread(_) => ErrorCode::SpawnThreadFailed,
            Self::Codec(CodecError::NonUtf8String) => ErrorCode::NonUtf8String,
            Self::Codec(_) => ErrorCode::InvalidMessage,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }
}

impl From<crate::bridge::channel::Disconnected> for BackendError {
    fn from(_: crate::bridge::channel::Disconnected) -> Self {
        Self::Disconnected
    }
}
