//! crosslocale: duplex value bridge between a host runtime and a backend
//! worker thread.

mod version;

pub mod backend;
pub mod bridge;
pub mod error;
pub mod logging;
pub mod value;
pub mod worker;

pub use backend::{Backend, BackendConfig, BackendId, BackendState, WorkerTask};
pub use error::{BackendError, CodecError, ErrorCode};
pub use value::{MessageType, Value};
pub use version::{
    CRATE_VERSION, FFI_BRIDGE_VERSION, NICE_VERSION, PROTOCOL_VERSION, VersionInfo,
    VersionMismatch, check_bridge_version,
};
pub use worker::{Loopback, Worker, WorkerPort};
