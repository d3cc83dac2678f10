//! Version contract between the core and its host adapters.

/// Incremented whenever the C ABI or the message layout changes shape.
pub const FFI_BRIDGE_VERSION: u32 = 5;

/// Version of the message protocol spoken with the worker.
pub const PROTOCOL_VERSION: u32 = 0;

/// Crate version from Cargo.toml
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate version annotated with the commit it was built from, when known.
pub const NICE_VERSION: &str = match option_env!("CROSSLOCALE_NICE_VERSION") {
    Some(version) => version,
    None => CRATE_VERSION,
};

/// An adapter was built against a different bridge version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bridge version mismatch: adapter expects {expected}, library provides {actual}")]
pub struct VersionMismatch {
    pub expected: u32,
    pub actual: u32,
}

/// Refuse to continue unless `expected` matches [`FFI_BRIDGE_VERSION`].
///
/// Adapters call this once, before constructing any backend.
pub fn check_bridge_version(expected: u32) -> Result<(), VersionMismatch> {
    if expected == FFI_BRIDGE_VERSION {
        Ok(())
    } else {
        Err(VersionMismatch {
            expected,
            actual: FFI_BRIDGE_VERSION,
        })
    }
}

/// Version information for logs and host adapters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub crosslocale: &'static str,
    pub nice: &'static str,
    pub bridge: u32,
    pub protocol: u32,
    /// Host runtime version (if the adapter reports one).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            crosslocale: CRATE_VERSION,
            nice: NICE_VERSION,
            bridge: FFI_BRIDGE_VERSION,
            protocol: PROTOCOL_VERSION,
            host: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host runtime version.
    pub fn with_host(mut self, version: String) -> Self {
        self.host = Some(version);
        self
    }
}
