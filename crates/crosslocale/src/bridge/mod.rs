//! Host/worker bridge plumbing.
//!
//! # Architecture
//!
//! - **message**: tagged-struct wire generation (`#[repr(C)]` trees, C ABI)
//! - **codec**: byte-buffer wire generation (length-prefixed JSON frames)
//! - **channel**: half-channels and the duplex connection built from them

pub mod channel;
pub mod codec;
pub mod message;
