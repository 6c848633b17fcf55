// src/protocol/mod.rs
//! Wire protocol: frame taxonomy, encoding, and environment identifiers.

pub mod codec;
pub mod environment;
pub mod frames;

pub use environment::{Environment, SYSTEM_ENVIRONMENT};

/// Opaque socket-layer client identity, unique per connected client and
/// assigned by the transport for the lifetime of its connection.
pub type ClientId = u64;
pub use frames::{
    ByteStreamKind, DriverOp, ExceptionKind, Request, ResponseFrame, StreamKind, WorkerFrame,
};
