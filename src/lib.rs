// src/lib.rs
//! Cillow code-execution service.
//!
//! Clients connect over a framed socket, submit source code, shell commands
//! or package-install requests, and receive a stream of captured output
//! frames followed by a result or exception. Each `(client, environment)`
//! pair is served by a long-lived interpreter subprocess; the broker
//! multiplexes all clients onto a bounded pool of those workers.
//!
//! # Architecture
//!
//! ```text
//! client ──► broker socket ──► job queue ──► dispatcher task
//!                                                │
//!                                     worker pool (client, env)
//!                                                │
//!                                      interpreter subprocess
//!                                                │
//!            stream / byte-stream / result / exception / end ──► client
//! ```
//!
//! Modules:
//!
//! - **protocol**: frame taxonomy, wire encoding, environment identifiers
//! - **interpreter**: worker lifecycle, dependency inspection, package
//!   installation, capture hooks, the generated worker driver
//! - **server**: socket endpoint, job queue, dispatcher pool, admission
//! - **utils**: configuration and error types

pub mod interpreter;
pub mod protocol;
pub mod server;
pub mod utils;

pub use interpreter::hooks::{add_hooks, clear_hooks, prebuilt, CaptureHook};
pub use protocol::{Environment, ExceptionKind, Request, ResponseFrame};
pub use server::Server;
pub use utils::config::ServerConfig;
pub use utils::errors::{CillowError, Result};

/// Crate version, surfaced in startup logging.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
