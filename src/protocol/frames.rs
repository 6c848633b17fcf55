// src/protocol/frames.rs
//! Frame taxonomy for the client socket and the worker channel.
//!
//! Every request yields a stream of response frames terminated by exactly
//! one `End`, with at most one `Result` or `Exception` immediately before
//! it. Stream frames are never reordered relative to each other or to the
//! terminal frame.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::environment::Environment;

/// A client request, one per socket frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Execute source code in the worker bound to `env`.
    RunCode { env: Environment, source: String },
    /// Spawn a command and stream its output.
    RunCommand { env: Environment, argv: Vec<String> },
    /// Install packages into `env`.
    InstallRequirements { env: Environment, names: Vec<String> },
    /// Update the worker's environment-variable table.
    SetEnvVars {
        env: Environment,
        vars: HashMap<String, String>,
    },
    /// Ensure a worker exists for `env`.
    SwitchInterpreter { env: Environment },
    /// Tear down the worker bound to `env`.
    DeleteInterpreter { env: Environment },
    /// Clean close: tear down all of this client's workers.
    ShutdownClient,
}

impl Request {
    /// The environment this request targets, if any.
    pub fn environment(&self) -> Option<&Environment> {
        match self {
            Request::RunCode { env, .. }
            | Request::RunCommand { env, .. }
            | Request::InstallRequirements { env, .. }
            | Request::SetEnvVars { env, .. }
            | Request::SwitchInterpreter { env }
            | Request::DeleteInterpreter { env } => Some(env),
            Request::ShutdownClient => None,
        }
    }
}

/// Kind discriminator for textual stream frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Installer,
}

/// Kind discriminator for binary stream frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteStreamKind {
    Image,
    Figure,
}

impl ByteStreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ByteStreamKind::Image => "image",
            ByteStreamKind::Figure => "figure",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "image" => Some(ByteStreamKind::Image),
            "figure" => Some(ByteStreamKind::Figure),
            _ => None,
        }
    }
}

/// Error taxonomy carried by exception frames.
///
/// The serialized name is the wire-visible `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    UserCodeError,
    InstallerError,
    CommandError,
    PerClientQuotaExceeded,
    GlobalQuotaExceeded,
    ServerBusy,
    UnknownEnvironment,
    WorkerStartupFailed,
    WorkerDied,
    Cancelled,
    Shutdown,
    MalformedRequest,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A response frame streamed back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseFrame {
    /// Textual output chunk.
    Stream { stream: StreamKind, text: String },
    /// Binary artifact. Carried in the compact binary wire form, never JSON.
    ByteStream {
        stream: ByteStreamKind,
        bytes: Vec<u8>,
        id: Option<String>,
    },
    /// Final value of the request, null when there is none.
    Result {
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
    /// Terminal failure payload.
    Exception {
        #[serde(rename = "type")]
        error: ExceptionKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    /// Terminal marker, exactly one per request.
    End,
}

impl ResponseFrame {
    /// Shorthand for an exception frame without a traceback.
    pub fn exception(error: ExceptionKind, message: impl Into<String>) -> Self {
        ResponseFrame::Exception {
            error,
            message: message.into(),
            traceback: None,
        }
    }

    /// Shorthand for a null result.
    pub fn null_result() -> Self {
        ResponseFrame::Result { value: None }
    }

    /// Whether this frame completes a request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseFrame::End)
    }
}

/// A frame read from the worker channel.
///
/// Workers speak the response-frame vocabulary plus two channel-internal
/// kinds: the startup handshake and the import report emitted before code
/// execution.
#[derive(Debug, Clone)]
pub enum WorkerFrame {
    /// The driver finished its setup and is serving requests.
    Ready,
    /// Top-level import targets of the submitted source; the worker blocks
    /// until the broker side replies with `DriverOp::Continue`.
    Requires { names: Vec<String> },
    /// A frame to relay to the client.
    Frame(ResponseFrame),
}

/// An operation sent to the worker driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DriverOp {
    /// Parse and execute source code against the persistent namespace.
    RunCode { source: String },
    /// Resume a `RunCode` that paused to report its imports.
    Continue,
    /// Update `os.environ` in place.
    SetEnvVars { vars: HashMap<String, String> },
    /// Exit the driver loop cleanly.
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let json = r#"{"kind":"run_code","env":"$system","source":"x = 1"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::RunCode { env, source } => {
                assert_eq!(env, Environment::System);
                assert_eq!(source, "x = 1");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_has_no_environment() {
        let request: Request = serde_json::from_str(r#"{"kind":"shutdown_client"}"#).unwrap();
        assert!(request.environment().is_none());
    }

    #[test]
    fn test_exception_type_field_uses_taxonomy_name() {
        let frame = ResponseFrame::exception(ExceptionKind::PerClientQuotaExceeded, "cap is 1");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"PerClientQuotaExceeded""#));
        assert!(!json.contains("traceback"));
    }

    #[test]
    fn test_stream_frame_round_trip() {
        let json = r#"{"kind":"stream","stream":"stdout","text":"hi\n"}"#;
        let frame: ResponseFrame = serde_json::from_str(json).unwrap();
        match frame {
            ResponseFrame::Stream { stream, text } => {
                assert_eq!(stream, StreamKind::Stdout);
                assert_eq!(text, "hi\n");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_driver_op_continue_spelling() {
        let json = serde_json::to_string(&DriverOp::Continue).unwrap();
        assert_eq!(json, r#"{"op":"continue"}"#);
    }
}
