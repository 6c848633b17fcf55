// src/interpreter/worker.rs
//! Interpreter worker lifecycle and request execution.
//!
//! A worker is an actor task paired with an interpreter child process. The
//! actor owns the private channel to the child, serves its mailbox serially,
//! runs dependency inspection and installs around code execution, and
//! executes commands and explicit installs on the broker side of the pair.
//! Serial mailbox service gives per-`(client, environment)` FIFO only
//! because the broker's key-sharded dispatch submits requests for a key in
//! accept order; see `server::broker`.
//!
//! # Lifecycle
//!
//! ```text
//! spawn -> ready handshake -> Idle <-> Busy -> Terminating
//!             |                          |
//!             +-- startup failure        +-- cancel / child death
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::codec::{self, length_codec};
use crate::protocol::{
    DriverOp, Environment, ExceptionKind, Request, ResponseFrame, StreamKind, WorkerFrame,
};
use crate::utils::errors::{CillowError, Result};

use super::deps::DependencyInspector;
use super::driver;
use super::installer::{prepend_path, PackageInstaller};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Timing knobs for worker lifecycle.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// How long to wait for the driver's ready handshake.
    pub startup_timeout: Duration,
    /// Grace between asking the child to exit and killing it.
    pub grace_period: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(3),
        }
    }
}

/// Worker lifecycle state, visible through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Terminating,
}

/// A request routed to a worker, with the channel its frames flow back on.
pub struct WorkerRequest {
    pub request: Request,
    pub frames: mpsc::Sender<ResponseFrame>,
}

/// Notice that a worker exited on its own (startup failure or child death).
#[derive(Debug)]
pub struct WorkerExit {
    pub client: u64,
    pub env: Environment,
    pub worker_id: u64,
}

#[derive(Debug)]
struct WorkerStatus {
    pid: Option<u32>,
    state: WorkerState,
    last_used_at: Instant,
}

/// Pool-side handle to a live worker.
pub struct WorkerHandle {
    worker_id: u64,
    mailbox: mpsc::UnboundedSender<WorkerRequest>,
    cancel: CancellationToken,
    cancel_kind: Arc<Mutex<ExceptionKind>>,
    created_at: Instant,
    status: Arc<Mutex<WorkerStatus>>,
}

impl WorkerHandle {
    /// Start a worker for `(client, env)`. The actor completes the spawn and
    /// ready handshake before serving its mailbox, so callers may enqueue
    /// requests immediately.
    pub fn spawn(
        client: u64,
        env: Environment,
        settings: WorkerSettings,
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
    ) -> Self {
        let worker_id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_kind = Arc::new(Mutex::new(ExceptionKind::Cancelled));
        let status = Arc::new(Mutex::new(WorkerStatus {
            pid: None,
            state: WorkerState::Starting,
            last_used_at: Instant::now(),
        }));

        let actor = WorkerActor {
            worker_id,
            client,
            env,
            settings,
            mailbox: mailbox_rx,
            cancel: cancel.clone(),
            cancel_kind: cancel_kind.clone(),
            status: status.clone(),
            exit_tx,
        };
        tokio::spawn(actor.run());

        Self {
            worker_id,
            mailbox: mailbox_tx,
            cancel,
            cancel_kind,
            created_at: Instant::now(),
            status,
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).pid
    }

    pub fn state(&self) -> WorkerState {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn last_used_at(&self) -> Instant {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_used_at
    }

    /// Enqueue a request. Returns false when the actor is gone.
    pub fn submit(&self, request: WorkerRequest) -> bool {
        self.mailbox.send(request).is_ok()
    }

    /// Tear the worker down; in-flight and queued requests terminate with an
    /// exception of `kind` (`Cancelled` or `Shutdown`).
    pub fn cancel(&self, kind: ExceptionKind) {
        *self
            .cancel_kind
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = kind;
        self.cancel.cancel();
    }
}

/// Outcome of serving one request.
enum Outcome {
    /// Worker stays in the pool.
    Continue,
    /// The child died; the worker must leave the pool.
    Died,
    /// The cancellation token fired mid-request.
    Cancelled,
}

struct WorkerActor {
    worker_id: u64,
    client: u64,
    env: Environment,
    settings: WorkerSettings,
    mailbox: mpsc::UnboundedReceiver<WorkerRequest>,
    cancel: CancellationToken,
    cancel_kind: Arc<Mutex<ExceptionKind>>,
    status: Arc<Mutex<WorkerStatus>>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl WorkerActor {
    async fn run(mut self) {
        let mut session = match self.start_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    worker = self.worker_id,
                    environment = %self.env,
                    "worker startup failed: {}", e
                );
                self.drain_mailbox(ExceptionKind::WorkerStartupFailed, &e.to_string())
                    .await;
                self.notify_exit();
                return;
            }
        };

        info!(
            worker = self.worker_id,
            client = self.client,
            environment = %self.env,
            pid = ?session.pid,
            "interpreter worker ready"
        );
        self.set_status(WorkerState::Idle, session.pid);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let kind = self.cancel_kind();
                    self.set_status(WorkerState::Terminating, session.pid);
                    self.drain_mailbox(kind, default_message(kind)).await;
                    session.terminate(self.settings.grace_period).await;
                    return;
                }
                next = self.mailbox.recv() => {
                    let request = match next {
                        Some(request) => request,
                        None => {
                            // Pool dropped the handle.
                            self.set_status(WorkerState::Terminating, session.pid);
                            session.terminate(self.settings.grace_period).await;
                            return;
                        }
                    };

                    self.set_status(WorkerState::Busy, session.pid);
                    let outcome = self.serve(&mut session, request).await;
                    self.touch();
                    match outcome {
                        Outcome::Continue => self.set_status(WorkerState::Idle, session.pid),
                        Outcome::Died => {
                            self.set_status(WorkerState::Terminating, session.pid);
                            self.drain_mailbox(
                                ExceptionKind::WorkerDied,
                                default_message(ExceptionKind::WorkerDied),
                            )
                            .await;
                            session.terminate(Duration::ZERO).await;
                            self.notify_exit();
                            return;
                        }
                        Outcome::Cancelled => {
                            let kind = self.cancel_kind();
                            self.set_status(WorkerState::Terminating, session.pid);
                            self.drain_mailbox(kind, default_message(kind)).await;
                            session.terminate(self.settings.grace_period).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Spawn the interpreter on a freshly generated driver and complete the
    /// ready handshake.
    async fn start_session(&self) -> Result<WorkerSession> {
        let interpreter = self.env.interpreter()?;
        let script = driver::generate_driver_with_registered_hooks();

        let mut driver_file = tempfile::Builder::new()
            .prefix("cillow-driver-")
            .suffix(".py")
            .tempfile()?;
        driver_file.write_all(script.as_bytes())?;
        driver_file.flush()?;
        let driver_path = driver_file.into_temp_path();

        let mut command = Command::new(&interpreter);
        command
            .arg(&*driver_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Environment::Venv(root) = &self.env {
            command.env("VIRTUAL_ENV", root);
        }
        if let Some(bin) = self.env.bin_dir() {
            command.env("PATH", prepend_path(&bin));
        }

        debug!(worker = self.worker_id, interpreter = ?interpreter, "spawning interpreter");
        let mut child = command
            .spawn()
            .map_err(|e| CillowError::WorkerSpawnFailed(format!("{:?}: {}", interpreter, e)))?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(CillowError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(CillowError::ChannelClosed)?;
        if let Some(stderr) = child.stderr.take() {
            let worker_id = self.worker_id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker = worker_id, "worker stderr: {}", line);
                }
            });
        }

        let writer = FramedWrite::new(stdin, length_codec());
        let mut reader = FramedRead::new(stdout, length_codec());

        match tokio::time::timeout(self.settings.startup_timeout, reader.next()).await {
            Err(_) => {
                let _ = child.start_kill();
                return Err(CillowError::WorkerStartupTimeout(
                    self.settings.startup_timeout,
                ));
            }
            Ok(None) => return Err(CillowError::ChannelClosed),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(frame))) => match codec::decode_worker_frame(&frame)? {
                WorkerFrame::Ready => {}
                other => {
                    return Err(CillowError::MalformedFrame(format!(
                        "expected ready handshake, got {:?}",
                        other
                    )))
                }
            },
        }

        let inspector = DependencyInspector::for_environment(&self.env).await;
        let installer = PackageInstaller::new(self.env.clone());

        Ok(WorkerSession {
            child,
            pid,
            writer,
            reader,
            inspector,
            installer,
            env: self.env.clone(),
            env_vars: HashMap::new(),
            _driver_path: driver_path,
        })
    }

    async fn serve(&mut self, session: &mut WorkerSession, request: WorkerRequest) -> Outcome {
        let WorkerRequest { request, frames } = request;
        let result = match request {
            Request::RunCode { source, .. } => {
                session
                    .drive_driver_op(DriverOp::RunCode { source }, &self.cancel, &frames)
                    .await
            }
            Request::SetEnvVars { vars, .. } => {
                // Mirror into the broker-side table so command and installer
                // subprocesses observe the same variables as user code.
                session.env_vars.extend(vars.clone());
                session
                    .drive_driver_op(DriverOp::SetEnvVars { vars }, &self.cancel, &frames)
                    .await
            }
            Request::InstallRequirements { names, .. } => {
                session
                    .install_requirements(&names, &self.cancel, &frames)
                    .await
            }
            Request::RunCommand { argv, .. } => {
                session.run_command(&argv, &self.cancel, &frames).await
            }
            // Switch is an ensure-exists: once this worker is up there is
            // nothing left to do. Delete/shutdown belong to the pool and
            // only land here if misrouted; they still terminate cleanly.
            Request::SwitchInterpreter { .. }
            | Request::DeleteInterpreter { .. }
            | Request::ShutdownClient => {
                emit(&frames, ResponseFrame::null_result()).await;
                emit(&frames, ResponseFrame::End).await;
                Ok(Outcome::Continue)
            }
        };

        match result {
            Ok(outcome) => {
                if matches!(outcome, Outcome::Cancelled) {
                    let kind = self.cancel_kind();
                    emit(&frames, ResponseFrame::exception(kind, default_message(kind))).await;
                    emit(&frames, ResponseFrame::End).await;
                }
                outcome
            }
            Err(e) => {
                warn!(worker = self.worker_id, "worker channel failed: {}", e);
                emit(
                    &frames,
                    ResponseFrame::exception(ExceptionKind::WorkerDied, e.to_string()),
                )
                .await;
                emit(&frames, ResponseFrame::End).await;
                Outcome::Died
            }
        }
    }

    fn cancel_kind(&self) -> ExceptionKind {
        *self
            .cancel_kind
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, state: WorkerState, pid: Option<u32>) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.state = state;
        status.pid = pid;
    }

    fn touch(&self) {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_used_at = Instant::now();
    }

    /// Fail every queued request with an exception of `kind`.
    async fn drain_mailbox(&mut self, kind: ExceptionKind, message: &str) {
        self.mailbox.close();
        while let Ok(request) = self.mailbox.try_recv() {
            emit(&request.frames, ResponseFrame::exception(kind, message)).await;
            emit(&request.frames, ResponseFrame::End).await;
        }
    }

    fn notify_exit(&self) {
        let _ = self.exit_tx.send(WorkerExit {
            client: self.client,
            env: self.env.clone(),
            worker_id: self.worker_id,
        });
    }
}

struct WorkerSession {
    child: Child,
    pid: Option<u32>,
    writer: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    reader: FramedRead<ChildStdout, LengthDelimitedCodec>,
    inspector: DependencyInspector,
    installer: PackageInstaller,
    env: Environment,
    env_vars: HashMap<String, String>,
    _driver_path: tempfile::TempPath,
}

impl WorkerSession {
    /// Send an operation to the driver and relay its frames until the
    /// terminal frame, serving import reports along the way.
    async fn drive_driver_op(
        &mut self,
        op: DriverOp,
        cancel: &CancellationToken,
        frames: &mpsc::Sender<ResponseFrame>,
    ) -> Result<Outcome> {
        self.writer.send(codec::encode_driver_op(&op)?).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                next = self.reader.next() => {
                    let bytes = match next {
                        None => return Err(CillowError::ChannelClosed),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(bytes)) => bytes,
                    };
                    match codec::decode_worker_frame(&bytes) {
                        Err(e) => {
                            warn!("dropping malformed worker frame: {}", e);
                        }
                        Ok(WorkerFrame::Ready) => {}
                        Ok(WorkerFrame::Requires { names }) => {
                            let missing = self.inspector.missing_modules(&names);
                            if !missing.is_empty() {
                                let packages = DependencyInspector::packages_for(&missing);
                                match self
                                    .installer
                                    .install(&packages, &self.env_vars, frames)
                                    .await
                                {
                                    Ok(()) => self.inspector.note_installed(&missing),
                                    // Proceed: the failing import surfaces
                                    // through normal execution.
                                    Err(e) => warn!("auto-install failed: {}", e),
                                }
                            }
                            self.writer
                                .send(codec::encode_driver_op(&DriverOp::Continue)?)
                                .await?;
                        }
                        Ok(WorkerFrame::Frame(frame)) => {
                            let terminal = frame.is_terminal();
                            emit(frames, frame).await;
                            if terminal {
                                return Ok(Outcome::Continue);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Explicit install request: stream installer output, then a terminal.
    async fn install_requirements(
        &mut self,
        names: &[String],
        cancel: &CancellationToken,
        frames: &mpsc::Sender<ResponseFrame>,
    ) -> Result<Outcome> {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            result = self.installer.install(names, &self.env_vars, frames) => result,
        };

        match result {
            Ok(()) => {
                self.inspector.note_installed(names);
                emit(frames, ResponseFrame::null_result()).await;
            }
            Err(e) => {
                emit(
                    frames,
                    ResponseFrame::exception(ExceptionKind::InstallerError, e.to_string()),
                )
                .await;
            }
        }
        emit(frames, ResponseFrame::End).await;
        Ok(Outcome::Continue)
    }

    /// Spawn an argv, streaming its output; exit code becomes the result.
    async fn run_command(
        &mut self,
        argv: &[String],
        cancel: &CancellationToken,
        frames: &mpsc::Sender<ResponseFrame>,
    ) -> Result<Outcome> {
        let Some((program, args)) = argv.split_first() else {
            emit(
                frames,
                ResponseFrame::exception(ExceptionKind::CommandError, "empty command"),
            )
            .await;
            emit(frames, ResponseFrame::End).await;
            return Ok(Outcome::Continue);
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&self.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(bin) = self.env.bin_dir() {
            command.env("PATH", prepend_path(&bin));
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                emit(
                    frames,
                    ResponseFrame::exception(
                        ExceptionKind::CommandError,
                        format!("{}: {}", program, e),
                    ),
                )
                .await;
                emit(frames, ResponseFrame::End).await;
                return Ok(Outcome::Continue);
            }
        };

        let stdout = child.stdout.take().ok_or(CillowError::ChannelClosed)?;
        let stderr = child.stderr.take().ok_or(CillowError::ChannelClosed)?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        emit(frames, ResponseFrame::Stream {
                            stream: StreamKind::Stdout,
                            text: format!("{}\n", line),
                        }).await;
                    }
                    _ => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        emit(frames, ResponseFrame::Stream {
                            stream: StreamKind::Stderr,
                            text: format!("{}\n", line),
                        }).await;
                    }
                    _ => stderr_open = false,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            status = child.wait() => status?,
        };

        if status.success() {
            emit(
                frames,
                ResponseFrame::Result {
                    value: Some(serde_json::json!(0)),
                },
            )
            .await;
        } else {
            emit(
                frames,
                ResponseFrame::exception(
                    ExceptionKind::CommandError,
                    format!("command exited with status {}", status.code().unwrap_or(-1)),
                ),
            )
            .await;
        }
        emit(frames, ResponseFrame::End).await;
        Ok(Outcome::Continue)
    }

    /// Stop the child: polite exit, then SIGTERM, then SIGKILL.
    async fn terminate(mut self, grace: Duration) {
        let _ = self
            .writer
            .send(match codec::encode_driver_op(&DriverOp::Exit) {
                Ok(bytes) => bytes,
                Err(_) => bytes::Bytes::new(),
            })
            .await;
        drop(self.writer);

        if !grace.is_zero() {
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
            if let Some(pid) = self.child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            if tokio::time::timeout(Duration::from_secs(1), self.child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }

        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Forward a frame, ignoring a disconnected receiver: the worker must keep
/// draining its channel even when the client is gone.
async fn emit(frames: &mpsc::Sender<ResponseFrame>, frame: ResponseFrame) {
    let _ = frames.send(frame).await;
}

fn default_message(kind: ExceptionKind) -> &'static str {
    match kind {
        ExceptionKind::Cancelled => "request cancelled",
        ExceptionKind::Shutdown => "server shutting down",
        ExceptionKind::WorkerDied => "interpreter process exited unexpectedly",
        ExceptionKind::WorkerStartupFailed => "interpreter failed to start",
        _ => "request aborted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        which::which("python3").is_ok() || which::which("python").is_ok()
    }

    async fn collect_until_end(rx: &mut mpsc::Receiver<ResponseFrame>) -> Vec<ResponseFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            let terminal = frame.is_terminal();
            frames.push(frame);
            if terminal {
                break;
            }
        }
        frames
    }

    fn spawn_system_worker() -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn(
            1,
            Environment::System,
            WorkerSettings::default(),
            exit_tx,
        );
        (handle, exit_rx)
    }

    fn run_code(source: &str) -> Request {
        Request::RunCode {
            env: Environment::System,
            source: source.to_string(),
        }
    }

    #[tokio::test]
    async fn test_expression_value_round_trip() {
        if !python_available() {
            return;
        }
        let (handle, _exit) = spawn_system_worker();
        let (tx, mut rx) = mpsc::channel(16);
        let request = run_code("x = 2\nx + 3");
        assert!(handle.submit(WorkerRequest { request, frames: tx }));

        let frames = collect_until_end(&mut rx).await;
        assert!(matches!(frames.last(), Some(ResponseFrame::End)));
        let value = frames.iter().find_map(|f| match f {
            ResponseFrame::Result { value } => Some(value.clone()),
            _ => None,
        });
        assert_eq!(value, Some(Some(serde_json::json!(5))));
        handle.cancel(ExceptionKind::Cancelled);
    }

    #[tokio::test]
    async fn test_namespace_persists_across_requests() {
        if !python_available() {
            return;
        }
        let (handle, _exit) = spawn_system_worker();

        let (tx, mut rx) = mpsc::channel(16);
        let request = run_code("value = 41");
        handle.submit(WorkerRequest { request, frames: tx });
        collect_until_end(&mut rx).await;

        let (tx, mut rx) = mpsc::channel(16);
        let request = run_code("value + 1");
        handle.submit(WorkerRequest { request, frames: tx });
        let frames = collect_until_end(&mut rx).await;
        let value = frames.iter().find_map(|f| match f {
            ResponseFrame::Result { value } => Some(value.clone()),
            _ => None,
        });
        assert_eq!(value, Some(Some(serde_json::json!(42))));
        handle.cancel(ExceptionKind::Cancelled);
    }

    #[tokio::test]
    async fn test_syntax_error_is_user_code_error() {
        if !python_available() {
            return;
        }
        let (handle, _exit) = spawn_system_worker();
        let (tx, mut rx) = mpsc::channel(16);
        let request = run_code("def broken(:");
        handle.submit(WorkerRequest { request, frames: tx });

        let frames = collect_until_end(&mut rx).await;
        // No install attempt: the only frames are the exception and the end.
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[0],
            ResponseFrame::Exception {
                error: ExceptionKind::UserCodeError,
                ..
            }
        ));
        handle.cancel(ExceptionKind::Cancelled);
    }

    #[tokio::test]
    async fn test_run_command_streams_and_reports_exit() {
        if !python_available() {
            return;
        }
        let (handle, _exit) = spawn_system_worker();
        let (tx, mut rx) = mpsc::channel(16);
        let request = Request::RunCommand {
            env: Environment::System,
            argv: vec!["echo".to_string(), "hello".to_string()],
        };
        handle.submit(WorkerRequest { request, frames: tx });

        let frames = collect_until_end(&mut rx).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            ResponseFrame::Stream { stream: StreamKind::Stdout, text } if text == "hello\n"
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ResponseFrame::Result { value: Some(v) } if v == &serde_json::json!(0)
        )));
        handle.cancel(ExceptionKind::Cancelled);
    }

    #[tokio::test]
    async fn test_startup_failure_surfaces_on_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/site-packages")).unwrap();
        // Valid layout but no interpreter binary inside.
        let env = Environment::parse(dir.path().to_str().unwrap()).unwrap();

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let handle = WorkerHandle::spawn(7, env, WorkerSettings::default(), exit_tx);

        let (tx, mut rx) = mpsc::channel(16);
        let request = Request::RunCode {
            env: Environment::System,
            source: "1".to_string(),
        };
        handle.submit(WorkerRequest { request, frames: tx });

        let frames = collect_until_end(&mut rx).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            ResponseFrame::Exception {
                error: ExceptionKind::WorkerStartupFailed,
                ..
            }
        )));
        let exit = exit_rx.recv().await.unwrap();
        assert_eq!(exit.client, 7);
    }
}
