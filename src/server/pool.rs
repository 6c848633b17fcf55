// src/server/pool.rs
//! Worker pool and request router.
//!
//! Owns the live set of interpreter workers keyed by `(client, environment)`
//! and routes requests onto their mailboxes. Admission enforces the global
//! and per-client caps; quota refusals are synthesized directly and never
//! mutate the pool. The pool map and the per-client index share one lock.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::interpreter::worker::{
    WorkerExit, WorkerHandle, WorkerRequest, WorkerSettings, WorkerState,
};
use crate::protocol::{ClientId, Environment, ExceptionKind, Request, ResponseFrame};

/// Capacity limits for the pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Global interpreter cap.
    pub max_interpreters: usize,
    /// Per-client interpreter cap.
    pub interpreters_per_client: usize,
    /// Lifecycle knobs handed to each worker.
    pub worker: WorkerSettings,
}

/// Identity a worker is pooled under.
pub type WorkerKey = (ClientId, Environment);

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerKey, WorkerHandle>,
    per_client: HashMap<ClientId, HashSet<Environment>>,
}

impl PoolState {
    fn insert(&mut self, key: WorkerKey, handle: WorkerHandle) {
        self.per_client
            .entry(key.0)
            .or_default()
            .insert(key.1.clone());
        self.workers.insert(key, handle);
    }

    fn remove(&mut self, key: &WorkerKey) -> Option<WorkerHandle> {
        if let Some(envs) = self.per_client.get_mut(&key.0) {
            envs.remove(&key.1);
            if envs.is_empty() {
                self.per_client.remove(&key.0);
            }
        }
        self.workers.remove(key)
    }

    fn client_count(&self, client: ClientId) -> usize {
        self.per_client.get(&client).map(HashSet::len).unwrap_or(0)
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub clients: usize,
}

/// The worker pool. One instance per broker, shared by every dispatcher.
pub struct WorkerPool {
    settings: PoolSettings,
    state: Mutex<PoolState>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl WorkerPool {
    /// Create the pool and start its reaper task.
    pub fn new(settings: PoolSettings) -> std::sync::Arc<Self> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<WorkerExit>();
        let pool = std::sync::Arc::new(Self {
            settings,
            state: Mutex::new(PoolState::default()),
            exit_tx,
        });

        // Reap workers that die on their own; a fresh worker for the same
        // key may already have replaced the dead one, so match on worker id.
        let reaper = std::sync::Arc::downgrade(&pool);
        tokio::spawn(async move {
            while let Some(exit) = exit_rx.recv().await {
                let Some(pool) = reaper.upgrade() else { break };
                let key = (exit.client, exit.env.clone());
                let mut state = pool.state.lock().await;
                let matches = state
                    .workers
                    .get(&key)
                    .map(|handle| handle.worker_id() == exit.worker_id)
                    .unwrap_or(false);
                if matches {
                    state.remove(&key);
                    debug!(
                        client = exit.client,
                        environment = %exit.env,
                        "reaped dead worker"
                    );
                }
            }
        });

        pool
    }

    /// Route one request, streaming every response frame (ending in `End`)
    /// into `frames`. Quota refusals, unknown environments, and pool-level
    /// kinds are answered directly.
    pub async fn dispatch(
        &self,
        client: ClientId,
        request: Request,
        frames: mpsc::Sender<ResponseFrame>,
    ) {
        match request {
            Request::DeleteInterpreter { env } => {
                self.delete_interpreter(client, &env).await;
                let _ = frames.send(ResponseFrame::null_result()).await;
                let _ = frames.send(ResponseFrame::End).await;
            }
            Request::ShutdownClient => {
                self.remove_client(client).await;
                let _ = frames.send(ResponseFrame::null_result()).await;
                let _ = frames.send(ResponseFrame::End).await;
            }
            request => self.dispatch_to_worker(client, request, frames).await,
        }
    }

    /// Look up or admit the worker for the request's environment and enqueue
    /// the request on its mailbox.
    async fn dispatch_to_worker(
        &self,
        client: ClientId,
        request: Request,
        frames: mpsc::Sender<ResponseFrame>,
    ) {
        let env = match request.environment() {
            Some(env) => env.clone(),
            None => return,
        };

        if let Err(e) = env.validate() {
            let _ = frames
                .send(ResponseFrame::exception(
                    ExceptionKind::UnknownEnvironment,
                    e.to_string(),
                ))
                .await;
            let _ = frames.send(ResponseFrame::End).await;
            return;
        }

        let key = (client, env.clone());
        let mut state = self.state.lock().await;

        if let Some(handle) = state.workers.get(&key) {
            if handle.submit(WorkerRequest {
                request: request.clone(),
                frames: frames.clone(),
            }) {
                return;
            }
            // The actor is gone but the reaper has not caught up; replace it.
            state.remove(&key);
        }

        if state.client_count(client) >= self.settings.interpreters_per_client {
            drop(state);
            let _ = frames
                .send(ResponseFrame::exception(
                    ExceptionKind::PerClientQuotaExceeded,
                    format!(
                        "interpreter limit per client ({}) reached",
                        self.settings.interpreters_per_client
                    ),
                ))
                .await;
            let _ = frames.send(ResponseFrame::End).await;
            return;
        }

        if state.workers.len() >= self.settings.max_interpreters {
            drop(state);
            let _ = frames
                .send(ResponseFrame::exception(
                    ExceptionKind::GlobalQuotaExceeded,
                    format!(
                        "interpreter limit ({}) reached",
                        self.settings.max_interpreters
                    ),
                ))
                .await;
            let _ = frames.send(ResponseFrame::End).await;
            return;
        }

        info!(client, environment = %env, "starting interpreter worker");
        let handle = WorkerHandle::spawn(
            client,
            env.clone(),
            self.settings.worker.clone(),
            self.exit_tx.clone(),
        );
        handle.submit(WorkerRequest { request, frames });
        state.insert(key, handle);
    }

    /// Tear down one worker; its in-flight requests end with `Cancelled`.
    pub async fn delete_interpreter(&self, client: ClientId, env: &Environment) {
        let key = (client, env.clone());
        let handle = self.state.lock().await.remove(&key);
        if let Some(handle) = handle {
            info!(client, environment = %env, "deleting interpreter worker");
            handle.cancel(ExceptionKind::Cancelled);
        }
    }

    /// Tear down every worker owned by a client (disconnect path).
    pub async fn remove_client(&self, client: ClientId) {
        let mut state = self.state.lock().await;
        let envs: Vec<Environment> = state
            .per_client
            .get(&client)
            .map(|envs| envs.iter().cloned().collect())
            .unwrap_or_default();
        if envs.is_empty() {
            return;
        }
        info!(client, workers = envs.len(), "removing client workers");
        for env in envs {
            if let Some(handle) = state.remove(&(client, env)) {
                handle.cancel(ExceptionKind::Cancelled);
            }
        }
    }

    /// Tear down everything (broker shutdown); requests end with `Shutdown`.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let keys: Vec<WorkerKey> = state.workers.keys().cloned().collect();
        if !keys.is_empty() {
            info!(workers = keys.len(), "terminating all interpreter workers");
        }
        for key in keys {
            if let Some(handle) = state.remove(&key) {
                handle.cancel(ExceptionKind::Shutdown);
            }
        }
    }

    /// Current pool counters.
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut idle = 0;
        let mut busy = 0;
        for handle in state.workers.values() {
            match handle.state() {
                WorkerState::Idle => idle += 1,
                WorkerState::Busy => busy += 1,
                WorkerState::Starting | WorkerState::Terminating => {}
            }
        }
        PoolStats {
            total_workers: state.workers.len(),
            idle_workers: idle,
            busy_workers: busy,
            clients: state.per_client.len(),
        }
    }

    /// Number of live workers for one client.
    pub async fn client_worker_count(&self, client: ClientId) -> usize {
        self.state.lock().await.client_count(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Environment;

    fn python_available() -> bool {
        which::which("python3").is_ok() || which::which("python").is_ok()
    }

    fn test_pool(max: usize, per_client: usize) -> std::sync::Arc<WorkerPool> {
        WorkerPool::new(PoolSettings {
            max_interpreters: max,
            interpreters_per_client: per_client,
            worker: WorkerSettings::default(),
        })
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

    fn fake_venv() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/site-packages")).unwrap();
        let env = Environment::parse(dir.path().to_str().unwrap()).unwrap();
        (dir, env)
    }

    #[tokio::test]
    async fn test_unknown_environment_is_refused_without_pool_mutation() {
        let pool = test_pool(4, 2);
        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(
            1,
            Request::RunCode {
                env: Environment::parse("/no/such/venv").unwrap(),
                source: "1".to_string(),
            },
            tx,
        )
        .await;

        let frames = collect_until_end(&mut rx).await;
        assert!(matches!(
            frames[0],
            ResponseFrame::Exception {
                error: ExceptionKind::UnknownEnvironment,
                ..
            }
        ));
        assert_eq!(pool.stats().await.total_workers, 0);
    }

    #[tokio::test]
    async fn test_per_client_quota_refusal() {
        if !python_available() {
            return;
        }
        let pool = test_pool(4, 1);

        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(
            1,
            Request::SwitchInterpreter {
                env: Environment::System,
            },
            tx,
        )
        .await;
        collect_until_end(&mut rx).await;
        assert_eq!(pool.client_worker_count(1).await, 1);

        // A second distinct environment for the same client must be refused.
        let (dir, venv) = fake_venv();
        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(1, Request::SwitchInterpreter { env: venv }, tx)
            .await;
        let frames = collect_until_end(&mut rx).await;
        assert!(matches!(
            frames[0],
            ResponseFrame::Exception {
                error: ExceptionKind::PerClientQuotaExceeded,
                ..
            }
        ));
        assert_eq!(pool.client_worker_count(1).await, 1);
        drop(dir);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_quota_refusal() {
        if !python_available() {
            return;
        }
        let pool = test_pool(1, 1);

        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(
            1,
            Request::SwitchInterpreter {
                env: Environment::System,
            },
            tx,
        )
        .await;
        collect_until_end(&mut rx).await;

        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(
            2,
            Request::SwitchInterpreter {
                env: Environment::System,
            },
            tx,
        )
        .await;
        let frames = collect_until_end(&mut rx).await;
        assert!(matches!(
            frames[0],
            ResponseFrame::Exception {
                error: ExceptionKind::GlobalQuotaExceeded,
                ..
            }
        ));
        assert_eq!(pool.stats().await.total_workers, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_client_reaps_all_workers() {
        if !python_available() {
            return;
        }
        let pool = test_pool(4, 2);

        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(
            9,
            Request::SwitchInterpreter {
                env: Environment::System,
            },
            tx,
        )
        .await;
        collect_until_end(&mut rx).await;
        assert_eq!(pool.client_worker_count(9).await, 1);

        pool.remove_client(9).await;
        assert_eq!(pool.client_worker_count(9).await, 0);
        assert_eq!(pool.stats().await.total_workers, 0);
    }

    #[tokio::test]
    async fn test_delete_interpreter_is_idempotent() {
        let pool = test_pool(4, 2);
        // Deleting a worker that never existed still answers cleanly.
        let (tx, mut rx) = mpsc::channel(8);
        pool.dispatch(
            3,
            Request::DeleteInterpreter {
                env: Environment::System,
            },
            tx,
        )
        .await;
        let frames = collect_until_end(&mut rx).await;
        assert!(matches!(frames[0], ResponseFrame::Result { value: None }));
        assert!(matches!(frames[1], ResponseFrame::End));
    }
}
