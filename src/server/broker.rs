// src/server/broker.rs
//! The request broker: socket endpoint, job queue, and dispatcher pool.
//!
//! Each accepted connection is one client identity. A reader task parses one
//! request per socket frame and enqueues it as a job; a writer task sends
//! response frames back in arrival order. Dispatcher tasks pull jobs from
//! the bounded queue, drive the worker pool, and relay every frame to the
//! originating client until the terminal frame.
//!
//! The queue is sharded by worker key: every job for a given
//! `(client, environment)` lands in the same dispatcher's shard, so requests
//! for one key are dispatched in the order the broker accepted them. Across
//! keys there is no ordering guarantee.
//!
//! Back-pressure is synchronous: when the target shard is full the request
//! is refused with a `ServerBusy` exception, and the accept path never
//! blocks on job processing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::interpreter::worker::WorkerSettings;
use crate::protocol::codec::{self, length_codec};
use crate::protocol::{ClientId, ExceptionKind, Request, ResponseFrame};
use crate::utils::config::ServerConfig;
use crate::utils::errors::Result;

use super::pool::{PoolSettings, WorkerPool};

/// A dequeued request plus the reply identity its frames flow back on.
struct Job {
    client: ClientId,
    request: Request,
    reply: mpsc::Sender<ResponseFrame>,
}

/// The network-facing broker process.
pub struct Server {
    config: ServerConfig,
    pool: Arc<WorkerPool>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the request socket and build the worker pool.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let config = config.normalize();
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let pool = WorkerPool::new(PoolSettings {
            max_interpreters: config.max_interpreters,
            interpreters_per_client: config.interpreters_per_client,
            worker: WorkerSettings {
                startup_timeout: config.startup_timeout,
                grace_period: config.grace_period,
            },
        });

        info!("max interpreter processes: {}", config.max_interpreters);
        info!(
            "interpreter processes per client: {}",
            config.interpreters_per_client
        );
        info!("dispatcher tasks: {}", config.dispatchers);
        info!("max request queue size: {}", config.queue_size);

        Ok(Self {
            config,
            pool,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// The actually bound address (useful with an ephemeral port).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the broker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// The worker pool, for stats and tests.
    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    /// Serve until the shutdown token fires, then drain and tear down.
    pub async fn run(self) -> Result<()> {
        // One bounded shard per dispatcher; a worker key always hashes to
        // the same shard, which is what keeps per-key dispatch in accept
        // order. The shards together hold the configured queue capacity.
        let shard_capacity = self
            .config
            .queue_size
            .div_ceil(self.config.dispatchers)
            .max(1);
        let mut shard_txs = Vec::with_capacity(self.config.dispatchers);
        let mut shard_rxs = Vec::with_capacity(self.config.dispatchers);
        let mut dispatchers = Vec::with_capacity(self.config.dispatchers);
        for id in 0..self.config.dispatchers {
            let (jobs_tx, jobs_rx) = async_channel::bounded::<Job>(shard_capacity);
            let pool = self.pool.clone();
            let shutdown = self.shutdown.clone();
            dispatchers.push(tokio::spawn(dispatcher_loop(
                id,
                jobs_rx.clone(),
                pool,
                shutdown,
            )));
            shard_txs.push(jobs_tx);
            shard_rxs.push(jobs_rx);
        }
        let shards = Arc::new(shard_txs);

        info!("listening on {}", self.listener.local_addr()?);
        let next_client = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let client = next_client.fetch_add(1, Ordering::Relaxed);
                            debug!(client, %peer, "client connected");
                            tokio::spawn(handle_connection(
                                stream,
                                client,
                                shards.clone(),
                                self.pool.clone(),
                                self.shutdown.clone(),
                            ));
                        }
                        Err(e) => error!("accept failed: {}", e),
                    }
                }
            }
        }

        info!("shutting down: draining request queue");
        for shard in shards.iter() {
            shard.close();
        }
        for shard in &shard_rxs {
            while let Ok(job) = shard.try_recv() {
                let _ = job
                    .reply
                    .send(ResponseFrame::exception(
                        ExceptionKind::Shutdown,
                        "server shutting down",
                    ))
                    .await;
                let _ = job.reply.send(ResponseFrame::End).await;
            }
        }

        self.pool.shutdown().await;
        for dispatcher in dispatchers {
            let _ = dispatcher.await;
        }
        // Give workers the grace period to exit before the process does.
        tokio::time::sleep(self.config.grace_period).await;
        info!("shutdown complete");
        Ok(())
    }
}

/// Pull jobs and drive them through the pool, one at a time.
async fn dispatcher_loop(
    id: usize,
    jobs: async_channel::Receiver<Job>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        let (frames_tx, mut frames_rx) = mpsc::channel::<ResponseFrame>(64);
        pool.dispatch(job.client, job.request, frames_tx).await;

        let mut saw_terminal = false;
        while let Some(frame) = frames_rx.recv().await {
            let terminal = frame.is_terminal();
            let _ = job.reply.send(frame).await;
            if terminal {
                saw_terminal = true;
                break;
            }
        }
        if !saw_terminal {
            // The frame stream ended without a terminal: the worker vanished
            // mid-request. Exactly one synthetic terminal reaches the client.
            let _ = job
                .reply
                .send(ResponseFrame::exception(
                    ExceptionKind::WorkerDied,
                    "interpreter process exited unexpectedly",
                ))
                .await;
            let _ = job.reply.send(ResponseFrame::End).await;
        }
    }
    debug!(dispatcher = id, "dispatcher stopped");
}

/// The shard a request belongs to. Requests for the same worker key must
/// always land on the same dispatcher.
fn shard_index(client: ClientId, request: &Request, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client.hash(&mut hasher);
    request.environment().hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// Serve one client connection until EOF or shutdown.
async fn handle_connection(
    stream: TcpStream,
    client: ClientId,
    shards: Arc<Vec<async_channel::Sender<Job>>>,
    pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, length_codec());
    let (reply_tx, reply_rx) = mpsc::channel::<ResponseFrame>(64);

    let writer = tokio::spawn(write_loop(write_half, reply_rx));

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(client, "socket read failed: {}", e);
                    break;
                }
                None => break,
            },
        };

        let request = match codec::decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                let _ = reply_tx
                    .send(ResponseFrame::exception(
                        ExceptionKind::MalformedRequest,
                        e.to_string(),
                    ))
                    .await;
                let _ = reply_tx.send(ResponseFrame::End).await;
                continue;
            }
        };

        let shard = &shards[shard_index(client, &request, shards.len())];
        let job = Job {
            client,
            request,
            reply: reply_tx.clone(),
        };
        match shard.try_send(job) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(job)) => {
                let _ = job
                    .reply
                    .send(ResponseFrame::exception(
                        ExceptionKind::ServerBusy,
                        "request queue is full, try again later",
                    ))
                    .await;
                let _ = job.reply.send(ResponseFrame::End).await;
            }
            Err(async_channel::TrySendError::Closed(job)) => {
                let _ = job
                    .reply
                    .send(ResponseFrame::exception(
                        ExceptionKind::Shutdown,
                        "server shutting down",
                    ))
                    .await;
                let _ = job.reply.send(ResponseFrame::End).await;
            }
        }
    }

    debug!(client, "client disconnected");
    pool.remove_client(client).await;
    drop(reply_tx);
    let _ = writer.await;
}

/// Serialize response frames back to the client in order.
async fn write_loop(write_half: OwnedWriteHalf, mut frames: mpsc::Receiver<ResponseFrame>) {
    let mut writer = FramedWrite::new(write_half, length_codec());
    while let Some(frame) = frames.recv().await {
        let encoded = match codec::encode_response(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode response frame: {}", e);
                continue;
            }
        };
        if writer.send(encoded).await.is_err() {
            break;
        }
    }
    let _ = writer.flush().await;
}
