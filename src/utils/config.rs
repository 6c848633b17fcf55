// src/utils/config.rs
//! Server configuration and capacity derivation.
//!
//! All capacity knobs default to values computed from the host at startup:
//!
//! - `max_interpreters`       = min(max(2, cpu_count - 1), 8)
//! - `interpreters_per_client` = 1
//! - `dispatchers`            = max(2, 2 * max_interpreters)
//! - `queue_size`             = dispatchers
//!
//! Each knob can be overridden through a `CILLOW_*` environment variable or
//! the corresponding CLI flag.

use std::time::Duration;

/// Default bind address for the request socket.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default port for the request socket.
pub const DEFAULT_PORT: u16 = 5556;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the request socket to.
    pub host: String,

    /// Port to bind the request socket to.
    pub port: u16,

    /// Maximum total interpreter processes (global cap).
    pub max_interpreters: usize,

    /// Maximum interpreter processes per client.
    pub interpreters_per_client: usize,

    /// Number of dispatcher tasks pulling from the job queue.
    pub dispatchers: usize,

    /// Total queued-job capacity, split across the dispatcher shards;
    /// requests beyond it are refused.
    pub queue_size: usize,

    /// How long to wait for a freshly spawned worker to report ready.
    pub startup_timeout: Duration,

    /// Grace period between asking a worker to exit and killing it.
    pub grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let max_interpreters = cpus.saturating_sub(1).max(2).min(8);
        let dispatchers = (2 * max_interpreters).max(2);

        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_interpreters,
            interpreters_per_client: 1,
            dispatchers,
            queue_size: dispatchers,
            startup_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(3),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from defaults plus `CILLOW_*` environment
    /// variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(host) = env_var("CILLOW_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("CILLOW_PORT") {
            config.port = port;
        }
        if let Some(n) = env_parse("CILLOW_MAX_INTERPRETERS") {
            config.max_interpreters = n;
        }
        if let Some(n) = env_parse("CILLOW_INTERPRETERS_PER_CLIENT") {
            config.interpreters_per_client = n;
        }
        if let Some(n) = env_parse("CILLOW_DISPATCHERS") {
            config.dispatchers = n;
        }
        if let Some(n) = env_parse("CILLOW_QUEUE_SIZE") {
            config.queue_size = n;
        }

        config.normalize()
    }

    /// Clamp interdependent knobs into a consistent state.
    pub fn normalize(mut self) -> Self {
        self.max_interpreters = self.max_interpreters.max(1);
        self.interpreters_per_client = self
            .interpreters_per_client
            .max(1)
            .min(self.max_interpreters);
        self.dispatchers = self.dispatchers.max(1);
        self.queue_size = self.queue_size.max(1);
        self
    }

    /// The socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}
