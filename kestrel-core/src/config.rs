//! Configuration constants and environment variables for Kestrel
//!
//! This module centralizes all configurable values. Everything is read once
//! at startup into a `Config` snapshot; there is no other global mutable
//! state in the process.

use std::env;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{KestrelError, KestrelResult};

/// Parse an environment variable as a typed value with a default fallback
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Store and persistence configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the redb database file
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: env_var_or_default("STORE_PATH", "./kestrel.redb".to_string()),
        }
    }
}

/// API listener configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// HTTP listen address
    pub listen: String,
    /// WebSocket listen address; empty means share the HTTP listener
    pub ws_listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: env_var_or_default("API_LISTEN", "127.0.0.1:7780".to_string()),
            ws_listen: env_var_or_default("WS_LISTEN", String::new()),
        }
    }
}

/// Network and IPAM configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Comma-separated list of public addresses seeding the pool
    pub public_ip_pool: Vec<Ipv4Addr>,
    /// CIDR used when a VPC is created without one
    pub default_vpc_cidr: String,
    /// Grace period before a released allocation becomes reusable
    pub release_grace: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let pool = env::var("PUBLIC_IP_POOL")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse::<Ipv4Addr>().ok())
            .collect();
        Self {
            public_ip_pool: pool,
            default_vpc_cidr: env_var_or_default("DEFAULT_VPC_CIDR", "10.0.0.0/24".to_string()),
            release_grace: Duration::from_secs(env_var_or_default(
                "KESTREL_RELEASE_GRACE_SECS",
                300,
            )),
        }
    }
}

/// Reconciler tuning
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Global worker count for VM reconciliation tasks
    pub workers: usize,
    /// Maximum concurrent driver verbs per host
    pub host_verb_concurrency: usize,
    /// Retry budget per step
    pub max_retries: u32,
    /// Base backoff between retries
    pub backoff_base: Duration,
    /// Backoff cap
    pub backoff_cap: Duration,
    /// Timeout per driver verb
    pub verb_timeout: Duration,
    /// Timeout for a whole VM transition
    pub transition_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: env_var_or_default("RECONCILE_WORKERS", 8),
            host_verb_concurrency: env_var_or_default("HOST_VERB_CONCURRENCY", 4),
            max_retries: env_var_or_default("KESTREL_STEP_RETRIES", 8),
            backoff_base: Duration::from_millis(env_var_or_default(
                "KESTREL_BACKOFF_BASE_MS",
                500,
            )),
            backoff_cap: Duration::from_secs(env_var_or_default("KESTREL_BACKOFF_CAP_SECS", 30)),
            verb_timeout: Duration::from_secs(env_var_or_default("KESTREL_VERB_TIMEOUT_SECS", 30)),
            transition_timeout: Duration::from_secs(env_var_or_default(
                "KESTREL_TRANSITION_TIMEOUT_SECS",
                600,
            )),
        }
    }
}

/// Host access configuration
#[derive(Debug, Clone)]
pub struct HostAccessConfig {
    /// Path to a host inventory file (JSON), loaded at startup
    pub hosts_config: Option<String>,
    /// SSH identity file used for host drivers
    pub ssh_identity: Option<String>,
    /// Heartbeat staleness after which a host is marked down
    pub heartbeat_staleness: Duration,
}

impl Default for HostAccessConfig {
    fn default() -> Self {
        Self {
            hosts_config: env::var("HOSTS_CONFIG").ok(),
            ssh_identity: env::var("SSH_IDENTITY").ok(),
            heartbeat_staleness: Duration::from_secs(env_var_or_default(
                "KESTREL_HEARTBEAT_STALENESS_SECS",
                30,
            )),
        }
    }
}

/// Console hub tuning
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Per-client output buffer before a slow consumer is disconnected
    pub client_buffer_bytes: usize,
    /// Idle period with no clients before the session socket is closed
    pub idle_timeout: Duration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            client_buffer_bytes: env_var_or_default("KESTREL_CONSOLE_BUFFER_BYTES", 64 * 1024),
            idle_timeout: Duration::from_secs(env_var_or_default(
                "KESTREL_CONSOLE_IDLE_SECS",
                30,
            )),
        }
    }
}

/// Startup-initialized configuration snapshot
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub network: NetworkConfig,
    pub reconciler: ReconcilerConfig,
    pub hosts: HostAccessConfig,
    pub console: ConsoleConfig,
}

impl Config {
    /// Load configuration from the environment, validating the parts that
    /// cannot be defaulted sensibly.
    pub fn load() -> KestrelResult<Self> {
        let config = Self::default();
        config.api.listen.parse::<std::net::SocketAddr>().map_err(|_| {
            KestrelError::validation("API_LISTEN", format!("not a socket address: {}", config.api.listen))
        })?;
        config
            .network
            .default_vpc_cidr
            .parse::<ipnet::Ipv4Net>()
            .map_err(|_| {
                KestrelError::validation(
                    "DEFAULT_VPC_CIDR",
                    format!("not a CIDR: {}", config.network.default_vpc_cidr),
                )
            })?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.reconciler.host_verb_concurrency, 4);
        assert_eq!(config.reconciler.max_retries, 8);
        assert_eq!(config.network.release_grace, Duration::from_secs(300));
        assert_eq!(config.console.client_buffer_bytes, 64 * 1024);
    }
}
