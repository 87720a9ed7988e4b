//! Tunable configuration with environment variable support.
//!
//! Each value resolves with a two-tier priority: environment variable first,
//! then built-in default. Values that callers may override per operation
//! (the command timeout) also accept an explicit parameter, which takes
//! precedence over both.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWAY_CONNECT_TIMEOUT` | 10s | SSH connect timeout in seconds |
//! | `GATEWAY_AUTH_TIMEOUT` | 10s | SSH authentication timeout in seconds |
//! | `GATEWAY_COMMAND_TIMEOUT` | 30s | Interactive command timeout in seconds |
//! | `GATEWAY_SCP_TIMEOUT` | 600s | SCP transfer timeout in seconds |
//! | `GATEWAY_CANCEL_DEADLINE` | 5s | Grace period for task cancellation |
//! | `GATEWAY_PROBE_INTERVAL` | 30s | Health probe interval in seconds |
//! | `GATEWAY_PROBE_TIMEOUT` | 5s | Health probe TCP connect timeout |
//! | `GATEWAY_FLUSH_INTERVAL_MS` | 100ms | Output batch flush interval |
//! | `GATEWAY_FLUSH_BYTES` | 4096 | Output batch size threshold |
//! | `GATEWAY_MAX_RETRIES` | 2 | Max SSH connect retries (transient errors) |
//! | `GATEWAY_RETRY_DELAY_MS` | 500ms | Initial connect retry delay |

use std::env;
use std::time::Duration;

/// Default SSH connect timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default SSH authentication timeout in seconds
pub(crate) const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;

/// Default interactive command timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default SCP transfer timeout in seconds
pub(crate) const DEFAULT_SCP_TIMEOUT_SECS: u64 = 600;

/// Default deadline for a cancelled task to wind down, in seconds
pub(crate) const DEFAULT_CANCEL_DEADLINE_SECS: u64 = 5;

/// Default health probe interval in seconds
pub(crate) const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;

/// Default health probe TCP connect timeout in seconds
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default output flush interval in milliseconds
pub(crate) const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Default output flush size threshold in bytes
pub(crate) const DEFAULT_FLUSH_BYTES: usize = 4096;

/// Consecutive failed probes before a host is marked unhealthy
pub(crate) const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Consecutive successful probes before a host is marked healthy again
pub(crate) const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;

/// Default maximum retry attempts for transient SSH connect failures
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default initial retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Retry delay cap for exponential backoff
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

fn env_u64(var: &str) -> Option<u64> {
    env::var(var).ok().and_then(|v| v.parse().ok())
}

fn env_usize(var: &str) -> Option<usize> {
    env::var(var).ok().and_then(|v| v.parse().ok())
}

fn env_u32(var: &str) -> Option<u32> {
    env::var(var).ok().and_then(|v| v.parse().ok())
}

/// Resolve the per-command timeout with priority: parameter -> env -> default.
pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_u64("GATEWAY_COMMAND_TIMEOUT"))
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolved runtime tunables, loaded once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub scp_timeout: Duration,
    pub cancel_deadline: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub flush_interval: Duration,
    pub flush_bytes: usize,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_secs(
                env_u64("GATEWAY_CONNECT_TIMEOUT").unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            auth_timeout: Duration::from_secs(
                env_u64("GATEWAY_AUTH_TIMEOUT").unwrap_or(DEFAULT_AUTH_TIMEOUT_SECS),
            ),
            scp_timeout: Duration::from_secs(
                env_u64("GATEWAY_SCP_TIMEOUT").unwrap_or(DEFAULT_SCP_TIMEOUT_SECS),
            ),
            cancel_deadline: Duration::from_secs(
                env_u64("GATEWAY_CANCEL_DEADLINE").unwrap_or(DEFAULT_CANCEL_DEADLINE_SECS),
            ),
            probe_interval: Duration::from_secs(
                env_u64("GATEWAY_PROBE_INTERVAL").unwrap_or(DEFAULT_PROBE_INTERVAL_SECS),
            ),
            probe_timeout: Duration::from_secs(
                env_u64("GATEWAY_PROBE_TIMEOUT").unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS),
            ),
            flush_interval: Duration::from_millis(
                env_u64("GATEWAY_FLUSH_INTERVAL_MS").unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            flush_bytes: env_usize("GATEWAY_FLUSH_BYTES").unwrap_or(DEFAULT_FLUSH_BYTES),
            failure_threshold: env_u32("GATEWAY_FAILURE_THRESHOLD")
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            success_threshold: env_u32("GATEWAY_SUCCESS_THRESHOLD")
                .unwrap_or(DEFAULT_SUCCESS_THRESHOLD),
            max_retries: env_u32("GATEWAY_MAX_RETRIES").unwrap_or(DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_millis(
                env_u64("GATEWAY_RETRY_DELAY_MS").unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            scp_timeout: Duration::from_secs(DEFAULT_SCP_TIMEOUT_SECS),
            cancel_deadline: Duration::from_secs(DEFAULT_CANCEL_DEADLINE_SECS),
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            flush_bytes: DEFAULT_FLUSH_BYTES,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}
