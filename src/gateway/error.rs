//! Typed gateway errors with wire-level error codes.
//!
//! Error codes are five digits, grouped by class:
//!
//! - `2xxxx` transport (SSH connect/auth/command, SCP, health probes)
//! - `3xxxx` WebSocket protocol (malformed frames, unknown handlers)
//! - `5xxxx` session, lock, and task lifecycle
//!
//! Each variant maps to a stable `(code, class message)` pair; the variant's
//! specifics travel in the `detail` field of the error frame. Connection
//! retry decisions use [`GatewayError::is_transient`], which classifies the
//! failure text: authentication failures are never retried, transient
//! network errors are.

use thiserror::Error;

/// Connection error patterns that indicate transient failures worth retrying.
const TRANSIENT_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "broken pipe",
];

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("SSH connection failed: {0}")]
    SshConnectFailed(String),

    #[error("SSH connection timed out after {0}s")]
    SshConnectTimeout(u64),

    #[error("SSH authentication failed: {0}")]
    SshAuthFailed(String),

    #[error("SSH command failed: {0}")]
    SshCommandFailed(String),

    #[error("not connected to SSH server")]
    NotConnected,

    #[error("SSH configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("server '{0}' not found in configuration")]
    UnknownHost(String),

    #[error("SCP transfer '{0}' not found in configuration")]
    UnknownTransfer(String),

    #[error("SCP transfer failed (exit code {exit_code}): {stderr_tail}")]
    ScpFailed { exit_code: i32, stderr_tail: String },

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("WebSocket send failed: {0}")]
    WsConnectFailed(String),

    #[error("invalid message: {0}")]
    WsInvalidMessage(String),

    #[error("no handler registered for message type '{0}'")]
    WsHandlerNotFound(String),

    #[error("operation cancelled by request")]
    Cancelled,

    #[error("session already active, owned by {owner}")]
    SessionAlreadyActive { owner: String },

    #[error("no active session")]
    NoActiveSession,

    #[error("session owned by {owner}")]
    NotSessionOwner { owner: String },

    #[error("a task is already running for this connection")]
    TaskAlreadyRunning,

    #[error("no task registered for this connection")]
    TaskNotFound,

    #[error("task did not stop within {0}s of cancellation")]
    TaskCancelTimeout(u64),

    #[error("task cancellation failed: {0}")]
    TaskCancelFailed(String),
}

impl GatewayError {
    /// Wire-level error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            GatewayError::SshConnectFailed(_) => 20000,
            GatewayError::SshConnectTimeout(_) => 20001,
            GatewayError::NotConnected => 20004,
            GatewayError::SshAuthFailed(_) => 21000,
            GatewayError::SshCommandFailed(_) => 22000,
            GatewayError::InvalidConfig(_) => 23000,
            GatewayError::UnknownHost(_) => 23002,
            GatewayError::ScpFailed { .. } => 24000,
            GatewayError::UnknownTransfer(_) => 24001,
            GatewayError::HealthCheckFailed(_) => 25000,
            GatewayError::WsConnectFailed(_) => 30000,
            GatewayError::WsInvalidMessage(_) => 31000,
            GatewayError::WsHandlerNotFound(_) => 32000,
            GatewayError::Cancelled => 50000,
            GatewayError::SessionAlreadyActive { .. } => 50004,
            GatewayError::NoActiveSession => 50005,
            GatewayError::NotSessionOwner { .. } => 50006,
            GatewayError::TaskAlreadyRunning => 50010,
            GatewayError::TaskNotFound => 50011,
            GatewayError::TaskCancelTimeout(_) => 50012,
            GatewayError::TaskCancelFailed(_) => 50013,
        }
    }

    /// Stable, human-readable class message for the error frame.
    pub fn class_message(&self) -> &'static str {
        match self {
            GatewayError::SshConnectFailed(_) => "SSH connection failed",
            GatewayError::SshConnectTimeout(_) => "SSH connection timeout",
            GatewayError::NotConnected => "Not connected to SSH",
            GatewayError::SshAuthFailed(_) => "SSH authentication failed",
            GatewayError::SshCommandFailed(_) => "SSH command execution failed",
            GatewayError::InvalidConfig(_) => "SSH configuration error",
            GatewayError::UnknownHost(_) => "SSH server configuration not found",
            GatewayError::ScpFailed { .. } => "SCP file transfer failed",
            GatewayError::UnknownTransfer(_) => "SCP transfer configuration not found",
            GatewayError::HealthCheckFailed(_) => "SSH health check failed",
            GatewayError::WsConnectFailed(_) => "WebSocket connection failed",
            GatewayError::WsInvalidMessage(_) => "Invalid message format",
            GatewayError::WsHandlerNotFound(_) => "Message handler not found",
            GatewayError::Cancelled => "Operation cancelled",
            GatewayError::SessionAlreadyActive { .. } => "Session already active",
            GatewayError::NoActiveSession => "No active session",
            GatewayError::NotSessionOwner { .. } => "Session permission denied",
            GatewayError::TaskAlreadyRunning => "Task already running",
            GatewayError::TaskNotFound => "Task not found",
            GatewayError::TaskCancelTimeout(_) => "Task cancellation timeout",
            GatewayError::TaskCancelFailed(_) => "Task cancellation failed",
        }
    }

    /// Variant-specific detail for the error frame, if it adds anything
    /// beyond the class message.
    pub fn detail(&self) -> Option<String> {
        match self {
            GatewayError::SshConnectFailed(detail)
            | GatewayError::SshAuthFailed(detail)
            | GatewayError::SshCommandFailed(detail)
            | GatewayError::InvalidConfig(detail)
            | GatewayError::HealthCheckFailed(detail)
            | GatewayError::WsConnectFailed(detail)
            | GatewayError::WsInvalidMessage(detail)
            | GatewayError::TaskCancelFailed(detail) => Some(detail.clone()),
            GatewayError::SshConnectTimeout(secs) => Some(format!("timed out after {}s", secs)),
            GatewayError::UnknownHost(alias) => Some(format!("unknown server alias '{}'", alias)),
            GatewayError::UnknownTransfer(name) => {
                Some(format!("unknown transfer recipe '{}'", name))
            }
            GatewayError::ScpFailed {
                exit_code,
                stderr_tail,
            } => Some(format!("exit_code={}; {}", exit_code, stderr_tail)),
            GatewayError::WsHandlerNotFound(msg_type) => {
                Some(format!("unknown message type '{}'", msg_type))
            }
            GatewayError::SessionAlreadyActive { owner }
            | GatewayError::NotSessionOwner { owner } => Some(format!("owner={}", owner)),
            GatewayError::TaskCancelTimeout(secs) => {
                Some(format!("task still running after {}s", secs))
            }
            GatewayError::Cancelled
            | GatewayError::NotConnected
            | GatewayError::NoActiveSession
            | GatewayError::TaskAlreadyRunning
            | GatewayError::TaskNotFound => None,
        }
    }

    /// Whether a connection attempt that produced this error is worth
    /// retrying. Authentication failures are never retried to avoid account
    /// lockouts; timeouts and transient network errors are.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::SshConnectTimeout(_) => true,
            GatewayError::SshAuthFailed(_) => false,
            GatewayError::SshConnectFailed(detail) => is_transient_error(detail),
            _ => false,
        }
    }
}

/// Classify an error message as transient (retryable) or permanent.
pub(crate) fn is_transient_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    TRANSIENT_ERRORS
        .iter()
        .any(|pattern| error_lower.contains(pattern))
}
