//! Wire types for the WebSocket protocol.
//!
//! Every outbound frame carries exactly one `type` tag. Inbound frames are
//! dispatched on their `type` field by the orchestrator; the payload structs
//! here only describe the `data` object of each message.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::GatewayError;

/// Reachability snapshot for a single configured host.
///
/// `last_checked` is an RFC-3339 timestamp, or `None` before the first probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub is_healthy: bool,
    pub last_checked: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Lock state as shown in the welcome frame and lock broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockStatusInfo {
    pub locked: bool,
    pub lock_owner: Option<String>,
}

/// Session state as shown in the welcome frame and session broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusInfo {
    pub active: bool,
    pub owner: Option<String>,
}

/// Error payload nested inside an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// All frames the gateway sends to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Welcome {
        message: String,
        connection_id: String,
        lock_status: LockStatusInfo,
        session_status: SessionStatusInfo,
        server_health: BTreeMap<String, HealthSnapshot>,
    },
    Output {
        data: String,
    },
    Status {
        message: String,
    },
    Complete {
        message: String,
    },
    Error {
        success: bool,
        error: ErrorBody,
    },
    SessionStarted {
        message: String,
        session_owner: String,
    },
    SessionEnded {
        message: String,
    },
    LockStatus {
        locked: bool,
        lock_owner: Option<String>,
        message: String,
    },
    SessionStatus {
        session_active: bool,
        session_owner: Option<String>,
        message: String,
    },
    ServerHealth {
        server_name: String,
        is_healthy: bool,
        status: HealthSnapshot,
    },
}

impl OutboundFrame {
    /// Build an `output` frame carrying a batch of shell output.
    pub fn output(data: impl Into<String>) -> Self {
        OutboundFrame::Output { data: data.into() }
    }

    /// Build a `status` progress frame.
    pub fn status(message: impl Into<String>) -> Self {
        OutboundFrame::Status {
            message: message.into(),
        }
    }

    /// Build a terminal `complete` frame.
    pub fn complete(message: impl Into<String>) -> Self {
        OutboundFrame::Complete {
            message: message.into(),
        }
    }

    /// Build an `error` frame from a typed gateway error.
    pub fn error(err: &GatewayError) -> Self {
        OutboundFrame::Error {
            success: false,
            error: ErrorBody {
                code: err.code(),
                message: err.class_message().to_string(),
                detail: err.detail(),
            },
        }
    }
}

/// Payload of an inbound `ssh_command` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SshCommandRequest {
    pub server_name: String,
    pub command: String,
    pub stop_phrase: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Payload of an inbound `scp_transfer` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ScpTransferRequest {
    #[serde(default = "default_transfer_name")]
    pub transfer_name: String,
}

fn default_transfer_name() -> String {
    "stub_data_transfer".to_string()
}

/// Payload of an inbound `ssh_input` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SshInputRequest {
    pub input: String,
}

/// Record emitted after a workflow step completes successfully.
///
/// The gateway does not persist history itself; it hands these to the
/// logging pipeline under the `stub_gateway::history` target, where an
/// external subscriber can pick them up.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub connection_id: String,
    pub operation: String,
    pub target: String,
    pub started_at: String,
    pub finished_at: String,
}

impl CompletionRecord {
    pub fn emit(&self) {
        tracing::info!(
            target: "stub_gateway::history",
            connection_id = %self.connection_id,
            operation = %self.operation,
            operation_target = %self.target,
            started_at = %self.started_at,
            finished_at = %self.finished_at,
            "workflow step completed"
        );
    }
}

#[cfg(test)]
mod frame_serialization {
    use super::*;

    mod outbound {
        use super::*;

        #[test]
        fn test_welcome_shape() {
            let frame = OutboundFrame::Welcome {
                message: "Connected to Stub SSH WebSocket".to_string(),
                connection_id: "abc-123".to_string(),
                lock_status: LockStatusInfo {
                    locked: false,
                    lock_owner: None,
                },
                session_status: SessionStatusInfo {
                    active: false,
                    owner: None,
                },
                server_health: BTreeMap::new(),
            };

            let json = serde_json::to_value(&frame).unwrap();

            assert_eq!(json["type"], "welcome");
            assert_eq!(json["connection_id"], "abc-123");
            assert_eq!(json["lock_status"]["locked"], false);
            assert!(json["lock_status"]["lock_owner"].is_null());
            assert_eq!(json["session_status"]["active"], false);
            assert!(json["server_health"].as_object().unwrap().is_empty());
        }

        #[test]
        fn test_output_frame() {
            let frame = OutboundFrame::output("line one\nline two\n");
            let json = serde_json::to_value(&frame).unwrap();

            assert_eq!(json["type"], "output");
            assert_eq!(json["data"], "line one\nline two\n");
        }

        #[test]
        fn test_complete_frame() {
            let frame = OutboundFrame::complete("Command execution completed");
            let json = serde_json::to_value(&frame).unwrap();

            assert_eq!(json["type"], "complete");
            assert_eq!(json["message"], "Command execution completed");
        }

        #[test]
        fn test_error_frame_carries_code_and_detail() {
            let err = GatewayError::SessionAlreadyActive {
                owner: "conn-1".to_string(),
            };
            let frame = OutboundFrame::error(&err);
            let json = serde_json::to_value(&frame).unwrap();

            assert_eq!(json["type"], "error");
            assert_eq!(json["success"], false);
            assert_eq!(json["error"]["code"], 50004);
            assert_eq!(json["error"]["detail"], "owner=conn-1");
        }

        #[test]
        fn test_error_frame_omits_empty_detail() {
            let frame = OutboundFrame::error(&GatewayError::NoActiveSession);
            let json = serde_json::to_string(&frame).unwrap();

            assert!(!json.contains("\"detail\""));
        }

        #[test]
        fn test_server_health_frame() {
            let status = HealthSnapshot {
                server_name: "mdwap1p".to_string(),
                host: "10.0.0.1".to_string(),
                port: 22,
                is_healthy: false,
                last_checked: Some("2024-06-01T00:00:00Z".to_string()),
                consecutive_failures: 2,
                consecutive_successes: 0,
            };
            let frame = OutboundFrame::ServerHealth {
                server_name: "mdwap1p".to_string(),
                is_healthy: false,
                status,
            };
            let json = serde_json::to_value(&frame).unwrap();

            assert_eq!(json["type"], "server_health");
            assert_eq!(json["server_name"], "mdwap1p");
            assert_eq!(json["is_healthy"], false);
            assert_eq!(json["status"]["consecutive_failures"], 2);
        }

        #[test]
        fn test_lock_status_broadcast() {
            let frame = OutboundFrame::LockStatus {
                locked: true,
                lock_owner: Some("conn-9".to_string()),
                message: "SSH service locked by client conn-9".to_string(),
            };
            let json = serde_json::to_value(&frame).unwrap();

            assert_eq!(json["type"], "lock_status");
            assert_eq!(json["locked"], true);
            assert_eq!(json["lock_owner"], "conn-9");
        }
    }

    mod inbound {
        use super::*;

        #[test]
        fn test_ssh_command_request() {
            let json = r#"{"server_name":"mdwap1p","command":"ls","stop_phrase":"PROMPT>"}"#;
            let req: SshCommandRequest = serde_json::from_str(json).unwrap();

            assert_eq!(req.server_name, "mdwap1p");
            assert_eq!(req.command, "ls");
            assert_eq!(req.stop_phrase, "PROMPT>");
            assert_eq!(req.timeout_secs, None);
        }

        #[test]
        fn test_ssh_command_request_with_timeout() {
            let json =
                r#"{"server_name":"x","command":"c","stop_phrase":"p","timeout_secs":120}"#;
            let req: SshCommandRequest = serde_json::from_str(json).unwrap();

            assert_eq!(req.timeout_secs, Some(120));
        }

        #[test]
        fn test_ssh_command_request_missing_field_fails() {
            let json = r#"{"server_name":"mdwap1p"}"#;
            assert!(serde_json::from_str::<SshCommandRequest>(json).is_err());
        }

        #[test]
        fn test_scp_transfer_request_defaults_name() {
            let req: ScpTransferRequest = serde_json::from_str("{}").unwrap();
            assert_eq!(req.transfer_name, "stub_data_transfer");
        }

        #[test]
        fn test_scp_transfer_request_explicit_name() {
            let req: ScpTransferRequest =
                serde_json::from_str(r#"{"transfer_name":"nightly"}"#).unwrap();
            assert_eq!(req.transfer_name, "nightly");
        }

        #[test]
        fn test_ssh_input_request() {
            let req: SshInputRequest = serde_json::from_str(r#"{"input":"yes\n"}"#).unwrap();
            assert_eq!(req.input, "yes\n");
        }
    }

    mod health_snapshot {
        use super::*;

        #[test]
        fn test_round_trip() {
            let snapshot = HealthSnapshot {
                server_name: "mypap1d".to_string(),
                host: "10.0.0.2".to_string(),
                port: 2222,
                is_healthy: true,
                last_checked: None,
                consecutive_failures: 0,
                consecutive_successes: 3,
            };

            let json = serde_json::to_string(&snapshot).unwrap();
            let back: HealthSnapshot = serde_json::from_str(&json).unwrap();

            assert_eq!(back.server_name, "mypap1d");
            assert_eq!(back.port, 2222);
            assert!(back.is_healthy);
            assert_eq!(back.last_checked, None);
            assert_eq!(back.consecutive_successes, 3);
        }
    }
}
