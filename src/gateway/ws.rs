//! WebSocket connection orchestrator.
//!
//! One logical task per connection runs the dispatch loop; long-running SSH
//! work is started through the task registry as a child task so the loop
//! keeps receiving control messages (`end_session` cancels in-flight work).
//! Teardown on disconnect always runs all four steps — cancel the task,
//! release the lock if owned, close the runner, deregister the connection —
//! even when earlier steps fail.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use poem::web::Data;
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::{IntoResponse, handler};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::config::{GatewayConfig, resolve_command_timeout};
use super::connections::{ConnectionMap, OutputSink};
use super::error::GatewayError;
use super::health::HealthMonitor;
use super::lock::SessionLock;
use super::registry::{HostRegistry, TransferRecipe};
use super::runner::{RunOutcome, SshRunner};
use super::tasks::TaskRegistry;
use super::types::{
    CompletionRecord, LockStatusInfo, OutboundFrame, ScpTransferRequest, SessionStatusInfo,
    SshCommandRequest, SshInputRequest,
};

/// Shared state wired at startup and handed to every connection.
pub struct Gateway {
    pub config: GatewayConfig,
    pub registry: Arc<HostRegistry>,
    pub health: Arc<HealthMonitor>,
    pub lock: SessionLock,
    pub tasks: TaskRegistry,
    pub connections: Arc<ConnectionMap>,
    pub runners: DashMap<String, Arc<SshRunner>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<HostRegistry>,
        health: Arc<HealthMonitor>,
        connections: Arc<ConnectionMap>,
    ) -> Self {
        Self {
            config,
            registry,
            health,
            lock: SessionLock::new(),
            tasks: TaskRegistry::new(),
            connections,
            runners: DashMap::new(),
        }
    }
}

/// WebSocket endpoint at `/ws/v1/stub`.
#[handler]
pub fn stub_websocket(ws: WebSocket, Data(gateway): Data<&Arc<Gateway>>) -> impl IntoResponse {
    let gateway = gateway.clone();
    ws.on_upgrade(move |socket| handle_connection(gateway, socket))
}

async fn handle_connection(gateway: Arc<Gateway>, socket: WebSocketStream) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let (mut sink, mut stream) = socket.split();

    // The welcome goes out before the connection joins the broadcast set,
    // so it is always the first frame the client sees.
    let welcome = build_welcome(&gateway, &connection_id);
    let welcome_text = match serde_json::to_string(&welcome) {
        Ok(text) => text,
        Err(e) => {
            error!("[{}] failed to serialize welcome: {}", connection_id, e);
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(welcome_text)).await {
        error!(
            "[{}] {}",
            connection_id,
            GatewayError::WsConnectFailed(format!("welcome frame undeliverable: {}", e))
        );
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    gateway.connections.register(&connection_id, tx);

    // The writer task owns the sink half and drains frames in order; it
    // ends once the connection is removed from the map and the queue drops.
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!("WebSocket write failed for {}: {}", writer_id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch(&gateway, &connection_id, &text).await,
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by client: {}", connection_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error for {}: {}", connection_id, e);
                break;
            }
        }
    }

    teardown(&gateway, &connection_id).await;
}

fn build_welcome(gateway: &Gateway, connection_id: &str) -> OutboundFrame {
    let lock = gateway.lock.snapshot();
    OutboundFrame::Welcome {
        message: "Connected to Stub SSH Gateway".to_string(),
        connection_id: connection_id.to_string(),
        lock_status: LockStatusInfo {
            locked: lock.active,
            lock_owner: lock.owner.clone(),
        },
        session_status: SessionStatusInfo {
            active: lock.active,
            owner: lock.owner,
        },
        server_health: gateway.health.snapshot_all(),
    }
}

/// Parse one inbound frame and route it. Protocol errors produce an error
/// frame and keep the connection open.
async fn dispatch(gateway: &Arc<Gateway>, connection_id: &str, raw: &str) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            send_error(
                gateway,
                connection_id,
                &GatewayError::WsInvalidMessage(format!("malformed JSON: {}", e)),
            );
            return;
        }
    };

    let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
        send_error(
            gateway,
            connection_id,
            &GatewayError::WsInvalidMessage("missing 'type' field".to_string()),
        );
        return;
    };
    let msg_type = msg_type.to_string();
    let data = value
        .get("data")
        .cloned()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

    match msg_type.as_str() {
        "start_session" => handle_start_session(gateway, connection_id),
        "end_session" => handle_end_session(gateway, connection_id).await,
        "ssh_command" => match serde_json::from_value::<SshCommandRequest>(data) {
            Ok(request) => handle_ssh_command(gateway, connection_id, request),
            Err(e) => send_error(
                gateway,
                connection_id,
                &GatewayError::WsInvalidMessage(format!("invalid ssh_command payload: {}", e)),
            ),
        },
        "scp_transfer" => match serde_json::from_value::<ScpTransferRequest>(data) {
            Ok(request) => handle_scp_transfer(gateway, connection_id, request),
            Err(e) => send_error(
                gateway,
                connection_id,
                &GatewayError::WsInvalidMessage(format!("invalid scp_transfer payload: {}", e)),
            ),
        },
        "ssh_input" => match serde_json::from_value::<SshInputRequest>(data) {
            Ok(request) => handle_ssh_input(gateway, connection_id, request).await,
            Err(e) => send_error(
                gateway,
                connection_id,
                &GatewayError::WsInvalidMessage(format!("invalid ssh_input payload: {}", e)),
            ),
        },
        "get_lock_status" => handle_get_lock_status(gateway, connection_id),
        other => send_error(
            gateway,
            connection_id,
            &GatewayError::WsHandlerNotFound(other.to_string()),
        ),
    }
}

fn send_error(gateway: &Gateway, connection_id: &str, err: &GatewayError) {
    warn!("[{}] {}", connection_id, err);
    gateway
        .connections
        .send_json(connection_id, &OutboundFrame::error(err));
}

/// Broadcast the current lock state to every connection after a transition.
fn broadcast_lock_state(gateway: &Gateway, message: &str) {
    let snapshot = gateway.lock.snapshot();
    gateway.connections.broadcast_json(&OutboundFrame::LockStatus {
        locked: snapshot.active,
        lock_owner: snapshot.owner.clone(),
        message: message.to_string(),
    });
    gateway
        .connections
        .broadcast_json(&OutboundFrame::SessionStatus {
            session_active: snapshot.active,
            session_owner: snapshot.owner,
            message: message.to_string(),
        });
}

fn handle_start_session(gateway: &Gateway, connection_id: &str) {
    match gateway.lock.acquire(connection_id) {
        Ok(()) => {
            info!("[{}] session started", connection_id);
            gateway.connections.send_json(
                connection_id,
                &OutboundFrame::SessionStarted {
                    message: "Session started successfully".to_string(),
                    session_owner: connection_id.to_string(),
                },
            );
            broadcast_lock_state(
                gateway,
                &format!("Session started by client {}", connection_id),
            );
        }
        Err(e) => send_error(gateway, connection_id, &e),
    }
}

async fn handle_end_session(gateway: &Arc<Gateway>, connection_id: &str) {
    if let Err(e) = gateway.lock.require(connection_id) {
        send_error(gateway, connection_id, &e);
        return;
    }

    // Cancel in-flight work first so its terminal frame precedes
    // session_ended; the lock is released regardless of the outcome.
    if gateway.tasks.is_running(connection_id) {
        match gateway
            .tasks
            .cancel(connection_id, gateway.config.cancel_deadline)
            .await
        {
            Ok(()) | Err(GatewayError::TaskNotFound) => {}
            Err(e) => send_error(gateway, connection_id, &e),
        }
    }

    match gateway.lock.release(connection_id) {
        Ok(()) => {
            info!("[{}] session ended", connection_id);
            gateway.connections.send_json(
                connection_id,
                &OutboundFrame::SessionEnded {
                    message: "Session ended successfully".to_string(),
                },
            );
            broadcast_lock_state(gateway, "Session ended");
        }
        Err(e) => send_error(gateway, connection_id, &e),
    }
}

fn handle_ssh_command(gateway: &Arc<Gateway>, connection_id: &str, request: SshCommandRequest) {
    if let Err(e) = gateway.lock.require(connection_id) {
        send_error(gateway, connection_id, &e);
        return;
    }
    if let Err(e) = gateway.registry.resolve_host(&request.server_name) {
        send_error(gateway, connection_id, &e);
        return;
    }

    let timeout = resolve_command_timeout(request.timeout_secs);
    let gw = gateway.clone();
    let conn = connection_id.to_string();

    let started = gateway.tasks.start(connection_id, move |token, task_id| {
        run_command_task(gw, conn, request, timeout, token, task_id)
    });
    if let Err(e) = started {
        send_error(gateway, connection_id, &e);
    }
}

async fn run_command_task(
    gateway: Arc<Gateway>,
    connection_id: String,
    request: SshCommandRequest,
    timeout: Duration,
    token: CancellationToken,
    task_id: String,
) {
    let started_at = chrono::Utc::now().to_rfc3339();
    let runner = Arc::new(SshRunner::new(
        gateway.config.clone(),
        gateway.registry.clone(),
    ));
    gateway
        .runners
        .insert(connection_id.clone(), runner.clone());

    let sink = OutputSink::new(
        gateway.connections.clone(),
        connection_id.clone(),
        token.clone(),
    );
    sink.send_status(&format!("Connecting to {}...", request.server_name));

    let result = async {
        runner.connect(&request.server_name).await?;
        sink.send_status("Connected! Starting interactive shell...");
        runner
            .run_interactive(
                &request.command,
                &request.stop_phrase,
                &sink,
                &token,
                timeout,
            )
            .await
    }
    .await;

    finish_task(
        &gateway,
        &connection_id,
        result,
        "ssh_command",
        &request.server_name,
        &started_at,
        "Command execution completed",
    );

    runner.close().await;
    gateway.runners.remove(&connection_id);
    gateway.tasks.cleanup(&connection_id, &task_id);
}

fn handle_scp_transfer(gateway: &Arc<Gateway>, connection_id: &str, request: ScpTransferRequest) {
    if let Err(e) = gateway.lock.require(connection_id) {
        send_error(gateway, connection_id, &e);
        return;
    }
    let recipe = match gateway.registry.resolve_transfer(&request.transfer_name) {
        Ok(recipe) => recipe.clone(),
        Err(e) => {
            send_error(gateway, connection_id, &e);
            return;
        }
    };

    let gw = gateway.clone();
    let conn = connection_id.to_string();

    let started = gateway.tasks.start(connection_id, move |token, task_id| {
        run_transfer_task(gw, conn, recipe, token, task_id)
    });
    if let Err(e) = started {
        send_error(gateway, connection_id, &e);
    }
}

async fn run_transfer_task(
    gateway: Arc<Gateway>,
    connection_id: String,
    recipe: TransferRecipe,
    token: CancellationToken,
    task_id: String,
) {
    let started_at = chrono::Utc::now().to_rfc3339();
    let runner = Arc::new(SshRunner::new(
        gateway.config.clone(),
        gateway.registry.clone(),
    ));
    gateway
        .runners
        .insert(connection_id.clone(), runner.clone());

    let sink = OutputSink::new(
        gateway.connections.clone(),
        connection_id.clone(),
        token.clone(),
    );
    sink.send_status(&format!("Starting SCP transfer: {}", recipe.name));

    // The source host drives the copy.
    let result = async {
        runner.connect(&recipe.src_alias).await?;
        runner.scp_transfer(&recipe.name, &sink, &token).await
    }
    .await;

    finish_task(
        &gateway,
        &connection_id,
        result,
        "scp_transfer",
        &recipe.name,
        &started_at,
        "SCP transfer completed successfully",
    );

    runner.close().await;
    gateway.runners.remove(&connection_id);
    gateway.tasks.cleanup(&connection_id, &task_id);
}

/// Emit the task's terminal frame and, on success, the completion record.
fn finish_task(
    gateway: &Gateway,
    connection_id: &str,
    result: Result<RunOutcome, GatewayError>,
    operation: &str,
    target: &str,
    started_at: &str,
    complete_message: &str,
) {
    match result {
        Ok(RunOutcome::Completed) => {
            gateway
                .connections
                .send_json(connection_id, &OutboundFrame::complete(complete_message));
            CompletionRecord {
                connection_id: connection_id.to_string(),
                operation: operation.to_string(),
                target: target.to_string(),
                started_at: started_at.to_string(),
                finished_at: chrono::Utc::now().to_rfc3339(),
            }
            .emit();
        }
        Ok(RunOutcome::Cancelled) => {
            send_error(gateway, connection_id, &GatewayError::Cancelled)
        }
        Err(e) => send_error(gateway, connection_id, &e),
    }
}

async fn handle_ssh_input(gateway: &Gateway, connection_id: &str, request: SshInputRequest) {
    let runner = gateway
        .runners
        .get(connection_id)
        .map(|entry| entry.value().clone());

    match runner {
        Some(runner) => {
            if let Err(e) = runner.send_input(&request.input).await {
                send_error(gateway, connection_id, &e);
            }
        }
        None => send_error(
            gateway,
            connection_id,
            &GatewayError::SshCommandFailed("no active SSH session".to_string()),
        ),
    }
}

fn handle_get_lock_status(gateway: &Gateway, connection_id: &str) {
    let snapshot = gateway.lock.snapshot();
    let message = match &snapshot.owner {
        Some(owner) => format!("Locked by {}", owner),
        None => "Available".to_string(),
    };
    gateway.connections.send_json(
        connection_id,
        &OutboundFrame::LockStatus {
            locked: snapshot.active,
            lock_owner: snapshot.owner.clone(),
            message,
        },
    );
}

/// Disconnect teardown. Every step runs even if an earlier one fails.
pub async fn teardown(gateway: &Arc<Gateway>, connection_id: &str) {
    if gateway.tasks.is_running(connection_id) {
        match gateway
            .tasks
            .cancel(connection_id, gateway.config.cancel_deadline)
            .await
        {
            Ok(()) | Err(GatewayError::TaskNotFound) => {}
            Err(e) => error!(
                "[{}] task cancellation during teardown failed: {}",
                connection_id, e
            ),
        }
    }

    if gateway.lock.release_if_owner(connection_id) {
        info!("[{}] session lock released on disconnect", connection_id);
        broadcast_lock_state(gateway, "Session ended (owner disconnected)");
    }

    if let Some((_, runner)) = gateway.runners.remove(connection_id) {
        runner.close().await;
        info!("[{}] SSH runner closed", connection_id);
    }

    gateway.connections.remove(connection_id);
    info!(
        "WebSocket connection torn down: {} ({} still connected)",
        connection_id,
        gateway.connections.connection_count()
    );
}
