//! Live WebSocket connection registry and outbound fan-out.
//!
//! Each connection registers an unbounded queue whose consumer (a writer
//! task owning the socket's sink half) drains frames in order, so outbound
//! frames on one connection are strictly ordered. Sends never suspend the
//! caller; a send to a vanished connection simply reports failure so the
//! caller can react (cancel a task, skip a broadcast target).

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::OutboundFrame;

/// Registry of live connections keyed by connection-id.
#[derive(Default)]
pub struct ConnectionMap {
    connections: DashMap<String, UnboundedSender<String>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue.
    pub fn register(&self, connection_id: &str, sender: UnboundedSender<String>) {
        self.connections.insert(connection_id.to_string(), sender);
        debug!("WebSocket connection registered: {}", connection_id);
    }

    /// Remove a connection. The writer task ends once its queue is dropped.
    pub fn remove(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            debug!("WebSocket connection removed: {}", connection_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a JSON frame for one connection. Returns `false` when the
    /// connection is gone or its writer has shut down.
    pub fn send_json<T: Serialize>(&self, connection_id: &str, frame: &T) -> bool {
        let Some(sender) = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
        else {
            warn!("Connection not found: {}", connection_id);
            return false;
        };

        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize frame for {}: {}", connection_id, e);
                return false;
            }
        };

        if sender.send(text).is_err() {
            warn!("Writer gone for connection {}, dropping it", connection_id);
            self.connections.remove(connection_id);
            return false;
        }
        true
    }

    /// Queue a JSON frame for every live connection, best-effort. A failed
    /// send removes that connection and does not affect the others.
    /// Returns the number of connections reached.
    pub fn broadcast_json<T: Serialize>(&self, frame: &T) -> usize {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize broadcast frame: {}", e);
                return 0;
            }
        };

        let targets: Vec<(String, UnboundedSender<String>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (connection_id, sender) in targets {
            if sender.send(text.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(
                    "Broadcast send failed for {}, dropping connection",
                    connection_id
                );
                self.connections.remove(&connection_id);
            }
        }
        delivered
    }
}

/// Output sink bound to one connection's WebSocket.
///
/// Shell and transfer tasks stream batches through this sink. When the
/// connection disappears mid-stream the sink cancels the owning task's
/// token so the remote channel is torn down promptly.
pub struct OutputSink {
    connections: std::sync::Arc<ConnectionMap>,
    connection_id: String,
    cancel_token: CancellationToken,
}

impl OutputSink {
    pub fn new(
        connections: std::sync::Arc<ConnectionMap>,
        connection_id: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            connections,
            connection_id: connection_id.into(),
            cancel_token,
        }
    }

    /// Emit one `output` frame. A failed write signals cancellation.
    pub fn send(&self, data: &str) -> bool {
        let delivered = self
            .connections
            .send_json(&self.connection_id, &OutboundFrame::output(data));
        if !delivered {
            self.cancel_token.cancel();
        }
        delivered
    }

    /// Emit a `status` progress frame; failures are non-fatal here.
    pub fn send_status(&self, message: &str) {
        self.connections
            .send_json(&self.connection_id, &OutboundFrame::status(message));
    }
}
