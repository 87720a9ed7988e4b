//! Per-connection cancellable task registry.
//!
//! Each connection may have at most one in-flight unit of work. The
//! registry hands the work a fresh cancellation token (consulted at every
//! suspension point) and a completion signal backed by a `watch` channel,
//! so cancellation can await actual termination with a bounded deadline.
//!
//! A task that finishes between the cancel call and the await still
//! deregisters cleanly: the completion signal is observed first, then the
//! handle is removed by id so a replacement task registered in the window
//! is never evicted by mistake.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Finished,
}

/// Handle to one in-flight task.
pub struct TaskHandle {
    pub task_id: String,
    pub started_at: String,
    pub cancel_token: CancellationToken,
    /// Sender half kept alive so the receiver never observes a closed
    /// channel while the task runs.
    #[allow(dead_code)]
    status_tx: watch::Sender<TaskStatus>,
    status_rx: watch::Receiver<TaskStatus>,
}

/// Registry mapping connection-id to at most one live task.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` as this connection's task.
    ///
    /// The closure receives the task's cancellation token and its task-id
    /// (for [`TaskRegistry::cleanup`] on graceful completion). Fails with
    /// `task-already-running` while a live handle exists for the
    /// connection. The handle is registered before this returns.
    pub fn start<F, Fut>(&self, connection_id: &str, work: F) -> Result<(), GatewayError>
    where
        F: FnOnce(CancellationToken, String) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let cancel_token = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(TaskStatus::Running);

        let handle = Arc::new(TaskHandle {
            task_id: task_id.clone(),
            started_at: chrono::Utc::now().to_rfc3339(),
            cancel_token: cancel_token.clone(),
            status_tx: status_tx.clone(),
            status_rx,
        });

        let fut = work(cancel_token, task_id.clone());

        match self.tasks.entry(connection_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get().status_rx.borrow() == TaskStatus::Running {
                    return Err(GatewayError::TaskAlreadyRunning);
                }
                entry.insert(handle);
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
            }
        }

        let join = tokio::spawn(fut);
        tokio::spawn(async move {
            if let Err(e) = join.await {
                warn!("Task {} aborted abnormally: {}", task_id, e);
            }
            let _ = status_tx.send(TaskStatus::Finished);
        });

        Ok(())
    }

    /// Whether a live task exists for the connection.
    pub fn is_running(&self, connection_id: &str) -> bool {
        self.tasks
            .get(connection_id)
            .map(|entry| *entry.status_rx.borrow() == TaskStatus::Running)
            .unwrap_or(false)
    }

    /// Signal the connection's task and await its completion up to
    /// `deadline`. On timeout the handle stays registered for a later
    /// retry or surrender at process exit.
    pub async fn cancel(
        &self,
        connection_id: &str,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        let handle = self
            .tasks
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or(GatewayError::TaskNotFound)?;

        handle.cancel_token.cancel();

        let mut rx = handle.status_rx.clone();
        let wait = tokio::time::timeout(deadline, async move {
            loop {
                if *rx.borrow() == TaskStatus::Finished {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    if *rx.borrow() == TaskStatus::Finished {
                        return Ok(());
                    }
                    return Err(GatewayError::TaskCancelFailed(
                        "completion signal lost".to_string(),
                    ));
                }
            }
        })
        .await;

        match wait {
            Ok(Ok(())) => {
                self.tasks
                    .remove_if(connection_id, |_, stored| stored.task_id == handle.task_id);
                info!(
                    "Task {} (started {}) cancelled for connection {}",
                    handle.task_id, handle.started_at, connection_id
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::TaskCancelTimeout(deadline.as_secs())),
        }
    }

    /// Deregister without cancelling; used by the task itself on graceful
    /// completion. A newer task under the same connection-id is left alone.
    pub fn cleanup(&self, connection_id: &str, task_id: &str) {
        self.tasks
            .remove_if(connection_id, |_, stored| stored.task_id == task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_start_registers_running_task() {
        let registry = TaskRegistry::new();

        registry
            .start("conn-1", |token, _| async move {
                token.cancelled().await;
            })
            .unwrap();

        assert!(registry.is_running("conn-1"));
        registry.cancel("conn-1", Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let registry = TaskRegistry::new();

        registry
            .start("conn-1", |token, _| async move {
                token.cancelled().await;
            })
            .unwrap();

        let err = registry
            .start("conn-1", |_, _| async {})
            .unwrap_err();
        assert_eq!(err.code(), 50010);

        registry.cancel("conn-1", Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_connections_run_independently() {
        let registry = TaskRegistry::new();

        registry
            .start("conn-a", |token, _| async move { token.cancelled().await })
            .unwrap();
        registry
            .start("conn-b", |token, _| async move { token.cancelled().await })
            .unwrap();

        assert!(registry.is_running("conn-a"));
        assert!(registry.is_running("conn-b"));

        registry.cancel("conn-a", Duration::from_secs(1)).await.unwrap();
        assert!(!registry.is_running("conn-a"));
        assert!(registry.is_running("conn-b"));

        registry.cancel("conn-b", Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_absent_task_fails() {
        let registry = TaskRegistry::new();
        let err = registry
            .cancel("ghost", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 50011);
    }

    #[tokio::test]
    async fn test_cancel_signals_token_and_deregisters() {
        let registry = TaskRegistry::new();
        let observed = Arc::new(AtomicBool::new(false));
        let observed_clone = observed.clone();

        registry
            .start("conn-1", move |token, _| async move {
                token.cancelled().await;
                observed_clone.store(true, Ordering::SeqCst);
            })
            .unwrap();

        registry.cancel("conn-1", Duration::from_secs(1)).await.unwrap();

        assert!(observed.load(Ordering::SeqCst));
        assert!(!registry.is_running("conn-1"));
    }

    #[tokio::test]
    async fn test_cancel_times_out_on_unresponsive_task() {
        let registry = TaskRegistry::new();

        registry
            .start("conn-1", |_, _| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
            })
            .unwrap();

        let err = registry
            .cancel("conn-1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 50012);

        // The zombie handle stays registered for retry or surrender.
        assert!(registry.is_running("conn-1"));
    }

    #[tokio::test]
    async fn test_cancel_after_natural_completion_still_deregisters() {
        let registry = TaskRegistry::new();

        registry.start("conn-1", |_, _| async {}).unwrap();

        // Let the task and its completion monitor run to the end without
        // the task calling cleanup itself.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_running("conn-1"));

        let result = registry.cancel("conn-1", Duration::from_secs(1)).await;
        assert!(result.is_ok());
        assert!(registry.tasks.get("conn-1").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_deregisters_only_matching_task() {
        let registry = TaskRegistry::new();
        let (id_tx, id_rx) = tokio::sync::oneshot::channel();

        registry
            .start("conn-1", move |_, task_id| async move {
                let _ = id_tx.send(task_id);
            })
            .unwrap();

        let task_id = id_rx.await.unwrap();
        registry.cleanup("conn-1", "some-other-id");
        assert!(registry.tasks.get("conn-1").is_some());

        registry.cleanup("conn-1", &task_id);
        assert!(registry.tasks.get("conn-1").is_none());
    }

    #[tokio::test]
    async fn test_start_allowed_after_cancelled_task_completes() {
        let registry = TaskRegistry::new();

        registry
            .start("conn-1", |token, _| async move { token.cancelled().await })
            .unwrap();
        registry.cancel("conn-1", Duration::from_secs(1)).await.unwrap();

        // The cancelled task's completion precedes the next start.
        registry
            .start("conn-1", |token, _| async move { token.cancelled().await })
            .unwrap();
        assert!(registry.is_running("conn-1"));

        registry.cancel("conn-1", Duration::from_secs(1)).await.unwrap();
    }
}
