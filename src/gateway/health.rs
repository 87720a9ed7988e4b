//! Background host reachability monitor.
//!
//! One process-lifetime task probes every registered host in parallel each
//! probe interval (TCP connect with a bounded timeout). The healthy flag is
//! debounced with hysteresis so a single flap does not spam clients:
//! healthy drops only after `failure_threshold` consecutive failures and
//! recovers only after `success_threshold` consecutive successes.
//!
//! Transitions — and only transitions — invoke the registered listeners,
//! serialized in registration order. A listener that panics is isolated and
//! logged; it never halts the monitor. Probe failures are status updates,
//! never process failures.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, join_all};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::GatewayConfig;
use super::error::GatewayError;
use super::registry::HostConfig;
use super::types::HealthSnapshot;

/// Change listener invoked with `(server_name, new_snapshot)` on every
/// health transition.
pub type HealthListener = Arc<dyn Fn(String, HealthSnapshot) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct HostHealth {
    server_name: String,
    host: String,
    port: u16,
    is_healthy: bool,
    last_checked: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl HostHealth {
    fn new(config: &HostConfig) -> Self {
        Self {
            server_name: config.alias.clone(),
            host: config.host.clone(),
            port: config.port,
            // Optimistic until the first probe round says otherwise.
            is_healthy: true,
            last_checked: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            server_name: self.server_name.clone(),
            host: self.host.clone(),
            port: self.port,
            is_healthy: self.is_healthy,
            last_checked: self.last_checked.map(|t| t.to_rfc3339()),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }
}

/// Record a probe result on a health row. Returns whether the healthy flag
/// transitioned.
fn apply_probe(
    row: &mut HostHealth,
    reachable: bool,
    failure_threshold: u32,
    success_threshold: u32,
) -> bool {
    row.last_checked = Some(Utc::now());

    if reachable {
        row.consecutive_successes += 1;
        row.consecutive_failures = 0;
        if !row.is_healthy && row.consecutive_successes >= success_threshold {
            row.is_healthy = true;
            return true;
        }
    } else {
        row.consecutive_failures += 1;
        row.consecutive_successes = 0;
        if row.is_healthy && row.consecutive_failures >= failure_threshold {
            row.is_healthy = false;
            return true;
        }
    }
    false
}

/// Periodic reachability monitor for the configured host roster.
pub struct HealthMonitor {
    probe_interval: Duration,
    probe_timeout: Duration,
    failure_threshold: u32,
    success_threshold: u32,
    statuses: DashMap<String, HostHealth>,
    listeners: StdMutex<Vec<HealthListener>>,
    cancel: CancellationToken,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: &GatewayConfig, hosts: Vec<HostConfig>) -> Self {
        let statuses = DashMap::new();
        for host in &hosts {
            statuses.insert(host.alias.clone(), HostHealth::new(host));
            info!(
                "[HealthCheck] monitoring {} ({}:{})",
                host.alias, host.host, host.port
            );
        }

        Self {
            probe_interval: config.probe_interval,
            probe_timeout: config.probe_timeout,
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            statuses,
            listeners: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            worker: StdMutex::new(None),
        }
    }

    /// Register a change listener. Listeners registered after start are
    /// picked up from the next transition on.
    pub fn register_listener(&self, listener: HealthListener) {
        self.listeners
            .lock()
            .expect("health listener lock poisoned")
            .push(listener);
    }

    /// Spawn the background probe loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let handle = tokio::spawn(async move { monitor.run().await });
        *self.worker.lock().expect("health worker lock poisoned") = Some(handle);
        info!(
            "[HealthCheck] started (interval {:?}, timeout {:?})",
            self.probe_interval, self.probe_timeout
        );
    }

    /// Stop the monitor. No listener is invoked after this returns.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .worker
            .lock()
            .expect("health worker lock poisoned")
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("[HealthCheck] worker join failed: {}", e);
        }
        info!("[HealthCheck] stopped");
    }

    /// Current snapshot of every monitored host, keyed by alias.
    pub fn snapshot_all(&self) -> BTreeMap<String, HealthSnapshot> {
        self.statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.snapshot()))
            .collect()
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.probe_round().await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.probe_interval) => {}
            }
        }
        debug!("[HealthCheck] probe loop exited");
    }

    /// Probe every host in parallel, then deliver transition notifications
    /// serialized so listeners observe ordered state changes.
    async fn probe_round(&self) {
        let targets: Vec<(String, String, u16)> = self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.host.clone(), entry.port))
            .collect();

        let probes = targets.into_iter().map(|(alias, host, port)| async move {
            let reachable = self.probe(&host, port).await;
            (alias, reachable)
        });
        let results = join_all(probes).await;

        let mut transitions = Vec::new();
        for (alias, reachable) in results {
            if let Some(mut row) = self.statuses.get_mut(&alias) {
                let transitioned = apply_probe(
                    &mut row,
                    reachable,
                    self.failure_threshold,
                    self.success_threshold,
                );
                if transitioned {
                    if row.is_healthy {
                        info!("[HealthCheck] {} recovered", alias);
                    } else {
                        warn!(
                            "[HealthCheck] {} is down ({} consecutive failures)",
                            alias, row.consecutive_failures
                        );
                    }
                    transitions.push((alias.clone(), row.snapshot()));
                }
            }
        }

        for (alias, snapshot) in transitions {
            if self.cancel.is_cancelled() {
                break;
            }
            self.notify(&alias, snapshot).await;
        }
    }

    async fn probe(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.probe_timeout,
                tokio::net::TcpStream::connect((host, port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn notify(&self, server_name: &str, snapshot: HealthSnapshot) {
        let listeners: Vec<HealthListener> = self
            .listeners
            .lock()
            .expect("health listener lock poisoned")
            .clone();

        for listener in listeners {
            let fut = listener(server_name.to_string(), snapshot.clone());
            // Spawning isolates a panicking listener from the monitor.
            if let Err(e) = tokio::spawn(fut).await {
                error!(
                    "{}",
                    GatewayError::HealthCheckFailed(format!(
                        "listener failed for {}: {}",
                        server_name, e
                    ))
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn host_config(alias: &str, host: &str, port: u16) -> HostConfig {
        HostConfig {
            alias: alias.to_string(),
            host: host.to_string(),
            port,
            username: "user".to_string(),
            password: "pass".to_string(),
        }
    }

    fn test_config(interval_ms: u64) -> GatewayConfig {
        GatewayConfig {
            probe_interval: Duration::from_millis(interval_ms),
            probe_timeout: Duration::from_millis(500),
            ..GatewayConfig::default()
        }
    }

    mod hysteresis {
        use super::*;

        fn row() -> HostHealth {
            HostHealth::new(&host_config("h", "127.0.0.1", 22))
        }

        #[test]
        fn test_initially_optimistic() {
            let row = row();
            assert!(row.is_healthy);
            assert_eq!(row.last_checked, None);
        }

        #[test]
        fn test_single_failure_does_not_demote() {
            let mut row = row();
            let transitioned = apply_probe(&mut row, false, 2, 1);

            assert!(!transitioned);
            assert!(row.is_healthy);
            assert_eq!(row.consecutive_failures, 1);
        }

        #[test]
        fn test_demotes_at_failure_threshold() {
            let mut row = row();
            assert!(!apply_probe(&mut row, false, 2, 1));
            assert!(apply_probe(&mut row, false, 2, 1));

            assert!(!row.is_healthy);
            assert_eq!(row.consecutive_failures, 2);
        }

        #[test]
        fn test_transition_fires_only_once() {
            let mut row = row();
            apply_probe(&mut row, false, 2, 1);
            apply_probe(&mut row, false, 2, 1);

            // Staying down is not a transition.
            assert!(!apply_probe(&mut row, false, 2, 1));
            assert_eq!(row.consecutive_failures, 3);
        }

        #[test]
        fn test_success_resets_failure_streak() {
            let mut row = row();
            apply_probe(&mut row, false, 2, 1);
            apply_probe(&mut row, true, 2, 1);
            // The streak restarted, so one more failure is not enough.
            assert!(!apply_probe(&mut row, false, 2, 1));
            assert!(row.is_healthy);
        }

        #[test]
        fn test_recovers_at_success_threshold() {
            let mut row = row();
            apply_probe(&mut row, false, 2, 1);
            apply_probe(&mut row, false, 2, 1);
            assert!(!row.is_healthy);

            assert!(apply_probe(&mut row, true, 2, 1));
            assert!(row.is_healthy);
            assert_eq!(row.consecutive_successes, 1);
        }

        #[test]
        fn test_recovery_needs_consecutive_successes() {
            let mut row = row();
            apply_probe(&mut row, false, 3, 2);
            apply_probe(&mut row, false, 3, 2);
            apply_probe(&mut row, false, 3, 2);
            assert!(!row.is_healthy);

            // One success, then an intervening failure: no resurrection.
            assert!(!apply_probe(&mut row, true, 3, 2));
            assert!(!apply_probe(&mut row, false, 3, 2));
            assert!(!row.is_healthy);

            assert!(!apply_probe(&mut row, true, 3, 2));
            assert!(apply_probe(&mut row, true, 3, 2));
            assert!(row.is_healthy);
        }
    }

    mod monitor {
        use super::*;
        use std::sync::atomic::{AtomicU32, Ordering};

        #[tokio::test]
        async fn test_snapshot_all_before_first_probe() {
            let monitor = HealthMonitor::new(
                &test_config(1000),
                vec![
                    host_config("mdwap1p", "127.0.0.1", 22),
                    host_config("mypap1d", "127.0.0.1", 23),
                ],
            );

            let all = monitor.snapshot_all();
            assert_eq!(all.len(), 2);
            assert!(all["mdwap1p"].is_healthy);
            assert_eq!(all["mdwap1p"].last_checked, None);
        }

        #[tokio::test]
        async fn test_reachable_host_stays_healthy() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            let monitor = Arc::new(HealthMonitor::new(
                &test_config(20),
                vec![host_config("up", "127.0.0.1", port)],
            ));
            monitor.start();

            tokio::time::sleep(Duration::from_millis(120)).await;
            monitor.stop().await;

            let snapshot = &monitor.snapshot_all()["up"];
            assert!(snapshot.is_healthy);
            assert!(snapshot.consecutive_successes >= 1);
            assert!(snapshot.last_checked.is_some());
            drop(listener);
        }

        #[tokio::test]
        async fn test_unreachable_host_demoted_and_listener_notified_once() {
            // Grab a port with nothing listening on it.
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let monitor = Arc::new(HealthMonitor::new(
                &test_config(20),
                vec![host_config("down", "127.0.0.1", port)],
            ));

            let transitions = Arc::new(AtomicU32::new(0));
            let seen = transitions.clone();
            monitor.register_listener(Arc::new(move |server_name, snapshot| {
                let seen = seen.clone();
                Box::pin(async move {
                    assert_eq!(server_name, "down");
                    assert!(!snapshot.is_healthy);
                    seen.fetch_add(1, Ordering::SeqCst);
                })
            }));

            monitor.start();
            tokio::time::sleep(Duration::from_millis(200)).await;
            monitor.stop().await;

            let snapshot = &monitor.snapshot_all()["down"];
            assert!(!snapshot.is_healthy);
            assert!(snapshot.consecutive_failures >= 2);
            // The down transition is delivered exactly once.
            assert_eq!(transitions.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_panicking_listener_does_not_halt_monitor() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let monitor = Arc::new(HealthMonitor::new(
                &test_config(20),
                vec![host_config("down", "127.0.0.1", port)],
            ));

            let called = Arc::new(AtomicU32::new(0));
            monitor.register_listener(Arc::new(|_, _| {
                Box::pin(async move { panic!("listener bug") })
            }));
            let called_clone = called.clone();
            monitor.register_listener(Arc::new(move |_, _| {
                let called = called_clone.clone();
                Box::pin(async move {
                    called.fetch_add(1, Ordering::SeqCst);
                })
            }));

            monitor.start();
            tokio::time::sleep(Duration::from_millis(200)).await;
            monitor.stop().await;

            // The second listener still observed the transition.
            assert_eq!(called.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_no_listener_calls_after_stop() {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let monitor = Arc::new(HealthMonitor::new(
                &test_config(10),
                vec![host_config("down", "127.0.0.1", port)],
            ));

            let calls = Arc::new(AtomicU32::new(0));
            let calls_clone = calls.clone();
            monitor.register_listener(Arc::new(move |_, _| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            }));

            monitor.start();
            tokio::time::sleep(Duration::from_millis(100)).await;
            monitor.stop().await;

            let after_stop = calls.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(calls.load(Ordering::SeqCst), after_stop);
        }
    }
}
