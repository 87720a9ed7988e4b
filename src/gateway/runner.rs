//! Per-connection SSH runner.
//!
//! Owns at most one SSH transport and walks a small state machine:
//! idle → connected ⇄ (streaming | transferring) → connected → closed.
//! Any error in a non-idle state fast-paths to closed; `close` itself is
//! idempotent and every operation after it fails with `not-connected`.
//!
//! The runner is only ever driven by its owning connection's task (the
//! task registry guarantees one task at a time), so interior state lives
//! behind short-lived locks rather than a message loop.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::AuthChain;
use super::config::{GatewayConfig, MAX_RETRY_DELAY};
use super::connections::OutputSink;
use super::error::GatewayError;
use super::registry::{HostConfig, HostRegistry, TransferRecipe};
use super::session::GatewayClientHandler;
use super::stream::{LineAccumulator, OutputThrottle};

/// Runner lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    Idle,
    Connected,
    Streaming,
    Transferring,
    Closed,
}

/// Non-error outcomes of a streaming operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Bytes of remote stderr retained for transfer failure reports.
const STDERR_TAIL_BYTES: usize = 2048;

/// Settle time for the login banner after opening a PTY shell.
const SHELL_SETTLE: Duration = Duration::from_millis(300);

/// Drain window for remaining output after the stop phrase is seen.
const SHELL_DRAIN: Duration = Duration::from_millis(300);

/// Write handle for sending input to the live shell channel.
///
/// Wraps `russh::ChannelWriteHalf` so input can be written without holding
/// a lock on the read half that the streaming loop owns.
pub struct ShellWriter {
    write_half: russh::ChannelWriteHalf<client::Msg>,
}

impl ShellWriter {
    fn new(write_half: russh::ChannelWriteHalf<client::Msg>) -> Self {
        Self { write_half }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), GatewayError> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| GatewayError::SshCommandFailed(format!("failed to write to shell: {}", e)))
    }

    pub async fn close(&self) -> Result<(), GatewayError> {
        self.write_half.close().await.map_err(|e| {
            GatewayError::SshCommandFailed(format!("failed to close shell channel: {}", e))
        })
    }
}

/// Per-connection SSH facade: connect, stream an interactive command,
/// drive a server-to-server transfer, close.
pub struct SshRunner {
    config: GatewayConfig,
    registry: Arc<HostRegistry>,
    phase: StdMutex<RunnerPhase>,
    handle: Mutex<Option<client::Handle<GatewayClientHandler>>>,
    writer: Mutex<Option<ShellWriter>>,
}

impl SshRunner {
    pub fn new(config: GatewayConfig, registry: Arc<HostRegistry>) -> Self {
        Self {
            config,
            registry,
            phase: StdMutex::new(RunnerPhase::Idle),
            handle: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> RunnerPhase {
        *self.phase.lock().expect("runner phase lock poisoned")
    }

    fn set_phase(&self, phase: RunnerPhase) {
        *self.phase.lock().expect("runner phase lock poisoned") = phase;
    }

    fn require_phase(&self, expected: RunnerPhase) -> Result<(), GatewayError> {
        let current = self.phase();
        if current == expected {
            return Ok(());
        }
        match current {
            RunnerPhase::Idle | RunnerPhase::Closed => Err(GatewayError::NotConnected),
            other => Err(GatewayError::SshCommandFailed(format!(
                "operation invalid while runner is {:?}",
                other
            ))),
        }
    }

    /// Resolve `alias` and establish an authenticated transport.
    ///
    /// Transient network failures are retried with exponential backoff and
    /// jitter; authentication failures are never retried.
    pub async fn connect(&self, alias: &str) -> Result<(), GatewayError> {
        self.require_phase(RunnerPhase::Idle)?;
        let host = self.registry.resolve_host(alias)?.clone();

        info!(
            "Connecting to {}@{}:{} (alias {})",
            host.username, host.host, host.port, host.alias
        );

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.config.max_retries as usize)
            .with_jitter();

        let handle = (|| async { self.connect_once(&host).await })
            .retry(backoff)
            .when(|e: &GatewayError| e.is_transient())
            .notify(|err: &GatewayError, dur: Duration| {
                warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
            })
            .await?;

        *self.handle.lock().await = Some(handle);
        self.set_phase(RunnerPhase::Connected);
        info!("SSH transport established for {}", host.alias);
        Ok(())
    }

    async fn connect_once(
        &self,
        host: &HostConfig,
    ) -> Result<client::Handle<GatewayClientHandler>, GatewayError> {
        let config = build_client_config();

        let connect = client::connect(config, (host.host.as_str(), host.port), GatewayClientHandler);
        let mut handle = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| GatewayError::SshConnectTimeout(self.config.connect_timeout.as_secs()))?
            .map_err(|e| GatewayError::SshConnectFailed(e.to_string()))?;

        let chain = AuthChain::for_password(host.password.clone());
        tokio::time::timeout(
            self.config.auth_timeout,
            chain.authenticate(&mut handle, &host.username),
        )
        .await
        .map_err(|_| GatewayError::SshConnectTimeout(self.config.auth_timeout.as_secs()))??;

        Ok(handle)
    }

    /// Run `command` in an interactive PTY shell, streaming batched output
    /// to `sink` until the stop phrase appears, the peer closes the
    /// channel, the cancel token fires, or `timeout` elapses.
    pub async fn run_interactive(
        &self,
        command: &str,
        stop_phrase: &str,
        sink: &OutputSink,
        cancel_token: &CancellationToken,
        timeout: Duration,
    ) -> Result<RunOutcome, GatewayError> {
        self.require_phase(RunnerPhase::Connected)?;
        self.set_phase(RunnerPhase::Streaming);

        let result = self
            .stream_command(command, stop_phrase, sink, cancel_token, timeout)
            .await;

        *self.writer.lock().await = None;
        match &result {
            Ok(_) => self.set_phase(RunnerPhase::Connected),
            Err(_) => self.close().await,
        }
        result
    }

    async fn stream_command(
        &self,
        command: &str,
        stop_phrase: &str,
        sink: &OutputSink,
        cancel_token: &CancellationToken,
        timeout: Duration,
    ) -> Result<RunOutcome, GatewayError> {
        let channel = {
            let guard = self.handle.lock().await;
            let handle = guard.as_ref().ok_or(GatewayError::NotConnected)?;
            handle.channel_open_session().await.map_err(|e| {
                GatewayError::SshCommandFailed(format!("failed to open channel: {}", e))
            })?
        };

        channel
            .request_pty(false, "xterm", 120, 40, 0, 0, &[])
            .await
            .map_err(|e| GatewayError::SshCommandFailed(format!("failed to request pty: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| GatewayError::SshCommandFailed(format!("failed to start shell: {}", e)))?;
        info!("Interactive shell opened");

        let (mut read_half, write_half) = channel.split();

        // Let the login banner land, then discard it.
        let settle = tokio::time::sleep(SHELL_SETTLE);
        tokio::pin!(settle);
        loop {
            tokio::select! {
                _ = &mut settle => break,
                msg = read_half.wait() => {
                    if msg.is_none() {
                        return Err(GatewayError::SshCommandFailed(
                            "channel closed before command was sent".to_string(),
                        ));
                    }
                }
            }
        }

        let writer = ShellWriter::new(write_half);
        let command_line = format!("{}\n", command);
        writer.write(command_line.as_bytes()).await?;
        info!("Command sent to interactive shell");
        *self.writer.lock().await = Some(writer);

        sink.send(&format!("$ {}\n", command));

        let mut acc = LineAccumulator::new();
        let mut throttle = OutputThrottle::new(self.config.flush_interval, self.config.flush_bytes);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    // Buffered output is dropped on cancellation.
                    self.close_shell_channel().await;
                    info!("Interactive shell cancelled");
                    return Ok(RunOutcome::Cancelled);
                }

                _ = &mut deadline => {
                    self.close_shell_channel().await;
                    return Err(GatewayError::SshCommandFailed(format!(
                        "command timed out after {}s",
                        timeout.as_secs()
                    )));
                }

                _ = ticker.tick() => {
                    if throttle.interval_elapsed()
                        && let Some(batch) = acc.take_flush()
                    {
                        sink.send(&batch);
                        throttle.mark_flushed();
                    }
                }

                msg = read_half.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let text = String::from_utf8_lossy(&data);
                        if acc.push(&text, stop_phrase) {
                            if let Some(batch) = acc.finish() {
                                sink.send(&batch);
                            }
                            info!("Stop phrase detected");
                            sink.send(&format!("\n[INFO] stop phrase detected -> {}\n", stop_phrase));
                            self.finish_shell(&mut read_half, sink).await;
                            return Ok(RunOutcome::Completed);
                        }
                        if throttle.size_exceeded(acc.pending_len())
                            && let Some(batch) = acc.take_flush()
                        {
                            sink.send(&batch);
                            throttle.mark_flushed();
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        // PTY sessions fold stderr into the main stream;
                        // handle it anyway for servers that do not.
                        let text = String::from_utf8_lossy(&data);
                        acc.push(&text, stop_phrase);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Shell exit status: {}", exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        if let Some(batch) = acc.finish() {
                            sink.send(&batch);
                        }
                        warn!("Server closed channel");
                        sink.send("[WARN] server closed channel\n");
                        self.close_shell_channel().await;
                        return Ok(RunOutcome::Completed);
                    }
                    Some(_) => {}
                }
            }
        }
    }

    /// Stop-phrase epilogue: ask the shell to exit, forward whatever output
    /// trickles in during the drain window, and close the channel.
    async fn finish_shell(&self, read_half: &mut russh::ChannelReadHalf, sink: &OutputSink) {
        if let Some(writer) = self.writer.lock().await.as_ref() {
            let _ = writer.write(b"exit\n").await;
        }

        let drain = tokio::time::sleep(SHELL_DRAIN);
        tokio::pin!(drain);
        let mut tail = String::new();
        loop {
            tokio::select! {
                _ = &mut drain => break,
                msg = read_half.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        tail.push_str(&String::from_utf8_lossy(&data));
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
        if !tail.is_empty() {
            sink.send(&tail);
        }

        self.close_shell_channel().await;
        info!("Interactive shell closed (stop phrase)");
    }

    async fn close_shell_channel(&self) {
        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
    }

    /// Drive a server-to-server copy from the connected source host,
    /// streaming progress lines to `sink`.
    pub async fn scp_transfer(
        &self,
        transfer_name: &str,
        sink: &OutputSink,
        cancel_token: &CancellationToken,
    ) -> Result<RunOutcome, GatewayError> {
        self.require_phase(RunnerPhase::Connected)?;

        let recipe = self.registry.resolve_transfer(transfer_name)?.clone();
        let dst = self.registry.resolve_host(&recipe.dst_alias)?.clone();

        self.set_phase(RunnerPhase::Transferring);
        let result = self.drive_transfer(&recipe, &dst, sink, cancel_token).await;
        match &result {
            Ok(_) => self.set_phase(RunnerPhase::Connected),
            Err(_) => self.close().await,
        }
        result
    }

    async fn drive_transfer(
        &self,
        recipe: &TransferRecipe,
        dst: &HostConfig,
        sink: &OutputSink,
        cancel_token: &CancellationToken,
    ) -> Result<RunOutcome, GatewayError> {
        let command = build_scp_command(recipe, dst);
        info!(
            "[SCP] {}: {} -> {}@{}:{}",
            recipe.name, recipe.src_path, dst.username, dst.host, recipe.dst_path
        );

        let mut channel = {
            let guard = self.handle.lock().await;
            let handle = guard.as_ref().ok_or(GatewayError::NotConnected)?;
            handle.channel_open_session().await.map_err(|e| {
                GatewayError::ScpFailed {
                    exit_code: -1,
                    stderr_tail: format!("failed to open channel: {}", e),
                }
            })?
        };

        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| GatewayError::ScpFailed {
                exit_code: -1,
                stderr_tail: format!("failed to start transfer: {}", e),
            })?;

        let mut acc = LineAccumulator::new();
        let mut throttle = OutputThrottle::new(self.config.flush_interval, self.config.flush_bytes);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(self.config.scp_timeout);
        tokio::pin!(deadline);

        let mut stderr_tail = String::new();
        let mut exit_code: Option<i32> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    let _ = channel.close().await;
                    info!("SCP transfer cancelled");
                    return Ok(RunOutcome::Cancelled);
                }

                _ = &mut deadline => {
                    let _ = channel.close().await;
                    return Err(GatewayError::ScpFailed {
                        exit_code: -1,
                        stderr_tail: format!(
                            "transfer timed out after {}s",
                            self.config.scp_timeout.as_secs()
                        ),
                    });
                }

                _ = ticker.tick() => {
                    if throttle.interval_elapsed()
                        && let Some(batch) = acc.take_flush()
                    {
                        sink.send(&batch);
                        throttle.mark_flushed();
                    }
                }

                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let text = String::from_utf8_lossy(&data);
                        acc.push(&text, "");
                        if throttle.size_exceeded(acc.pending_len())
                            && let Some(batch) = acc.take_flush()
                        {
                            sink.send(&batch);
                            throttle.mark_flushed();
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        let text = String::from_utf8_lossy(&data);
                        append_tail(&mut stderr_tail, &text);
                        acc.push(&text, "");
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }

        let _ = channel.close().await;
        if let Some(batch) = acc.finish() {
            sink.send(&batch);
        }

        match exit_code {
            Some(0) => {
                info!("[SCP] {} completed", recipe.name);
                Ok(RunOutcome::Completed)
            }
            code => Err(GatewayError::ScpFailed {
                exit_code: code.unwrap_or(-1),
                stderr_tail: stderr_tail.trim_end().to_string(),
            }),
        }
    }

    /// Forward raw input to the live interactive shell.
    pub async fn send_input(&self, text: &str) -> Result<(), GatewayError> {
        let guard = self.writer.lock().await;
        let writer = guard.as_ref().ok_or_else(|| {
            GatewayError::SshCommandFailed("no interactive shell is open".to_string())
        })?;
        writer.write(text.as_bytes()).await
    }

    /// Tear down the transport. Idempotent; a second close is a no-op.
    pub async fn close(&self) {
        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "session closed", "en")
                .await
            {
                warn!("Error during disconnect: {}", e);
            }
        }
        self.set_phase(RunnerPhase::Closed);
    }
}

fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        // Sessions stay open across long quiet stretches; keepalives detect
        // dead peers instead of an inactivity timeout.
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Command executed on the source host to drive the copy. The destination
/// password goes to sshpass on the remote side and is never logged here.
fn build_scp_command(recipe: &TransferRecipe, dst: &HostConfig) -> String {
    format!(
        "sshpass -p '{}' scp -P {} -o StrictHostKeyChecking=no -r {} {}@{}:{}",
        dst.password, dst.port, recipe.src_path, dst.username, dst.host, recipe.dst_path
    )
}

fn append_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}
