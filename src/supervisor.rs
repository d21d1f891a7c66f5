//! One supervisor per running tool: owns the OS process, the channel to it and
//! the protocol that correlates calls over that channel.
//!
//! ```text
//! NotStarted → Starting → Ready ⇄ Activating → Active → Deactivating → Ready
//!                 │
//!                 └→ Failed (handshake timeout)      any state → Exited
//! ```
//! `Exited` and `Failed` are terminal; a restart needs a new supervisor.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
};
use tracing::{debug, info, warn};

use tool_plugin::{
    Message, MessageType, Protocol, ToolHostError,
    channel::{CHANNEL_ENV, ChannelListener, ChannelSender, TOKEN_ENV},
    error::Result,
    logging::{LOG_DIR_ENV, LOG_LEVEL_ENV},
    runtime::{API_TIMEOUT_ENV, TOOL_ENTRY_ENV, TOOL_ID_ENV, TOOL_ROOT_ENV},
};

use crate::config::ToolHostConfig;
use crate::events::{ApiCall, LifecycleEvent, ToolEvent};
use crate::tool::Tool;

/// How long `stop()` waits for the killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ToolState {
    NotStarted,
    Starting,
    Ready,
    Activating,
    Active,
    Deactivating,
    Exited,
    Failed,
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolState::Exited | ToolState::Failed)
    }

    /// States in which the channel is up and calls may be issued.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ToolState::Ready | ToolState::Activating | ToolState::Active | ToolState::Deactivating
        )
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub api_call_timeout: Duration,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl From<&ToolHostConfig> for SupervisorOptions {
    fn from(config: &ToolHostConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            handshake_timeout: config.handshake_timeout(),
            api_call_timeout: config.api_call_timeout(),
            log_level: config.log_level.clone(),
            log_dir: config.log_dir.clone(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&ToolHostConfig::default())
    }
}

/// Receiving ends of the supervisor's outbound queues.
#[derive(Debug)]
pub struct SupervisorEvents {
    pub lifecycle: UnboundedReceiver<LifecycleEvent>,
    pub api_calls: UnboundedReceiver<ApiCall>,
    pub tool_events: UnboundedReceiver<ToolEvent>,
}

#[derive(Clone)]
struct Outbound {
    lifecycle: UnboundedSender<LifecycleEvent>,
    api_calls: UnboundedSender<ApiCall>,
    tool_events: UnboundedSender<ToolEvent>,
}

#[derive(Debug)]
pub struct ToolProcess {
    tool: Arc<Tool>,
    options: SupervisorOptions,
    state: Arc<Mutex<ToolState>>,
    protocol: Arc<Protocol>,
    sender: Mutex<Option<ChannelSender>>,
    kill: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    exited: watch::Receiver<bool>,
    exited_tx: Mutex<Option<watch::Sender<bool>>>,
    stopping: Arc<AtomicBool>,
    outbound: Outbound,
    /// Serializes activate/deactivate so repeated calls see settled state.
    transition: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Outbound")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ToolProcess {
    pub fn new(tool: Tool, options: SupervisorOptions) -> (Self, SupervisorEvents) {
        let (lifecycle_tx, lifecycle) = mpsc::unbounded_channel();
        let (api_tx, api_calls) = mpsc::unbounded_channel();
        let (events_tx, tool_events) = mpsc::unbounded_channel();
        let (exited_tx, exited) = watch::channel(false);

        let process = Self {
            tool: Arc::new(tool),
            protocol: Arc::new(Protocol::new(options.request_timeout)),
            options,
            state: Arc::new(Mutex::new(ToolState::NotStarted)),
            sender: Mutex::new(None),
            kill: Arc::new(Mutex::new(None)),
            exited,
            exited_tx: Mutex::new(Some(exited_tx)),
            stopping: Arc::new(AtomicBool::new(false)),
            outbound: Outbound { lifecycle: lifecycle_tx, api_calls: api_tx, tool_events: events_tx },
            transition: tokio::sync::Mutex::new(()),
        };
        (process, SupervisorEvents { lifecycle, api_calls, tool_events })
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn tool_id(&self) -> &str {
        &self.tool.id
    }

    pub fn state(&self) -> ToolState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ToolState::Active
    }

    pub fn pending_requests(&self) -> usize {
        self.protocol.pending_count()
    }

    fn set_state(&self, next: ToolState) {
        set_state(&self.state, &self.tool.id, next);
    }

    /// Move to `next` only if nothing else (an exit, usually) got there first.
    fn transition_from(&self, expected: ToolState, next: ToolState) -> bool {
        let mut state = lock(&self.state);
        if *state == expected {
            debug!(tool_id = %self.tool.id, from = %*state, to = %next, "state change");
            *state = next;
            true
        } else {
            false
        }
    }

    /// A start that cannot finish leaves the supervisor `Failed`.
    fn fail(&self, err: ToolHostError) -> ToolHostError {
        warn!(tool_id = %self.tool.id, "start failed: {err}");
        self.set_state(ToolState::Failed);
        err
    }

    // ── start ───────────────────────────────────────────────────────

    /// Spawn the worker and wait for its `ready` handshake.
    pub async fn start(&self) -> Result<()> {
        if !self.transition_from(ToolState::NotStarted, ToolState::Starting) {
            return Err(ToolHostError::AlreadyStarted(self.tool.id.clone()));
        }
        let tool_id = self.tool.id.clone();

        let listener = ChannelListener::bind().await.map_err(|err| self.fail(err))?;
        let address = listener.address().map_err(|err| self.fail(err))?;

        let mut command = Command::new(&self.tool.entry);
        command
            .current_dir(&self.tool.root)
            .env(TOOL_ID_ENV, &tool_id)
            .env(TOOL_ENTRY_ENV, &self.tool.entry)
            .env(TOOL_ROOT_ENV, &self.tool.root)
            .env(CHANNEL_ENV, &address)
            .env(TOKEN_ENV, listener.token())
            .env(API_TIMEOUT_ENV, self.options.api_call_timeout.as_millis().to_string())
            .env(LOG_LEVEL_ENV, &self.options.log_level)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.options.log_dir {
            command.env(LOG_DIR_ENV, dir);
        }

        let mut child = command.spawn().map_err(|err| {
            self.fail(ToolHostError::Spawn(tool_id.clone(), format!("{}: {err}", self.tool.entry.display())))
        })?;
        info!(%tool_id, pid = ?child.id(), "worker spawned");

        // ── diagnostics ──────────────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            forward_output(tool_id.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(tool_id.clone(), stderr, true);
        }

        // ── exit watcher ─────────────────────────────────────────────
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        *lock(&self.kill) = Some(kill_tx);
        let exited_tx = lock(&self.exited_tx).take();
        {
            let tool_id = tool_id.clone();
            let state = self.state.clone();
            let protocol = self.protocol.clone();
            let stopping = self.stopping.clone();
            let lifecycle = self.outbound.lifecycle.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = &mut kill_rx => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let code = status.ok().and_then(|s| s.code());
                let expected = stopping.load(Ordering::SeqCst);
                {
                    let mut current = lock(&state);
                    if *current != ToolState::Failed {
                        *current = ToolState::Exited;
                    }
                }
                let rejected = protocol.dispose();
                if expected {
                    info!(%tool_id, ?code, "worker stopped");
                } else {
                    warn!(%tool_id, ?code, rejected, "worker exited unexpectedly");
                }
                if let Some(tx) = exited_tx {
                    let _ = tx.send(true);
                }
                let _ = lifecycle.send(LifecycleEvent::Exited { code, expected });
            });
        }

        // ── handshake ────────────────────────────────────────────────
        let mut exited = self.exited.clone();
        let handshake = async {
            let (sender, mut inbound) = match listener.accept(tool_id.clone()).await {
                Ok(channel) => channel,
                Err(err) => return Err(err),
            };
            loop {
                match inbound.recv().await {
                    Some(message) if message.is_ready_event() => return Ok((sender, inbound)),
                    Some(message) => debug!(%tool_id, kind = %message.kind, "ignoring message before ready"),
                    None => return Err(ToolHostError::ChannelClosed(tool_id.clone())),
                }
            }
        };

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.options.handshake_timeout, handshake) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ToolHostError::HandshakeTimeout(
                    tool_id.clone(),
                    self.options.handshake_timeout.as_millis() as u64,
                )),
            },
            _ = exited.wait_for(|gone| *gone) => Err(ToolHostError::ChannelClosed(format!(
                "{tool_id} exited before signalling ready"
            ))),
        };

        let (sender, inbound) = match outcome {
            Ok(channel) => channel,
            Err(err) => {
                warn!(%tool_id, "handshake failed: {err}");
                if !self.state().is_terminal() {
                    self.set_state(ToolState::Failed);
                }
                self.kill_process();
                self.protocol.dispose();
                return Err(err);
            }
        };

        *lock(&self.sender) = Some(sender);
        if !self.transition_from(ToolState::Starting, ToolState::Ready) {
            return Err(ToolHostError::NotReady(tool_id, self.state().to_string()));
        }
        self.spawn_pump(inbound);
        info!(%tool_id, "worker ready");
        Ok(())
    }

    /// Route everything the worker sends after the handshake.
    ///
    /// A worker whose channel is gone cannot be driven any more, so when the
    /// channel closes under a live process the process is killed and the
    /// regular exit path reports it.
    fn spawn_pump(&self, mut inbound: UnboundedReceiver<Message>) {
        let tool_id = self.tool.id.clone();
        let protocol = self.protocol.clone();
        let outbound = self.outbound.clone();
        let kill = self.kill.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match message.kind {
                    MessageType::Response | MessageType::Error => {
                        protocol.handle_response(message);
                    }
                    MessageType::ApiCall => {
                        let _ = outbound.api_calls.send(ApiCall { tool_id: tool_id.clone(), message });
                    }
                    MessageType::Event if message.is_ready_event() => {
                        debug!(%tool_id, "duplicate ready ignored");
                    }
                    MessageType::Event => {
                        let _ = outbound.tool_events.send(ToolEvent {
                            tool_id: tool_id.clone(),
                            name: message.method_name().to_string(),
                            data: message.args.into_iter().next().unwrap_or(Value::Null),
                        });
                    }
                    MessageType::Request | MessageType::Activate | MessageType::Deactivate => {
                        warn!(%tool_id, kind = %message.kind, "workers may not send {}", message.kind);
                    }
                }
            }
            debug!(%tool_id, "channel closed");
            protocol.dispose();
            if let Some(kill) = lock(&kill).take() {
                if kill.send(()).is_ok() {
                    warn!(%tool_id, "channel lost while the worker was running, killing it");
                }
            }
        });
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Activate the tool. A second call while active sends nothing.
    pub async fn activate(&self) -> Result<()> {
        let _serial = self.transition.lock().await;
        match self.state() {
            ToolState::Active => return Ok(()),
            ToolState::Ready => {}
            other => return Err(ToolHostError::NotReady(self.tool.id.clone(), other.to_string())),
        }
        self.set_state(ToolState::Activating);

        match self.request(MessageType::Activate, "activate", vec![]).await {
            Ok(_) => {
                if self.transition_from(ToolState::Activating, ToolState::Active) {
                    info!(tool_id = %self.tool.id, "tool activated");
                    let _ = self.outbound.lifecycle.send(LifecycleEvent::Activated);
                    Ok(())
                } else {
                    Err(ToolHostError::NotReady(self.tool.id.clone(), self.state().to_string()))
                }
            }
            Err(err) => {
                self.transition_from(ToolState::Activating, ToolState::Ready);
                warn!(tool_id = %self.tool.id, "activation failed: {err}");
                let _ = self.outbound.lifecycle.send(LifecycleEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Deactivate the tool. Always ends inactive; a failing worker-side hook
    /// is logged and reported, not returned.
    pub async fn deactivate(&self) -> Result<()> {
        let _serial = self.transition.lock().await;
        if self.state() != ToolState::Active {
            return Ok(());
        }
        self.set_state(ToolState::Deactivating);

        if let Err(err) = self.request(MessageType::Deactivate, "deactivate", vec![]).await {
            warn!(tool_id = %self.tool.id, "deactivation failed: {err}");
            let _ = self.outbound.lifecycle.send(LifecycleEvent::Error(err.to_string()));
        }
        self.transition_from(ToolState::Deactivating, ToolState::Ready);
        info!(tool_id = %self.tool.id, "tool deactivated");
        let _ = self.outbound.lifecycle.send(LifecycleEvent::Deactivated);
        Ok(())
    }

    /// Invoke a method the tool exports.
    pub async fn call_api(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let state = self.state();
        if !state.is_running() {
            return Err(ToolHostError::NotReady(self.tool.id.clone(), state.to_string()));
        }
        self.request(MessageType::Request, method, args).await
    }

    /// Raw pass-through, used to answer calls the worker initiated.
    pub fn send_message(&self, message: Message) -> Result<()> {
        self.channel()?.send(message)
    }

    /// Deactivate if needed, then kill the process and fail anything pending.
    pub async fn stop(&self) -> Result<()> {
        if self.state() == ToolState::NotStarted {
            self.set_state(ToolState::Exited);
            return Ok(());
        }
        if self.is_active() {
            let _ = self.deactivate().await;
        }

        self.stopping.store(true, Ordering::SeqCst);
        lock(&self.sender).take();
        self.kill_process();

        let mut exited = self.exited.clone();
        if tokio::time::timeout(REAP_TIMEOUT, exited.wait_for(|gone| *gone)).await.is_err() {
            warn!(tool_id = %self.tool.id, "worker was not reaped in time");
        }
        self.protocol.dispose();
        Ok(())
    }

    fn kill_process(&self) {
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
    }

    fn channel(&self) -> Result<ChannelSender> {
        lock(&self.sender)
            .clone()
            .ok_or_else(|| ToolHostError::NotReady(self.tool.id.clone(), self.state().to_string()))
    }

    async fn request(&self, kind: MessageType, method: &str, args: Vec<Value>) -> Result<Value> {
        let sender = self.channel()?;
        self.protocol
            .send(kind, &self.tool.id, method, args, move |message| sender.send(message))
            .await
    }
}

fn set_state(state: &Mutex<ToolState>, tool_id: &str, next: ToolState) {
    let mut current = lock(state);
    debug!(%tool_id, from = %*current, to = %next, "state change");
    *current = next;
}

/// Copy a worker's stdout/stderr into the host log, line by line.
fn forward_output<R>(tool_id: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if is_stderr {
                warn!(target: "toolhost::worker", %tool_id, "{line}");
            } else {
                info!(target: "toolhost::worker", %tool_id, "{line}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn options(handshake_ms: u64) -> SupervisorOptions {
        SupervisorOptions {
            handshake_timeout: Duration::from_millis(handshake_ms),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn states_render_snake_case() {
        assert_eq!(ToolState::NotStarted.to_string(), "not_started");
        assert!(ToolState::Failed.is_terminal());
        assert!(ToolState::Active.is_running());
        assert!(!ToolState::Starting.is_running());
    }

    #[tokio::test]
    async fn calls_before_start_are_refused() {
        let (process, _events) = ToolProcess::new(Tool::new("t1", "/nonexistent", "/"), options(100));
        let err = process.call_api("echo", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Tool t1 is not ready (state: not_started)");
        assert!(process.activate().await.is_err());
        // deactivating something that is not active is a no-op
        process.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_marks_failed() {
        let tmp = TempDir::new().unwrap();
        let (process, _events) =
            ToolProcess::new(Tool::new("t1", tmp.path().join("missing"), tmp.path()), options(100));
        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ToolHostError::Spawn(..)));
        assert_eq!(process.state(), ToolState::Failed);

        let err = process.start().await.unwrap_err();
        assert!(matches!(err, ToolHostError::AlreadyStarted(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_worker_fails_the_handshake() {
        let tmp = TempDir::new().unwrap();
        let entry = script(tmp.path(), "sleep 10");
        let (process, mut events) = ToolProcess::new(Tool::new("t1", entry, tmp.path()), options(200));

        let err = process.start().await.unwrap_err();
        assert_eq!(err, ToolHostError::HandshakeTimeout("t1".into(), 200));
        assert_eq!(process.state(), ToolState::Failed);

        // the killed process is still reported
        let exited = events.lifecycle.recv().await.unwrap();
        assert!(matches!(exited, LifecycleEvent::Exited { expected: false, .. }));
        assert_eq!(process.state(), ToolState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_ends_the_handshake() {
        let tmp = TempDir::new().unwrap();
        let entry = script(tmp.path(), "echo booting; exit 3");
        let (process, mut events) = ToolProcess::new(Tool::new("t1", entry, tmp.path()), options(5_000));

        let err = process.start().await.unwrap_err();
        assert!(err.to_string().contains("exited before signalling ready"));
        assert_eq!(process.state(), ToolState::Exited);
        assert_eq!(
            events.lifecycle.recv().await.unwrap(),
            LifecycleEvent::Exited { code: Some(3), expected: false }
        );
    }

    /// Connects over bash's /dev/tcp, handshakes, then misbehaves on the wire.
    #[cfg(unix)]
    fn raw_worker(dir: &Path, after_ready: &str) -> PathBuf {
        script(
            dir,
            &format!(
                r#"exec 3<>"/dev/tcp/${{TOOL_HOST_CHANNEL%:*}}/${{TOOL_HOST_CHANNEL##*:}}"
printf '%s\n' "$TOOL_HOST_TOKEN" >&3
printf '{{"type":"EVENT","id":"r1","toolId":"%s","method":"ready","timestamp":0}}\n' "$TOOL_ID" >&3
{after_ready}"#
            ),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn undecodable_line_keeps_the_tool_running() {
        let tmp = TempDir::new().unwrap();
        let entry = raw_worker(tmp.path(), r"printf '\xff\xfe\n' >&3; sleep 30");
        let (process, _events) = ToolProcess::new(Tool::new("t1", entry, tmp.path()), options(5_000));

        process.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(process.state(), ToolState::Ready);
        assert_eq!(process.pending_requests(), 0);
        process.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lost_channel_kills_the_worker() {
        let tmp = TempDir::new().unwrap();
        let entry = raw_worker(tmp.path(), "sleep 0.2; exec 3>&-; sleep 30");
        let (process, mut events) = ToolProcess::new(Tool::new("t1", entry, tmp.path()), options(5_000));

        process.start().await.unwrap();
        let exited = tokio::time::timeout(Duration::from_secs(5), events.lifecycle.recv())
            .await
            .expect("worker was left running")
            .unwrap();
        assert!(matches!(exited, LifecycleEvent::Exited { expected: false, .. }), "{exited:?}");
        assert_eq!(process.state(), ToolState::Exited);

        let err = process.call_api("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, ToolHostError::NotReady(..)), "{err}");
    }
}
