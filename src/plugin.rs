//! Plugin process supervision.
//!
//! A [`PluginSession`] owns one plugin subprocess (or, via
//! [`PluginSession::attach`], a connection to an already running plugin) and
//! the channel to it. The connection itself is owned by a single actor task:
//! callers submit commands over an `mpsc` queue and the actor writes them to
//! the plugin strictly one at a time, in arrival order, delivering each reply
//! on a `oneshot`.
//!
//! A caller that gives up (cancellation or deadline) returns immediately. The
//! actor keeps waiting for the in-flight response, forwards `stop` if the
//! plugin advertised support for it, and discards the late response.
//!
//! The session follows an explicit lifecycle:
//!
//! ```text
//! Unstarted -> Launching -> Running -> Configured
//!      \____________\___________\__________\______-> Terminated
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeOptions;
use crate::error::BridgeError;
use crate::logging::PluginLogGate;
use crate::protocol::{
    read_frame, write_frame, Capabilities, GetSchemaResult, Handshake, Method, RemoteError,
    Request, Response,
};
use crate::schema::ProviderSchema;
use crate::types::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};

/// Lifecycle state of a plugin session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing has been started yet.
    Unstarted,
    /// The process is starting and has not completed its handshake.
    Launching,
    /// The handshake completed; the plugin accepts calls.
    Running,
    /// The plugin accepted its provider configuration.
    Configured,
    /// The session is over, by request or because the plugin went away.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Configured => "configured",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Record of a single state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the transition.
    pub from: SessionState,
    /// State after the transition.
    pub to: SessionState,
    /// When the transition happened.
    pub at: Instant,
    /// Why it happened.
    pub reason: Option<String>,
}

/// Rejected lifecycle transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The state machine does not allow this transition.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },
    /// The session is already in the requested state.
    #[error("session is already {0}")]
    AlreadyInState(SessionState),
}

/// Tracks the session state and enforces valid transitions.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: SessionState,
    history: Vec<Transition>,
}

impl Lifecycle {
    /// A lifecycle in [`SessionState::Unstarted`].
    pub fn new() -> Self {
        Self {
            state: SessionState::Unstarted,
            history: Vec::new(),
        }
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true if moving from the current state to `to` is allowed.
    ///
    /// Any live state may terminate; otherwise states only move forward.
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self.state, to),
            (Unstarted, Launching)
                | (Launching, Running)
                | (Running, Configured)
                | (Unstarted | Launching | Running | Configured, Terminated)
        )
    }

    /// Move to `to`, recording the transition.
    pub fn transition(
        &mut self,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<(), LifecycleError> {
        if self.state == to {
            return Err(LifecycleError::AlreadyInState(to));
        }
        if !self.can_transition(to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.history.push(Transition {
            from: self.state,
            to,
            at: Instant::now(),
            reason,
        });
        self.state = to;
        Ok(())
    }

    /// Every transition so far, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation and deadline carried by every bridged operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with no deadline and a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the operation after `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Fail the operation at `deadline`. An earlier deadline already set wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Use `cancel` as the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once the operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` unless the context is cancelled or its deadline passes
    /// first. `what` names the operation in the resulting error.
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T, BridgeError>
    where
        F: Future<Output = Result<T, BridgeError>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BridgeError::Cancelled(format!(
                "{} was cancelled; its outcome is unknown",
                what
            ))),
            _ = deadline => Err(BridgeError::Timeout(format!(
                "{} did not complete before its deadline",
                what
            ))),
            result = fut => result,
        }
    }
}

/// Locate `<prefix>-<module>` on `search_path`, or on `PATH` when the search
/// path is empty. The first match wins.
pub fn resolve_binary(
    prefix: &str,
    module: &str,
    search_path: &[PathBuf],
) -> Result<PathBuf, BridgeError> {
    let name = format!("{}-{}{}", prefix, module, std::env::consts::EXE_SUFFIX);
    let dirs: Vec<PathBuf> = if search_path.is_empty() {
        std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect())
            .unwrap_or_default()
    } else {
        search_path.to_vec()
    };
    dirs.iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            BridgeError::Launch(format!(
                "plugin binary '{}' not found in {} search location(s)",
                name,
                dirs.len()
            ))
        })
}

/// Owns the plugin child process; kills it if dropped without being reaped.
#[derive(Debug)]
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    /// Wait up to `grace` for the child to exit on its own, then kill it.
    async fn reap(&mut self, module: &str, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(plugin = module, %status, "Plugin exited"),
            Ok(Err(e)) => warn!(plugin = module, error = %e, "Failed to wait for plugin"),
            Err(_) => {
                warn!(plugin = module, grace = ?grace, "Plugin did not exit in time, killing it");
                if let Err(e) = child.kill().await {
                    warn!(plugin = module, error = %e, "Failed to kill plugin");
                }
            },
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// One queued call for the actor.
struct Call {
    method: Method,
    params: serde_json::Value,
    reply: oneshot::Sender<Result<Response, BridgeError>>,
}

/// State shared between a session handle and its actor.
#[derive(Debug)]
struct Shared {
    module: String,
    lifecycle: Mutex<Lifecycle>,
    cancel_supported: AtomicBool,
    /// Cancelled by `terminate`; the actor stops waiting on the plugin.
    closing: CancellationToken,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        self.lifecycle().state()
    }

    fn terminate(&self, reason: &str) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state() != SessionState::Terminated {
            let _ = lifecycle.transition(SessionState::Terminated, Some(reason.to_string()));
            info!(plugin = %self.module, reason, "Plugin session terminated");
        }
    }

    fn crash(&self) -> BridgeError {
        BridgeError::SubprocessCrash(format!("plugin '{}' is not running", self.module))
    }
}

/// A live connection to one plugin.
#[derive(Debug)]
pub struct PluginSession {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Call>,
    child: tokio::sync::Mutex<Option<ChildGuard>>,
    pid: Option<u32>,
    binary: Option<PathBuf>,
    schema: ProviderSchema,
    capabilities: Capabilities,
    call_timeout: Option<Duration>,
    shutdown_grace: Duration,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Call({})", self.method.as_str())
    }
}

impl PluginSession {
    /// Start the plugin binary for `module` and complete the handshake.
    ///
    /// A missing binary is a [`BridgeError::Launch`], an unsupported
    /// handshake version a [`BridgeError::ProtocolMismatch`]. Either way the
    /// child is killed before returning.
    pub async fn launch(
        module: &str,
        options: &BridgeOptions,
        logs: PluginLogGate,
    ) -> Result<Self, BridgeError> {
        let mut lifecycle = Lifecycle::new();
        advance(&mut lifecycle, SessionState::Launching, "launch requested")?;

        let binary = resolve_binary(&options.plugin_prefix, module, &options.search_path)?;
        debug!(plugin = module, binary = %binary.display(), "Launching plugin");

        let mut child = Command::new(&binary)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::Launch(format!("failed to start {}: {}", binary.display(), e))
            })?;
        let pid = child.id();
        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, module.to_string(), logs));
        }
        let mut guard = ChildGuard::new(child);

        let handshake = match stdout {
            Some(stdout) => read_handshake(stdout, module, options.handshake_timeout).await,
            None => Err(BridgeError::Launch("plugin stdout was not captured".into())),
        };
        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(e) => {
                guard.reap(module, Duration::ZERO).await;
                return Err(e);
            },
        };

        let stream = match TcpStream::connect(handshake.address).await {
            Ok(stream) => stream,
            Err(e) => {
                guard.reap(module, Duration::ZERO).await;
                return Err(BridgeError::Launch(format!(
                    "failed to connect to plugin at {}: {}",
                    handshake.address, e
                )));
            },
        };

        let mut session = Self::start(module, stream, lifecycle, options).await?;
        session.pid = pid;
        session.binary = Some(binary);
        *session.child.get_mut() = Some(guard);
        info!(plugin = module, pid = ?pid, address = %handshake.address, "Plugin launched");
        Ok(session)
    }

    /// Connect to a plugin that is already listening on `address`.
    ///
    /// No process is owned; [`PluginSession::terminate`] only closes the
    /// channel after asking the plugin to shut down.
    pub async fn attach(
        module: &str,
        address: SocketAddr,
        options: &BridgeOptions,
    ) -> Result<Self, BridgeError> {
        let mut lifecycle = Lifecycle::new();
        advance(&mut lifecycle, SessionState::Launching, "attach requested")?;
        let stream = TcpStream::connect(address).await.map_err(|e| {
            BridgeError::Launch(format!("failed to connect to plugin at {}: {}", address, e))
        })?;
        Self::start(module, stream, lifecycle, options).await
    }

    async fn start(
        module: &str,
        stream: TcpStream,
        mut lifecycle: Lifecycle,
        options: &BridgeOptions,
    ) -> Result<Self, BridgeError> {
        advance(&mut lifecycle, SessionState::Running, "handshake complete")?;

        let (read, write) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(16);
        tokio::spawn(read_responses(
            BufReader::new(read),
            module.to_string(),
            frames_tx,
        ));

        let shared = Arc::new(Shared {
            module: module.to_string(),
            lifecycle: Mutex::new(lifecycle),
            cancel_supported: AtomicBool::new(false),
            closing: CancellationToken::new(),
        });
        let (commands, commands_rx) = mpsc::channel(64);
        tokio::spawn(run_actor(commands_rx, write, frames_rx, Arc::clone(&shared)));

        let mut session = Self {
            shared,
            commands,
            child: tokio::sync::Mutex::new(None),
            pid: None,
            binary: None,
            schema: ProviderSchema::default(),
            capabilities: Capabilities::default(),
            call_timeout: options.call_timeout,
            shutdown_grace: options.shutdown_grace,
        };

        let ctx = CallContext::new().with_timeout(options.handshake_timeout);
        let negotiated: GetSchemaResult =
            match session.call_typed(&ctx, Method::GetSchema, &()).await {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    session.terminate().await;
                    return Err(BridgeError::Launch(format!(
                        "failed to fetch schema from plugin '{}': {}",
                        module, e
                    )));
                },
            };
        session
            .shared
            .cancel_supported
            .store(negotiated.capabilities.cancel, Ordering::SeqCst);
        session.schema = negotiated.schema;
        session.capabilities = negotiated.capabilities;
        debug!(
            plugin = module,
            resources = session.schema.resources.len(),
            data_sources = session.schema.data_sources.len(),
            cancel = session.capabilities.cancel,
            "Plugin schema negotiated"
        );
        Ok(session)
    }

    /// The module name.
    pub fn module(&self) -> &str {
        &self.shared.module
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Every lifecycle transition so far.
    pub fn history(&self) -> Vec<Transition> {
        self.shared.lifecycle().history().to_vec()
    }

    /// The process id of the plugin, when this session launched it.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The resolved plugin binary, when this session launched it.
    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// The schema negotiated during the handshake.
    pub fn schema(&self) -> &ProviderSchema {
        &self.schema
    }

    /// Optional features the plugin supports.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Record that the plugin accepted its configuration.
    pub fn mark_configured(&self) -> Result<(), BridgeError> {
        let mut lifecycle = self.shared.lifecycle();
        match lifecycle.state() {
            SessionState::Configured => Ok(()),
            SessionState::Terminated => Err(self.shared.crash()),
            _ => lifecycle
                .transition(SessionState::Configured, Some("configure succeeded".into()))
                .map_err(|e| BridgeError::Configuration(e.to_string())),
        }
    }

    /// Send one request and wait for the plugin's answer.
    ///
    /// The outer error covers the channel (crash, cancellation, deadline);
    /// the inner one is a failure the plugin reported. Waiting for a slot in
    /// the queue counts against the same deadline as waiting for the answer.
    pub async fn request(
        &self,
        ctx: &CallContext,
        method: Method,
        params: serde_json::Value,
    ) -> Result<Result<serde_json::Value, RemoteError>, BridgeError> {
        if self.state() == SessionState::Terminated {
            return Err(self.shared.crash());
        }

        let ctx = match self.call_timeout {
            Some(timeout) => ctx.clone().with_timeout(timeout),
            None => ctx.clone(),
        };
        let response = ctx
            .run(method.as_str(), async {
                let (reply, reply_rx) = oneshot::channel();
                self.commands
                    .send(Call {
                        method,
                        params,
                        reply,
                    })
                    .await
                    .map_err(|_| self.shared.crash())?;
                reply_rx.await.map_err(|_| self.shared.crash())?
            })
            .await?;

        Ok(match response.error {
            Some(error) => Err(error),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        })
    }

    /// Like [`PluginSession::request`], with plugin failures as
    /// [`BridgeError::Plugin`].
    pub async fn call(
        &self,
        ctx: &CallContext,
        method: Method,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        self.request(ctx, method, params)
            .await?
            .map_err(|e| BridgeError::Plugin(e.message))
    }

    /// Call with typed parameters and result.
    pub async fn call_typed<P, R>(
        &self,
        ctx: &CallContext,
        method: Method,
        params: &P,
    ) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(ctx, method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Shut the plugin down: ask it to exit, close the channel, give it the
    /// grace period, then kill and reap it.
    ///
    /// Bounded by the grace period even when the plugin stopped answering
    /// and the queue is full.
    pub async fn terminate(&self) {
        if self.state() != SessionState::Terminated {
            let ctx = CallContext::new().with_timeout(self.shutdown_grace);
            if let Err(e) = self
                .call(&ctx, Method::Shutdown, serde_json::Value::Null)
                .await
            {
                debug!(plugin = %self.shared.module, error = %e, "Shutdown request failed");
            }
        }
        self.shared.terminate("terminate requested");
        self.shared.closing.cancel();

        if let Some(mut guard) = self.child.lock().await.take() {
            guard.reap(&self.shared.module, self.shutdown_grace).await;
        }
    }
}

fn advance(
    lifecycle: &mut Lifecycle,
    to: SessionState,
    reason: &str,
) -> Result<(), BridgeError> {
    lifecycle
        .transition(to, Some(reason.to_string()))
        .map_err(|e| BridgeError::Launch(e.to_string()))
}

async fn read_handshake(
    stdout: ChildStdout,
    module: &str,
    timeout: Duration,
) -> Result<Handshake, BridgeError> {
    let mut stdout = BufReader::new(stdout);
    let mut line = String::new();
    let read = tokio::time::timeout(timeout, stdout.read_line(&mut line)).await;
    let handshake = match read {
        Err(_) => Err(BridgeError::Launch(format!(
            "plugin '{}' did not complete its handshake within {:?}",
            module, timeout
        ))),
        Ok(Err(e)) => Err(BridgeError::Launch(format!(
            "failed to read handshake from plugin '{}': {}",
            module, e
        ))),
        Ok(Ok(0)) => Err(BridgeError::Launch(format!(
            "plugin '{}' exited before its handshake",
            module
        ))),
        Ok(Ok(_)) => Handshake::parse(&line),
    }?;

    // Anything printed after the handshake is noise; keep the pipe drained.
    let module = module.to_string();
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match stdout.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => debug!(plugin = %module, line = line.trim_end(), "Plugin stdout"),
            }
        }
    });
    Ok(handshake)
}

async fn forward_stderr(stderr: ChildStderr, module: String, logs: PluginLogGate) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => logs.forward(&module, &line),
            Err(e) => {
                debug!(plugin = %module, error = %e, "Plugin stderr closed");
                break;
            },
        }
    }
}

async fn read_responses<R>(mut reader: R, module: String, frames: mpsc::Sender<Response>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Some(response)) => {
                if frames.send(response).await.is_err() {
                    break;
                }
            },
            Ok(None) => {
                debug!(plugin = %module, "Plugin closed the connection");
                break;
            },
            Err(e) => {
                warn!(plugin = %module, error = %e, "Unreadable frame from plugin");
                break;
            },
        }
    }
}

async fn run_actor(
    mut commands: mpsc::Receiver<Call>,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Response>,
    shared: Arc<Shared>,
) {
    let mut next_id: u64 = 0;
    let reason = loop {
        let command = tokio::select! {
            biased;
            _ = shared.closing.cancelled() => break "terminate requested",
            command = commands.recv() => command,
            frame = frames.recv() => match frame {
                Some(stale) => {
                    debug!(plugin = %shared.module, id = stale.id, "Discarding stale response");
                    continue;
                },
                None => break "plugin closed the connection",
            },
        };
        let Some(Call {
            method,
            params,
            mut reply,
        }) = command
        else {
            break "channel closed";
        };
        if reply.is_closed() {
            debug!(plugin = %shared.module, method = method.as_str(), "Caller gone, skipping call");
            continue;
        }

        next_id += 1;
        let id = next_id;
        let request = Request { id, method, params };
        if let Err(e) = write_frame(&mut writer, &request).await {
            warn!(plugin = %shared.module, error = %e, "Failed to write to plugin");
            let _ = reply.send(Err(shared.crash()));
            break "write to plugin failed";
        }

        let mut abandoned = false;
        let response = loop {
            tokio::select! {
                _ = shared.closing.cancelled() => break None,
                frame = frames.recv() => match frame {
                    Some(response) if response.id == id => break Some(response),
                    Some(stale) => {
                        debug!(plugin = %shared.module, id = stale.id, "Discarding stale response");
                    },
                    None => break None,
                },
                _ = reply.closed(), if !abandoned => {
                    abandoned = true;
                    debug!(plugin = %shared.module, method = method.as_str(), "Caller abandoned call");
                    if shared.cancel_supported.load(Ordering::SeqCst) {
                        next_id += 1;
                        let stop = Request {
                            id: next_id,
                            method: Method::Stop,
                            params: serde_json::Value::Null,
                        };
                        if let Err(e) = write_frame(&mut writer, &stop).await {
                            debug!(plugin = %shared.module, error = %e, "Failed to forward stop");
                        }
                    }
                },
            }
        };

        match response {
            Some(response) => {
                let _ = reply.send(Ok(response));
            },
            None if shared.closing.is_cancelled() => {
                let _ = reply.send(Err(shared.crash()));
                break "terminate requested";
            },
            None => {
                // Mark terminated before replying so callers observe the state.
                shared.terminate("plugin closed the connection");
                let _ = reply.send(Err(shared.crash()));
                break "plugin closed the connection";
            },
        }
    };

    shared.terminate(reason);
    commands.close();
    while let Some(Call { reply, .. }) = commands.recv().await {
        let _ = reply.send(Err(shared.crash()));
    }
}
