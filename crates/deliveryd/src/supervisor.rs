//! Supervision of external build and deploy processes.
//!
//! A supervised process resolves exactly once to an [`Outcome`]. Two triggers
//! compete: a startup marker seen in the output, and process exit. The first
//! terminal event wins and later events are ignored, so a runtime error that
//! races a marker can never flip an already-decided result.
//!
//! Output is forwarded line by line into a [`ProgressLog`] while the process
//! runs. Ordering holds within stdout and within stderr, not across them.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use delivery_core::command::CommandLine;
use delivery_core::marker::{MarkerMatch, StartupMarker};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress_log::ProgressLog;

/// Bound on draining stdout/stderr after the process exits.
///
/// Pipes normally close with the process, but a grandchild that inherited
/// them can keep them open indefinitely.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL when a run times out.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The executable is not installed or not on `PATH`. Not retryable.
    #[error("required tool not found: {program}")]
    ToolingUnavailable { program: String },
    #[error("working directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: CommandLine,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(command: CommandLine, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Raw events produced while a process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Marker(MarkerMatch),
    /// Exit code, or `None` when terminated by a signal.
    Exited(Option<i32>),
    /// OS-level failure while waiting on or reading from the process.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    ExitCode(i32),
    Signalled,
    /// Exited 0 but the expected marker never appeared.
    AmbiguousCompletion,
    ProcessError(String),
    TimedOut,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExitCode(code) => write!(f, "process exited with code {code}"),
            Self::Signalled => f.write_str("process was terminated by a signal"),
            Self::AmbiguousCompletion => {
                f.write_str("process exited cleanly but the startup marker never appeared")
            }
            Self::ProcessError(msg) => write!(f, "process error: {msg}"),
            Self::TimedOut => f.write_str("process timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Carries the marker match when one was expected.
    Success(Option<MarkerMatch>),
    Failure(FailureReason),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Success(Some(hit)) => hit.port,
            _ => None,
        }
    }
}

/// Folds process events into a single immutable outcome.
#[derive(Debug, Clone)]
pub struct Resolution {
    expects_marker: bool,
    outcome: Option<Outcome>,
}

impl Resolution {
    pub fn new(expects_marker: bool) -> Self {
        Self {
            expects_marker,
            outcome: None,
        }
    }

    /// Apply an event. Returns the outcome once one is decided.
    pub fn observe(&mut self, event: ProcessEvent) -> Option<&Outcome> {
        if self.outcome.is_none() {
            self.outcome = match event {
                ProcessEvent::Marker(hit) if self.expects_marker => {
                    Some(Outcome::Success(Some(hit)))
                }
                ProcessEvent::Marker(_) => None,
                ProcessEvent::Exited(Some(0)) if self.expects_marker => {
                    Some(Outcome::Failure(FailureReason::AmbiguousCompletion))
                }
                ProcessEvent::Exited(Some(0)) => Some(Outcome::Success(None)),
                ProcessEvent::Exited(Some(code)) => {
                    Some(Outcome::Failure(FailureReason::ExitCode(code)))
                }
                ProcessEvent::Exited(None) => Some(Outcome::Failure(FailureReason::Signalled)),
                ProcessEvent::Error(msg) => {
                    Some(Outcome::Failure(FailureReason::ProcessError(msg)))
                }
            };
        }
        self.outcome.as_ref()
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

type SharedLog = Arc<RwLock<Arc<dyn ProgressLog>>>;

/// Control surface for a running process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    program: String,
    exit: watch::Receiver<Option<ExitInfo>>,
    terminate: CancellationToken,
    force: CancellationToken,
    output: SharedLog,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("program", &self.program)
            .field("exit", &*self.exit.borrow())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send SIGTERM to the process group. No-op once the process has exited.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// Send SIGKILL to the process group.
    pub fn force_kill(&self) {
        self.force.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait until the process has exited.
    pub async fn exited(&self) -> Option<ExitInfo> {
        let mut rx = self.exit.clone();
        let result = rx.wait_for(Option::is_some).await.map(|info| *info);
        result.ok().flatten()
    }

    /// Wait at most `limit` for exit. Returns whether the process exited.
    pub async fn wait_for_exit(&self, limit: Duration) -> bool {
        timeout(limit, self.exited()).await.is_ok()
    }

    /// Send further output to a different log.
    ///
    /// Long-running deployments outlive the execution that started them; the
    /// execution's log is sealed when it finishes.
    pub fn redirect_output(&self, log: Arc<dyn ProgressLog>) {
        *self.output.write().unwrap_or_else(PoisonError::into_inner) = log;
    }
}

/// A spawned process together with its event stream.
#[derive(Debug)]
pub struct SupervisedProcess {
    handle: ProcessHandle,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    resolution: Resolution,
}

impl SupervisedProcess {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Resolve the outcome. Calling again returns the same outcome.
    pub async fn outcome(&mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.resolution.outcome() {
                return outcome.clone();
            }
            let event = self.events.recv().await.unwrap_or_else(|| {
                ProcessEvent::Error("process event stream closed".to_string())
            });
            self.resolution.observe(event);
        }
    }

    /// Resolve within `limit`, terminating the process on timeout.
    /// A zero limit waits indefinitely.
    pub async fn outcome_within(&mut self, limit: Duration) -> Outcome {
        if limit.is_zero() {
            return self.outcome().await;
        }
        if let Ok(outcome) = timeout(limit, self.outcome()).await {
            return outcome;
        }
        warn!(
            program = %self.handle.program,
            pid = ?self.handle.pid,
            timeout_sec = limit.as_secs(),
            "process timed out; terminating"
        );
        self.shutdown(TERMINATE_GRACE).await;
        let failed = Outcome::Failure(FailureReason::TimedOut);
        self.resolution.outcome = Some(failed.clone());
        failed
    }

    /// Terminate and wait for exit, escalating to SIGKILL after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.handle.terminate();
        if !self.handle.wait_for_exit(grace).await {
            warn!(
                program = %self.handle.program,
                pid = ?self.handle.pid,
                "process ignored SIGTERM; killing"
            );
            self.handle.force_kill();
            self.handle.wait_for_exit(grace).await;
        }
    }
}

/// Spawn a process and start forwarding its output into `log`.
///
/// When `marker` is set, the process succeeds on the first matching line and
/// a clean exit without it is ambiguous. Without a marker, exit 0 succeeds.
pub fn spawn(
    spec: &ProcessSpec,
    log: Arc<dyn ProgressLog>,
    marker: Option<StartupMarker>,
) -> Result<SupervisedProcess> {
    if !spec.cwd.is_dir() {
        return Err(SupervisorError::MissingDirectory(spec.cwd.clone()));
    }

    let program = spec.command.program.clone();
    let mut cmd = Command::new(&program);
    cmd.args(&spec.command.args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(
        command = %spec.command.display(),
        cwd = %spec.cwd.display(),
        "spawning supervised process"
    );

    let mut child = cmd.group_spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SupervisorError::ToolingUnavailable {
                program: program.clone(),
            }
        } else {
            SupervisorError::Spawn {
                program: program.clone(),
                source: e,
            }
        }
    })?;
    let pid = child.id();
    info!(program = %program, pid = ?pid, "process started");

    let output: SharedLog = Arc::new(RwLock::new(log));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let terminate = CancellationToken::new();
    let force = CancellationToken::new();

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.inner().stdout.take() {
        readers.push(spawn_reader(
            "stdout",
            stdout,
            Arc::clone(&output),
            marker.clone(),
            events_tx.clone(),
        ));
    }
    if let Some(stderr) = child.inner().stderr.take() {
        readers.push(spawn_reader(
            "stderr",
            stderr,
            Arc::clone(&output),
            marker.clone(),
            events_tx.clone(),
        ));
    }

    tokio::spawn(wait_for_child(
        child,
        program.clone(),
        readers,
        events_tx,
        exit_tx,
        terminate.clone(),
        force.clone(),
    ));

    Ok(SupervisedProcess {
        handle: ProcessHandle {
            pid,
            program,
            exit: exit_rx,
            terminate,
            force,
            output,
        },
        events: events_rx,
        resolution: Resolution::new(marker.is_some()),
    })
}

/// Run a process to completion without a marker, bounded by `limit`.
pub async fn run(spec: &ProcessSpec, log: Arc<dyn ProgressLog>, limit: Duration) -> Result<Outcome> {
    let mut process = spawn(spec, log, None)?;
    Ok(process.outcome_within(limit).await)
}

fn spawn_reader<R>(
    stream: &'static str,
    reader: R,
    output: SharedLog,
    marker: Option<StartupMarker>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = forward_lines(reader, &output, marker.as_ref(), &events).await {
            let _ = events.send(ProcessEvent::Error(format!("failed reading {stream}: {e}")));
        }
    })
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    output: &SharedLog,
    marker: Option<&StartupMarker>,
    events: &mpsc::UnboundedSender<ProcessEvent>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let mut line = String::from_utf8_lossy(&buf).into_owned();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let log = Arc::clone(&*output.read().unwrap_or_else(PoisonError::into_inner));
        if let Err(e) = log.write(&line) {
            debug!(sink = log.name(), error = %e, "dropping process output line");
        }

        if let Some(hit) = marker.and_then(|m| m.detect(&line)) {
            let _ = events.send(ProcessEvent::Marker(hit));
        }
    }
}

async fn wait_for_child(
    mut child: AsyncGroupChild,
    program: String,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    terminate: CancellationToken,
    force: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = terminate.cancelled() => {
            signal_group(&mut child, false);
            tokio::select! {
                status = child.wait() => status,
                () = force.cancelled() => {
                    signal_group(&mut child, true);
                    child.wait().await
                }
            }
        }
        () = force.cancelled() => {
            signal_group(&mut child, true);
            child.wait().await
        }
    };

    let info = match &status {
        Ok(status) => ExitInfo {
            code: status.code(),
        },
        Err(_) => ExitInfo { code: None },
    };
    exit_tx.send_replace(Some(info));

    // Markers printed just before exit must be observed before the exit event.
    for reader in readers {
        if timeout(IO_CAPTURE_TIMEOUT, reader).await.is_err() {
            warn!(program = %program, "output capture timed out after exit");
        }
    }

    match status {
        Ok(status) => {
            info!(program = %program, code = ?status.code(), "process exited");
            let _ = events.send(ProcessEvent::Exited(status.code()));
        }
        Err(e) => {
            warn!(program = %program, error = %e, "failed waiting on process");
            let _ = events.send(ProcessEvent::Error(e.to_string()));
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &mut AsyncGroupChild, force: bool) {
    use command_group::{Signal, UnixChildExt};

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = child.signal(signal) {
        debug!(pid = ?child.id(), error = %e, "failed to signal process group");
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut AsyncGroupChild, _force: bool) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "failed to kill process");
    }
}
