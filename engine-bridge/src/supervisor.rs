//! Engine process supervision: lifecycle states, spawning, restart budget.
//!
//! The event loop in [`crate::orchestrator`] drives the state machine:
//!
//! ```text
//! Stopped → Starting → Ready → Degraded → Restarting → Starting …
//!              │          │                    │
//!              └──────────┴────────────────────┴──→ Stopped (stop / budget exhausted)
//! ```

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Spawned, waiting for the first inbound message
    Starting,
    /// Engine has spoken, commands and heartbeats flow
    Ready,
    /// Heartbeats went unanswered, restart pending
    Degraded,
    /// Previous process torn down, waiting out the restart delay
    Restarting,
    /// No process; either never started, stopped, or given up on
    #[default]
    Stopped,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }

    /// Whether a live process exists that can take commands.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Degraded)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the one live engine process.
///
/// A new handle is minted for every spawn; handles from a previous process
/// generation are never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub generation: u64,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub started_at: Instant,
}

/// How the engine process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Bounded restarts within a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    /// Pause between teardown and respawn.
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(60),
            delay: Duration::from_millis(500),
        }
    }
}

/// Tracks restart attempts against a [`RestartPolicy`].
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    attempts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Record a restart attempt at `now`.
    ///
    /// Returns the attempt number within the window, or `None` when the
    /// budget is spent (the attempt is not recorded).
    pub fn try_acquire(&mut self, now: Instant) -> Option<u32> {
        self.prune(now);
        if self.attempts.len() >= self.policy.max_restarts as usize {
            return None;
        }
        self.attempts.push_back(now);
        Some(self.attempts.len() as u32)
    }

    /// Attempts still inside the window as of `now`.
    pub fn recent(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.attempts.len() as u32
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The fixed command line used for every engine spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: HashMap<OsString, OsString>,
    pub current_dir: Option<PathBuf>,
}

impl EngineCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
}

/// A running engine as seen by the bridge: its stdio plus process control.
pub struct SpawnedEngine {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Diagnostic side channel, logged but never parsed.
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub process: Box<dyn EngineProcess>,
}

/// Process control for a spawned engine.
#[async_trait]
pub trait EngineProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit. Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<ExitInfo>;

    /// Forcibly terminate without waiting.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Extension point for different engine spawn strategies.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self, command: &EngineCommand) -> Result<SpawnedEngine, SpawnError>;
}

/// Spawns the engine as an OS subprocess with piped stdio.
pub struct ProcessSpawner;

impl EngineSpawner for ProcessSpawner {
    fn spawn(&self, command: &EngineCommand) -> Result<SpawnedEngine, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = command.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take();

        Ok(SpawnedEngine {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            process: Box::new(ChildProcess(child)),
        })
    }
}

/// [`EngineProcess`] over a tokio child.
pub struct ChildProcess(Child);

#[async_trait]
impl EngineProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.0.id()
    }

    async fn wait(&mut self) -> std::io::Result<ExitInfo> {
        self.0.wait().await.map(ExitInfo::from)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.0.start_kill()
    }
}
