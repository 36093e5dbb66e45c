//! Orchestrator - owns the engine process and the bridge event loop.
//!
//! Flow:
//! 1. `start_engine` spawns the engine (state `Starting`)
//! 2. The first decoded line from the engine marks it `Ready`
//! 3. The event loop writes commands, routes replies and events, runs heartbeats
//! 4. On crash or unresponsiveness: fail pending requests, restart within budget
//! 5. `stop_engine` asks for shutdown, escalates to kill, ends in `Stopped`
//!
//! [`EngineBridge`] is a cheap handle; every mutation of process, tracker and
//! health state happens on the single event loop task behind it.

use std::future::{Future, poll_fn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::bytes::Bytes;
use tokio_util::codec::FramedRead;

use crate::bridge::codec;
use crate::bridge::framer::LineFramer;
use crate::bridge::protocol::{Message, MessageType};
use crate::config::{BridgeConfig, WriteConfig};
use crate::error::BridgeError;
use crate::health::{HealthMonitor, HealthVerdict};
use crate::scheduler::{PipeSink, ScheduleError, WriteScheduler};
use crate::subscribers::{Subscribers, Subscription};
use crate::supervisor::{
    EngineCommand, EngineProcess, EngineSpawner, ExitInfo, ProcessHandle, ProcessState,
    RestartTracker, SpawnedEngine,
};
use crate::tracker::{RequestTracker, ResponseResult};

const COMMAND_BUFFER: usize = 64;
const ENGINE_EVENT_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 64;
/// How long an exited engine's stdout may keep delivering lines.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle notifications for the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    StateChanged {
        from: ProcessState,
        to: ProcessState,
    },
    EngineExited {
        generation: u64,
        exit: ExitInfo,
    },
    Restarting {
        attempt: u32,
        delay_ms: u64,
    },
    /// The engine is unavailable until the next explicit start.
    Fatal {
        #[serde(serialize_with = "serialize_error")]
        error: Arc<BridgeError>,
    },
}

fn serialize_error<S: serde::Serializer>(
    error: &Arc<BridgeError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Clone)]
pub struct BridgeStatus {
    pub process: Option<ProcessHandle>,
    pub state: ProcessState,
    pub pending_requests: usize,
    pub queue_depth: usize,
    pub restarts_in_window: u32,
    pub decode_failures: u64,
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Send {
        id: String,
        frame: Bytes,
        timeout: Duration,
        accepted: oneshot::Sender<Result<(), BridgeError>>,
        reply: oneshot::Sender<ResponseResult>,
    },
    Post {
        frame: Bytes,
        accepted: oneshot::Sender<Result<(), BridgeError>>,
    },
    Cancel {
        id: String,
    },
    Status {
        reply: oneshot::Sender<BridgeStatus>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Output of one engine generation, as seen by the event loop.
enum EngineEvent {
    Line(String),
    OutputClosed,
    Exited(ExitInfo),
}

type EngineEventTx = mpsc::Sender<(u64, EngineEvent)>;

/// Handle to a bridge instance. Clones share the same engine.
///
/// The event loop ends when [`dispose`](Self::dispose) is called or the last
/// handle is dropped; either way the engine is stopped first.
#[derive(Clone)]
pub struct EngineBridge {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ProcessState>,
    events: broadcast::Sender<BridgeEvent>,
    subscribers: Subscribers,
    ready_timeout: Option<Duration>,
}

impl EngineBridge {
    /// Create the bridge and its event loop. Must be called within a tokio runtime.
    pub fn new(config: BridgeConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ProcessState::Stopped);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let subscribers = Subscribers::new();
        let ready_timeout = config.ready_timeout;

        let event_loop = EventLoop::new(config, state_tx, events_tx.clone(), subscribers.clone());
        tokio::spawn(event_loop.run(commands_rx));

        Self {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
            subscribers,
            ready_timeout,
        }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| BridgeError::Disposed)?;
        rx.await.map_err(|_| BridgeError::Disposed)
    }

    /// Spawn the engine. A no-op when it is already running.
    ///
    /// With a configured `ready_timeout`, also waits for the engine to
    /// become `Ready`, stopping it again on failure.
    pub async fn start_engine(&self) -> Result<(), BridgeError> {
        self.call(|reply| Command::Start { reply }).await??;

        let Some(limit) = self.ready_timeout else {
            return Ok(());
        };
        let mut state = self.state.clone();
        let settled = tokio::time::timeout(limit, async {
            state
                .wait_for(|s| matches!(s, ProcessState::Ready | ProcessState::Stopped))
                .await
                .map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(ProcessState::Ready)) => Ok(()),
            Ok(Ok(_)) => Err(BridgeError::StartupFailure(
                "engine stopped before becoming ready".to_string(),
            )),
            Ok(Err(_)) => Err(BridgeError::Disposed),
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "Engine not ready in time");
                self.stop_engine().await;
                Err(BridgeError::StartupFailure(format!(
                    "engine not ready within {}ms",
                    limit.as_millis()
                )))
            }
        }
    }

    /// Stop the engine. Always leaves the bridge `Stopped`.
    pub async fn stop_engine(&self) {
        if self.call(|reply| Command::Stop { reply }).await.is_err() {
            tracing::debug!("Stop requested after bridge was disposed");
        }
    }

    /// Write `message` and track its reply.
    ///
    /// Errors here mean the command was never written. The returned handle
    /// resolves with the engine's reply or a per-request error.
    pub async fn send(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<ResponseHandle, BridgeError> {
        if message.timeout.is_none() {
            message.timeout = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        }
        let frame = codec::encode(&message)?;
        let id = message.id.unwrap_or_default();

        let (reply, response) = oneshot::channel();
        self.call(|accepted| Command::Send {
            id: id.clone(),
            frame,
            timeout,
            accepted,
            reply,
        })
        .await??;

        Ok(ResponseHandle {
            id,
            response,
            commands: self.commands.downgrade(),
        })
    }

    /// Write `message` without waiting for a reply.
    pub async fn post(&self, message: Message) -> Result<(), BridgeError> {
        let frame = codec::encode(&message)?;
        self.call(|accepted| Command::Post { frame, accepted })
            .await?
    }

    /// Register `callback` for unsolicited messages of type `kind`.
    pub fn subscribe(
        &self,
        kind: impl Into<MessageType>,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(kind.into(), Arc::new(callback))
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> Result<BridgeStatus, BridgeError> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Stop the engine and end the event loop. Other handles see `Disposed`.
    pub async fn dispose(&self) {
        if self.call(|reply| Command::Dispose { reply }).await.is_err() {
            tracing::debug!("Bridge already disposed");
        }
    }
}

/// Pending reply to a [`EngineBridge::send`].
#[must_use = "a response handle does nothing unless awaited"]
pub struct ResponseHandle {
    id: String,
    response: oneshot::Receiver<ResponseResult>,
    commands: mpsc::WeakSender<Command>,
}

impl ResponseHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop waiting. The command stays written; a late reply goes to subscribers.
    pub async fn cancel(self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Cancel { id: self.id }).await;
        }
    }
}

impl Future for ResponseHandle {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.response)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BridgeError::Disposed)))
    }
}

/// The live engine process and its per-process tasks.
struct LiveEngine {
    generation: u64,
    pid: Option<u32>,
    started_at: std::time::Instant,
    writer: WriteScheduler,
    kill: Option<oneshot::Sender<()>>,
    io_tasks: Vec<JoinHandle<()>>,
    output_closed: bool,
    /// Exit seen while stdout still had lines in flight.
    exit: Option<ExitInfo>,
}

impl LiveEngine {
    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Kill without waiting, discarding queued frames.
    fn abandon(mut self) {
        self.kill();
        self.writer.close().abort();
        for task in self.io_tasks {
            task.abort();
        }
    }
}

struct EventLoop {
    spawner: Arc<dyn EngineSpawner>,
    command: EngineCommand,
    write: WriteConfig,
    shutdown_grace: Duration,
    kill_grace: Duration,

    state: ProcessState,
    state_tx: watch::Sender<ProcessState>,
    events: broadcast::Sender<BridgeEvent>,
    subscribers: Subscribers,

    live: Option<LiveEngine>,
    generation: u64,
    tracker: RequestTracker,
    health: HealthMonitor,
    restarts: RestartTracker,
    heartbeat: Interval,
    restart_at: Option<Instant>,
    drain_at: Option<Instant>,
    stopping: bool,
    decode_failures: u64,

    engine_tx: EngineEventTx,
    engine_rx: mpsc::Receiver<(u64, EngineEvent)>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    fn new(
        config: BridgeConfig,
        state_tx: watch::Sender<ProcessState>,
        events: broadcast::Sender<BridgeEvent>,
        subscribers: Subscribers,
    ) -> Self {
        let period = config.health.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (engine_tx, engine_rx) = mpsc::channel(ENGINE_EVENT_BUFFER);

        Self {
            spawner: config.spawner,
            command: config.command,
            write: config.write,
            shutdown_grace: config.shutdown_grace,
            kill_grace: config.kill_grace,
            state: ProcessState::Stopped,
            state_tx,
            events,
            subscribers,
            live: None,
            generation: 0,
            tracker: RequestTracker::new(),
            health: HealthMonitor::new(config.health, now()),
            restarts: RestartTracker::new(config.restart),
            heartbeat,
            restart_at: None,
            drain_at: None,
            stopping: false,
            decode_failures: 0,
            engine_tx,
            engine_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let restart_at = self.restart_at;
            let drain_at = self.drain_at;
            tokio::select! {
                biased;

                Some((generation, event)) = self.engine_rx.recv() => {
                    self.on_engine_event(generation, event);
                }

                cmd = commands.recv() => match cmd {
                    Some(Command::Dispose { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        tracing::debug!("All bridge handles dropped");
                        self.stop().await;
                        break;
                    }
                },

                Some(id) = poll_fn(|cx| self.tracker.poll_expire(cx)) => {
                    tracing::trace!(%id, "Request deadline handled");
                }

                _ = self.heartbeat.tick(), if self.state == ProcessState::Ready => {
                    self.on_heartbeat_tick();
                }

                _ = sleep_until_opt(drain_at) => {
                    self.drain_at = None;
                    self.on_drain_due();
                }

                _ = sleep_until_opt(restart_at) => {
                    self.restart_at = None;
                    self.on_restart_due();
                }
            }
        }

        tracing::info!("Bridge event loop exiting");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { reply } => {
                let result = self.start();
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Send {
                id,
                frame,
                timeout,
                accepted,
                reply,
            } => {
                let admitted = if self.tracker.contains(&id) {
                    Err(BridgeError::DuplicateRequest(id.clone()))
                } else {
                    self.write_frame(frame, Some(&id))
                };
                if admitted.is_ok() {
                    self.tracker.register(id, timeout, reply);
                }
                let _ = accepted.send(admitted);
            }
            Command::Post { frame, accepted } => {
                let _ = accepted.send(self.write_frame(frame, None));
            }
            Command::Cancel { id } => {
                self.tracker.cancel(&id);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the loop itself.
            Command::Dispose { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn write_frame(&mut self, frame: Bytes, id: Option<&str>) -> Result<(), BridgeError> {
        let live = match &self.live {
            Some(live) if self.state.accepts_commands() => live,
            _ => return Err(BridgeError::NotRunning(self.state)),
        };
        if live.exit.is_some() {
            return Err(BridgeError::ProcessCrashed {
                id: id.unwrap_or_default().to_string(),
            });
        }
        match live.writer.enqueue(frame) {
            Ok(()) => Ok(()),
            Err(ScheduleError::Saturated { depth }) => {
                tracing::warn!(depth, "Write queue saturated, rejecting command");
                Err(BridgeError::BridgeSaturated { depth })
            }
            Err(ScheduleError::Closed) => {
                tracing::warn!(generation = live.generation, "Engine stdin closed");
                Err(BridgeError::ProcessCrashed {
                    id: id.unwrap_or_default().to_string(),
                })
            }
        }
    }

    fn status(&mut self) -> BridgeStatus {
        let process = self.live.as_ref().map(|live| ProcessHandle {
            generation: live.generation,
            pid: live.pid,
            state: self.state,
            started_at: live.started_at,
        });
        BridgeStatus {
            process,
            state: self.state,
            pending_requests: self.tracker.len(),
            queue_depth: self.live.as_ref().map_or(0, |live| live.writer.depth()),
            restarts_in_window: self.restarts.recent(now()),
            decode_failures: self.decode_failures,
        }
    }

    fn set_state(&mut self, to: ProcessState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(%from, %to, "Engine state changed");
        self.state_tx.send_replace(to);
        let _ = self.events.send(BridgeEvent::StateChanged { from, to });
    }

    fn emit_fatal(&mut self, error: BridgeError) {
        tracing::error!(error = %error, "Engine unavailable");
        let _ = self.events.send(BridgeEvent::Fatal {
            error: Arc::new(error),
        });
    }

    fn start(&mut self) -> Result<(), BridgeError> {
        if self.live.is_some() {
            tracing::debug!(state = %self.state, "Engine already running");
            return Ok(());
        }
        self.restart_at = None;
        self.restarts.clear();
        self.spawn_engine()
    }

    fn spawn_engine(&mut self) -> Result<(), BridgeError> {
        self.set_state(ProcessState::Starting);

        let spawned = match self.spawner.spawn(&self.command) {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(program = ?self.command.program, error = %reason, "Engine spawn failed");
                self.set_state(ProcessState::Stopped);
                self.emit_fatal(BridgeError::StartupFailure(reason.clone()));
                return Err(BridgeError::StartupFailure(reason));
            }
        };

        self.generation += 1;
        let live = launch(self.generation, spawned, self.write, self.engine_tx.clone());
        tracing::info!(generation = live.generation, pid = ?live.pid, "Engine spawned");
        self.health.reset(now());
        self.live = Some(live);
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    fn on_engine_event(&mut self, generation: u64, event: EngineEvent) {
        if !self.is_current(generation) {
            tracing::trace!(generation, "Ignoring output of a previous engine");
            return;
        }
        match event {
            EngineEvent::Line(line) => self.on_line(line),
            EngineEvent::OutputClosed => {
                tracing::debug!(generation, "Engine stdout closed");
                let Some(live) = self.live.as_mut() else { return };
                live.output_closed = true;
                if let Some(exit) = live.exit.take() {
                    self.on_exit(generation, exit);
                }
            }
            EngineEvent::Exited(exit) => {
                let Some(live) = self.live.as_mut() else { return };
                if live.output_closed {
                    self.on_exit(generation, exit);
                } else {
                    // Lines written before exit may still be queued behind this event.
                    tracing::debug!(generation, %exit, "Engine exited, draining stdout");
                    live.exit = Some(exit);
                    self.drain_at = Some(Instant::now() + EXIT_DRAIN_GRACE);
                }
            }
        }
    }

    fn on_drain_due(&mut self) {
        let Some(live) = self.live.as_mut() else { return };
        let generation = live.generation;
        if let Some(exit) = live.exit.take() {
            tracing::debug!(generation, "Engine stdout still open after exit");
            self.on_exit(generation, exit);
        }
    }

    fn on_exit(&mut self, generation: u64, exit: ExitInfo) {
        tracing::warn!(generation, %exit, "Engine exited unexpectedly");
        let _ = self.events.send(BridgeEvent::EngineExited { generation, exit });
        self.recover();
    }

    fn on_line(&mut self, line: String) {
        self.health.record_alive(now());
        if line.trim().is_empty() {
            return;
        }

        let message = match codec::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                self.decode_failures += 1;
                tracing::warn!(error = %e, line_len = line.len(), "Skipping undecodable line from engine");
                return;
            }
        };
        tracing::trace!(kind = %message.kind, id = ?message.id, "Inbound message");

        if self.state == ProcessState::Starting && !self.stopping {
            self.set_state(ProcessState::Ready);
            self.heartbeat.reset();
        }

        if let Some(unsolicited) = self.tracker.route(message) {
            self.subscribers.dispatch(&unsolicited);
        }
    }

    fn on_heartbeat_tick(&mut self) {
        match self.health.on_tick(now()) {
            HealthVerdict::Alive => {}
            HealthVerdict::Late { missed } => {
                tracing::warn!(missed, "Engine missed heartbeat");
            }
            HealthVerdict::Unresponsive { missed } => {
                tracing::error!(missed, "Engine unresponsive, restarting");
                self.set_state(ProcessState::Degraded);
                self.recover();
                return;
            }
        }

        let id = self.health.next_heartbeat_id();
        match codec::encode(&Message::heartbeat(id)) {
            Ok(frame) => {
                if let Err(e) = self.write_frame(frame, None) {
                    tracing::debug!(error = %e, "Heartbeat not written");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode heartbeat"),
        }
    }

    /// Tear down after a crash or health failure, then restart within budget.
    fn recover(&mut self) {
        self.drain_at = None;
        if let Some(live) = self.live.take() {
            live.abandon();
        }
        let failed = self.tracker.fail_all(|id| BridgeError::ProcessCrashed { id });
        if failed > 0 {
            tracing::warn!(failed, "Failed pending requests after engine loss");
        }
        self.health.reset(now());

        let policy = self.restarts.policy();
        match self.restarts.try_acquire(now()) {
            Some(attempt) => {
                tracing::info!(attempt, delay_ms = policy.delay.as_millis() as u64, "Scheduling engine restart");
                self.set_state(ProcessState::Restarting);
                let _ = self.events.send(BridgeEvent::Restarting {
                    attempt,
                    delay_ms: policy.delay.as_millis() as u64,
                });
                self.restart_at = Some(Instant::now() + policy.delay);
            }
            None => {
                self.set_state(ProcessState::Stopped);
                self.emit_fatal(BridgeError::RestartBudgetExhausted {
                    restarts: policy.max_restarts,
                    window: policy.window,
                });
            }
        }
    }

    fn on_restart_due(&mut self) {
        if self.state != ProcessState::Restarting {
            return;
        }
        if let Err(e) = self.spawn_engine() {
            tracing::debug!(error = %e, "Restart failed");
        }
    }

    async fn stop(&mut self) {
        self.restart_at = None;
        self.drain_at = None;
        self.stopping = true;

        if let Some(live) = self.live.take() {
            let LiveEngine {
                generation,
                writer,
                mut kill,
                io_tasks,
                exit,
                ..
            } = live;

            let mut exited = exit;
            let asked = exited.is_none() && self.state == ProcessState::Ready && {
                match codec::encode(&Message::shutdown(format!("shutdown_{generation}"))) {
                    Ok(frame) => writer.enqueue(frame).is_ok(),
                    Err(_) => false,
                }
            };
            let flush = writer.close();

            if asked {
                tracing::info!(generation, "Shutdown requested");
                exited = self.wait_for_exit(generation, self.shutdown_grace).await;
            }
            if exited.is_none() {
                tracing::warn!(generation, "Killing engine");
                if let Some(kill) = kill.take() {
                    let _ = kill.send(());
                }
                exited = self.wait_for_exit(generation, self.kill_grace).await;
            }

            flush.abort();
            for task in io_tasks {
                task.abort();
            }
            match exited {
                Some(exit) => {
                    tracing::info!(generation, %exit, "Engine stopped");
                    let _ = self.events.send(BridgeEvent::EngineExited { generation, exit });
                }
                None => tracing::error!(generation, "Engine did not exit after kill"),
            }
        }

        let failed = self.tracker.fail_all(|id| BridgeError::EngineStopped { id });
        if failed > 0 {
            tracing::debug!(failed, "Failed pending requests on stop");
        }
        self.health.reset(now());
        self.set_state(ProcessState::Stopped);
        self.stopping = false;
    }

    /// Keep handling this generation's output until it exits and its stdout
    /// drains, or `grace` passes.
    async fn wait_for_exit(&mut self, generation: u64, grace: Duration) -> Option<ExitInfo> {
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        let mut output_closed = false;
        let mut exited = None;
        loop {
            tokio::select! {
                _ = &mut deadline => return exited,
                event = self.engine_rx.recv() => match event {
                    Some((g, event)) if g == generation => match event {
                        EngineEvent::Line(line) => self.on_line(line),
                        EngineEvent::OutputClosed => output_closed = true,
                        EngineEvent::Exited(exit) => {
                            exited = Some(exit);
                            let drained_by = Instant::now() + EXIT_DRAIN_GRACE;
                            if drained_by < deadline.deadline() {
                                deadline.as_mut().reset(drained_by);
                            }
                        }
                    },
                    Some(_) => {}
                    None => return exited,
                },
            }
            if output_closed && exited.is_some() {
                return exited;
            }
        }
    }
}

/// Start the per-process tasks for a freshly spawned engine.
fn launch(
    generation: u64,
    spawned: SpawnedEngine,
    write: WriteConfig,
    events: EngineEventTx,
) -> LiveEngine {
    let SpawnedEngine {
        stdin,
        stdout,
        stderr,
        process,
    } = spawned;
    let pid = process.pid();
    let (kill_tx, kill_rx) = oneshot::channel();

    let mut io_tasks = vec![tokio::spawn(read_output(generation, stdout, events.clone()))];
    if let Some(stderr) = stderr {
        io_tasks.push(tokio::spawn(log_stderr(generation, stderr)));
    }
    tokio::spawn(watch_exit(generation, process, kill_rx, events));

    LiveEngine {
        generation,
        pid,
        started_at: now(),
        writer: WriteScheduler::spawn(
            PipeSink::new(stdin, write.high_water_mark),
            write.max_queue_depth,
        ),
        kill: Some(kill_tx),
        io_tasks,
        output_closed: false,
        exit: None,
    }
}

async fn read_output(
    generation: u64,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    events: EngineEventTx,
) {
    let mut lines = FramedRead::new(stdout, LineFramer::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if events.send((generation, EngineEvent::Line(line))).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(generation, error = %e, "Engine stdout read failed");
                break;
            }
        }
    }
    let _ = events.send((generation, EngineEvent::OutputClosed)).await;
}

async fn log_stderr(generation: u64, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "engine_bridge::engine", generation, "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(generation, error = %e, "Engine stderr read failed");
                break;
            }
        }
    }
}

/// Own the process until it exits. A kill request (or dropped sender) kills it.
async fn watch_exit(
    generation: u64,
    mut process: Box<dyn EngineProcess>,
    mut kill: oneshot::Receiver<()>,
    events: EngineEventTx,
) {
    let waited = tokio::select! {
        status = process.wait() => Some(status),
        _ = &mut kill => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(e) = process.kill() {
                tracing::warn!(generation, error = %e, "Failed to kill engine");
            }
            process.wait().await
        }
    };

    let exit = match status {
        Ok(exit) => exit,
        Err(e) => {
            tracing::warn!(generation, error = %e, "Failed to wait for engine");
            ExitInfo::default()
        }
    };
    let _ = events.send((generation, EngineEvent::Exited(exit))).await;
}
