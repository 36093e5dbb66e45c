//! In-memory engines for exercising the bridge without OS processes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::bridge::codec;
use crate::bridge::framer::LineFramer;
use crate::bridge::protocol::{Message, MessageType};
use crate::supervisor::{
    EngineCommand, EngineProcess, EngineSpawner, ExitInfo, SpawnError, SpawnedEngine,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawner handing the engine side of every spawn to the test.
pub struct FakeSpawner {
    engines: mpsc::UnboundedSender<FakeEngine>,
    stdin_capacity: usize,
    failing: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeSpawner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeEngine>) {
        Self::with_stdin_capacity(64 * 1024)
    }

    /// Spawner whose engines buffer at most `capacity` unread stdin bytes.
    pub fn with_stdin_capacity(capacity: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeEngine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Self {
            engines: tx,
            stdin_capacity: capacity,
            failing: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
        };
        (Arc::new(spawner), rx)
    }

    pub fn fail_spawns(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EngineSpawner for FakeSpawner {
    fn spawn(&self, _command: &EngineCommand) -> Result<SpawnedEngine, SpawnError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SpawnError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "engine binary not found",
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (bridge_stdin, engine_stdin) = tokio::io::duplex(self.stdin_capacity);
        let (engine_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let engine = FakeEngine {
            pid,
            commands: FramedRead::new(engine_stdin, LineFramer::new()),
            output: Some(engine_stdout),
            exit: exit_tx.clone(),
        };
        let process = FakeProcess {
            pid,
            exit_tx,
            exit_rx,
        };
        let _ = self.engines.send(engine);

        Ok(SpawnedEngine {
            stdin: Box::new(bridge_stdin),
            stdout: Box::new(bridge_stdout),
            stderr: None,
            process: Box::new(process),
        })
    }
}

struct FakeProcess {
    pid: u32,
    exit_tx: mpsc::UnboundedSender<ExitInfo>,
    exit_rx: mpsc::UnboundedReceiver<ExitInfo>,
}

#[async_trait]
impl EngineProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> std::io::Result<ExitInfo> {
        self.exit_rx
            .recv()
            .await
            .ok_or_else(|| std::io::Error::other("exit channel closed"))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        let _ = self.exit_tx.send(ExitInfo {
            code: None,
            signal: Some(9),
        });
        Ok(())
    }
}

/// The engine end of a fake spawn.
pub struct FakeEngine {
    pub pid: u32,
    commands: FramedRead<DuplexStream, LineFramer>,
    output: Option<DuplexStream>,
    exit: mpsc::UnboundedSender<ExitInfo>,
}

impl FakeEngine {
    /// Next frame written by the bridge, heartbeats included.
    pub async fn recv_raw(&mut self) -> Message {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.commands.next())
            .await
            .expect("timed out waiting for a frame from the bridge")
            .expect("bridge closed engine stdin")
            .expect("stdin read failed");
        codec::decode(&line).expect("bridge wrote an undecodable frame")
    }

    /// Next non-heartbeat command.
    pub async fn recv(&mut self) -> Message {
        loop {
            let msg = self.recv_raw().await;
            if msg.kind != MessageType::Heartbeat {
                return msg;
            }
        }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        let output = self.output.as_mut().expect("engine output already closed");
        output.write_all(bytes).await.expect("engine output write failed");
    }

    pub async fn send(&mut self, message: &Message) {
        let mut line = serde_json::to_vec(message).expect("serialize");
        line.push(b'\n');
        self.write_raw(&line).await;
    }

    /// Answer `request` with a message of the same type and id.
    pub async fn reply(&mut self, request: &Message, data: serde_json::Value) {
        let id = request.id().expect("request without id");
        self.send(&Message::with_id(request.kind.clone(), id, data)).await;
    }

    /// Signal readiness the way a real engine does after boot.
    pub async fn announce_ready(&mut self) {
        self.send(&Message::event(MessageType::StartupComplete, serde_json::json!({})))
            .await;
    }

    /// Close stdout and exit with `code`.
    pub fn exit(mut self, code: i32) {
        self.output.take();
        let _ = self.exit.send(ExitInfo {
            code: Some(code),
            signal: None,
        });
    }

    pub fn crash(self) {
        self.exit(1);
    }
}

/// Next spawned engine, failing the test if none arrives.
pub async fn next_engine(engines: &mut mpsc::UnboundedReceiver<FakeEngine>) -> FakeEngine {
    tokio::time::timeout(RECV_TIMEOUT, engines.recv())
        .await
        .expect("timed out waiting for an engine spawn")
        .expect("spawner dropped")
}
