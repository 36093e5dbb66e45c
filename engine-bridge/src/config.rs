//! Bridge configuration.
//!
//! Built in code with `with_*` methods, optionally overlaid from
//! `ENGINE_BRIDGE_*` environment variables via [`BridgeConfig::from_env`].

use std::sync::Arc;
use std::time::Duration;

use crate::health::HealthConfig;
use crate::supervisor::{EngineCommand, EngineSpawner, ProcessSpawner, RestartPolicy};

/// Write-side limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteConfig {
    /// Frames allowed to wait for the transport. `None` means unbounded.
    pub max_queue_depth: Option<usize>,
    /// Bytes the stdin sink buffers before reporting saturation.
    pub high_water_mark: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: Some(1024),
            high_water_mark: 64 * 1024,
        }
    }
}

pub struct BridgeConfig {
    pub command: EngineCommand,
    pub health: HealthConfig,
    pub restart: RestartPolicy,
    pub write: WriteConfig,
    /// How long `stop` waits after sending `shutdown`.
    pub shutdown_grace: Duration,
    /// How long `stop` waits after a forced kill.
    pub kill_grace: Duration,
    /// When set, `start_engine` also waits for the engine to become ready.
    pub ready_timeout: Option<Duration>,
    pub spawner: Arc<dyn EngineSpawner>,
}

impl BridgeConfig {
    pub fn new(command: EngineCommand) -> Self {
        Self {
            command,
            health: HealthConfig::default(),
            restart: RestartPolicy::default(),
            write: WriteConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            ready_timeout: None,
            spawner: Arc::new(ProcessSpawner),
        }
    }

    /// Defaults overlaid with `ENGINE_BRIDGE_*` environment variables.
    pub fn from_env(command: EngineCommand) -> Self {
        Self::new(command).with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
                    None
                }
            }
        };
        let millis = |key: &str| read(key).map(Duration::from_millis);

        if let Some(v) = millis("ENGINE_BRIDGE_HEARTBEAT_MS") {
            self.health.heartbeat_interval = v;
        }
        if let Some(v) = read("ENGINE_BRIDGE_STALE_MULTIPLIER") {
            self.health.stale_multiplier = v as u32;
        }
        if let Some(v) = read("ENGINE_BRIDGE_MAX_MISSED") {
            self.health.max_missed_heartbeats = v as u32;
        }
        if let Some(v) = read("ENGINE_BRIDGE_MAX_RESTARTS") {
            self.restart.max_restarts = v as u32;
        }
        if let Some(v) = millis("ENGINE_BRIDGE_RESTART_WINDOW_MS") {
            self.restart.window = v;
        }
        if let Some(v) = millis("ENGINE_BRIDGE_RESTART_DELAY_MS") {
            self.restart.delay = v;
        }
        if let Some(v) = read("ENGINE_BRIDGE_MAX_QUEUE_DEPTH") {
            self.write.max_queue_depth = (v > 0).then_some(v as usize);
        }
        if let Some(v) = millis("ENGINE_BRIDGE_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = v;
        }
        if let Some(v) = millis("ENGINE_BRIDGE_READY_TIMEOUT_MS") {
            self.ready_timeout = Some(v);
        }
        self
    }

    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_write(mut self, write: WriteConfig) -> Self {
        self.write = write;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn EngineSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}
