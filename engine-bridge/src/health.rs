//! Engine liveness tracking.
//!
//! Any inbound line counts as proof of life, not only heartbeat replies.
//! The event loop calls [`HealthMonitor::on_tick`] once per heartbeat interval
//! while the engine is `Ready`.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    /// Staleness threshold as a multiple of `heartbeat_interval`.
    pub stale_multiplier: u32,
    /// Missed ticks tolerated before the engine is declared unresponsive.
    pub max_missed_heartbeats: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_multiplier: 2,
            max_missed_heartbeats: 3,
        }
    }
}

impl HealthConfig {
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * self.stale_multiplier.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    pub last_alive_at: Instant,
    pub missed_heartbeats: u32,
}

/// Outcome of a health tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Alive,
    /// Stale, but still within the missed-heartbeat budget.
    Late { missed: u32 },
    /// Budget exceeded: the engine should be restarted.
    Unresponsive { missed: u32 },
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    state: HealthState,
    /// Random per-monitor tag keeping heartbeat ids apart from caller ids.
    heartbeat_tag: String,
    heartbeat_counter: u64,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        Self {
            config,
            state: HealthState {
                last_alive_at: now,
                missed_heartbeats: 0,
            },
            heartbeat_tag: uuid::Uuid::new_v4().simple().to_string(),
            heartbeat_counter: 0,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Inbound traffic observed.
    pub fn record_alive(&mut self, now: Instant) {
        if self.state.missed_heartbeats > 0 {
            tracing::debug!(
                missed = self.state.missed_heartbeats,
                "Engine traffic resumed, clearing missed heartbeats"
            );
        }
        self.state.last_alive_at = now;
        self.state.missed_heartbeats = 0;
    }

    pub fn on_tick(&mut self, now: Instant) -> HealthVerdict {
        let silent_for = now.saturating_duration_since(self.state.last_alive_at);
        if silent_for <= self.config.stale_threshold() {
            return HealthVerdict::Alive;
        }

        self.state.missed_heartbeats += 1;
        let missed = self.state.missed_heartbeats;
        if missed > self.config.max_missed_heartbeats {
            HealthVerdict::Unresponsive { missed }
        } else {
            HealthVerdict::Late { missed }
        }
    }

    /// Fresh state for a new process.
    pub fn reset(&mut self, now: Instant) {
        self.state = HealthState {
            last_alive_at: now,
            missed_heartbeats: 0,
        };
    }

    /// Id for the next outgoing heartbeat command.
    pub fn next_heartbeat_id(&mut self) -> String {
        self.heartbeat_counter += 1;
        format!("hb_{}_{}", self.heartbeat_tag, self.heartbeat_counter)
    }
}
