//! engine-bridge: spawn, supervise and talk to an external engine process
//! over newline-delimited JSON on stdio.

mod config;
mod error;
mod health;
mod scheduler;
mod subscribers;
mod supervisor;
mod tracker;
mod version;

pub mod bridge;
pub mod logging;
pub mod orchestrator;
pub mod relay;

#[cfg(test)]
mod test_support;

pub use bridge::{DecodeError, EncodingError, LineFramer, Message, MessageType};
pub use config::{BridgeConfig, WriteConfig};
pub use error::BridgeError;
pub use health::{HealthConfig, HealthMonitor, HealthState, HealthVerdict};
pub use orchestrator::{BridgeEvent, BridgeStatus, EngineBridge, ResponseHandle};
pub use scheduler::{FrameSink, PipeSink, ScheduleError, SinkStatus, WriteScheduler};
pub use subscribers::{Callback, Subscribers, Subscription};
pub use supervisor::{
    ChildProcess, EngineCommand, EngineProcess, EngineSpawner, ExitInfo, ProcessHandle,
    ProcessSpawner, ProcessState, RestartPolicy, RestartTracker, SpawnError, SpawnedEngine,
};
pub use tracker::{MAX_REQUEST_TIMEOUT, PendingRequest, RequestTracker, ResponseResult};
pub use version::{BRIDGE_VERSION, VersionInfo};
