//! Wire protocol types for bridge-engine communication.
//!
//! Every message in either direction is one JSON object:
//! `{ "type": ..., "id": ..., "timestamp": ..., "data": {...}, "timeout": ... }`.
//! Commands flow bridge → engine on stdin, events flow engine → bridge on stdout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message type vocabulary.
///
/// The set is open: engines may emit types the bridge has never heard of, and
/// those round-trip through [`MessageType::Other`] unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    // Commands (bridge → engine)
    StartAnimation,
    UpdateSettings,
    LoadImage,
    Shutdown,
    Heartbeat,

    // Events (engine → bridge)
    StatusUpdate,
    MetricsUpdate,
    Error,
    StartupComplete,

    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StartAnimation => "start_animation",
            Self::UpdateSettings => "update_settings",
            Self::LoadImage => "load_image",
            Self::Shutdown => "shutdown",
            Self::Heartbeat => "heartbeat",
            Self::StatusUpdate => "status_update",
            Self::MetricsUpdate => "metrics_update",
            Self::Error => "error",
            Self::StartupComplete => "startup_complete",
            Self::Other(s) => s,
        }
    }

    /// Progress broadcasts never complete a request, even when they echo its id.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::StatusUpdate | Self::MetricsUpdate)
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "start_animation" => Self::StartAnimation,
            "update_settings" => Self::UpdateSettings,
            "load_image" => Self::LoadImage,
            "shutdown" => Self::Shutdown,
            "heartbeat" => Self::Heartbeat,
            "status_update" => Self::StatusUpdate,
            "metrics_update" => Self::MetricsUpdate,
            "error" => Self::Error,
            "startup_complete" => Self::StartupComplete,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match Self::from(s.as_str()) {
            Self::Other(_) => Self::Other(s),
            known => known,
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A single protocol message.
///
/// Correlated replies echo the originating command's `id`. Broadcast events
/// (periodic metrics, status) may omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
    /// Response deadline in milliseconds, advisory for the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Message {
    /// Build a command with a fresh UUID id and the current timestamp.
    pub fn command(kind: impl Into<MessageType>, data: serde_json::Value) -> Self {
        Self::with_id(kind, uuid::Uuid::new_v4().to_string(), data)
    }

    pub fn with_id(
        kind: impl Into<MessageType>,
        id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.into()),
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
            timeout: None,
        }
    }

    /// Build an id-less broadcast event.
    pub fn event(kind: impl Into<MessageType>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
            timeout: None,
        }
    }

    pub fn heartbeat(id: impl Into<String>) -> Self {
        Self::with_id(MessageType::Heartbeat, id, empty_object())
    }

    pub fn shutdown(id: impl Into<String>) -> Self {
        Self::with_id(MessageType::Shutdown, id, empty_object())
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    /// Engine-supplied error code, from `data.code` (string or number).
    pub fn error_code(&self) -> Option<String> {
        match self.data.get("code")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Engine-supplied error text, from `data.message` or `data.error`.
    pub fn error_message(&self) -> String {
        self.data
            .get("message")
            .or_else(|| self.data.get("error"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "engine reported an error".to_string())
    }
}
