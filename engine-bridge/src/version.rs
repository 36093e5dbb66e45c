//! Version information for the bridge.

use crate::bridge::protocol::Message;

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the CLI on startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
    /// Version announced by the engine, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            engine: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(mut self, version: String) -> Self {
        self.engine = Some(version);
        self
    }

    /// Take the engine version from a `startup_complete` payload, if it has one.
    pub fn with_startup(self, startup: &Message) -> Self {
        match startup.data.get("version").and_then(|v| v.as_str()) {
            Some(version) => self.with_engine(version.to_string()),
            None => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_bridge_version() {
        let info = VersionInfo::new();
        assert_eq!(info.bridge, BRIDGE_VERSION);
        assert!(info.engine.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            bridge: "0.1.0",
            engine: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "bridge": "0.1.0"
        }
        "#);
    }

    #[test]
    fn engine_version_comes_from_startup_complete() {
        let startup = Message::event(
            "startup_complete",
            serde_json::json!({"version": "2.3.1", "gpu": "metal"}),
        );
        let info = VersionInfo::new().with_startup(&startup);
        assert_eq!(info.engine.as_deref(), Some("2.3.1"));

        let bare = Message::event("startup_complete", serde_json::json!({}));
        assert!(VersionInfo::new().with_startup(&bare).engine.is_none());
    }

    #[test]
    fn version_info_serializes_with_engine() {
        let info = VersionInfo {
            bridge: "0.1.0",
            engine: None,
        }
        .with_engine("2.3.1".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "bridge": "0.1.0",
          "engine": "2.3.1"
        }
        "#);
    }
}
