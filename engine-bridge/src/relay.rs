//! Line-oriented command relay behind the `engine-bridge` binary.
//!
//! Each input line is a JSON command. Commands are written to the engine in
//! input order; their outcomes are reported through `emit` as they settle.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::bridge::codec;
use crate::orchestrator::EngineBridge;

/// Relay commands from `input` until EOF.
///
/// Commands without an id get a fresh uuid. The command's own `timeout`
/// wins over `default_timeout`.
pub async fn relay_commands<R, F>(
    bridge: &EngineBridge,
    input: R,
    default_timeout: Duration,
    emit: F,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: Fn(serde_json::Value) + Clone + Send + 'static,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut message = match codec::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                emit(json!({ "event": "invalid_command", "error": e.to_string() }));
                continue;
            }
        };
        if message.id().is_none_or(str::is_empty) {
            message.id = Some(uuid::Uuid::new_v4().to_string());
        }
        let timeout = message
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        let id = message.id.clone().unwrap_or_default();

        // Only the wait is detached; the write happens before the next line is read.
        let handle = match bridge.send(message, timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(%id, error = %e, "Command not sent");
                emit(json!({ "event": "request_failed", "id": id, "error": e.to_string() }));
                continue;
            }
        };
        let emit = emit.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(reply) => emit(json!({ "event": "response", "id": id, "message": reply })),
                Err(e) => emit(json!({ "event": "request_failed", "id": id, "error": e.to_string() })),
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Message;
    use crate::config::BridgeConfig;
    use crate::supervisor::EngineCommand;
    use crate::test_support::{FakeSpawner, next_engine};
    use std::sync::{Arc, Mutex};

    type Output = Arc<Mutex<Vec<serde_json::Value>>>;

    fn collector() -> (Output, impl Fn(serde_json::Value) + Clone + Send + 'static) {
        let out: Output = Arc::default();
        let sink = Arc::clone(&out);
        (out, move |value| sink.lock().unwrap().push(value))
    }

    async fn wait_for_output(out: &Output, event: &str, id: &str) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let found = out
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|v| v["event"] == event && v["id"] == id)
                    .cloned();
                if let Some(found) = found {
                    return found;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay output not observed")
    }

    #[tokio::test]
    async fn commands_reach_engine_in_input_order() {
        let (spawner, mut engines) = FakeSpawner::new();
        let bridge =
            EngineBridge::new(BridgeConfig::new(EngineCommand::new("engine")).with_spawner(spawner));
        bridge.start_engine().await.unwrap();
        let mut engine = next_engine(&mut engines).await;

        let mut input = String::from("not json\n\n");
        for i in 1..=200 {
            input.push_str(&format!(
                "{{\"type\":\"load_image\",\"id\":\"c{i}\",\"data\":{{}}}}\n"
            ));
        }
        input.push_str("{\"type\":\"update_settings\",\"timeout\":250,\"data\":{\"fps\":30}}\n");

        let (out, emit) = collector();
        relay_commands(&bridge, input.as_bytes(), Duration::from_secs(30), emit)
            .await
            .unwrap();

        for i in 1..=200 {
            let command = engine.recv().await;
            assert_eq!(command.id(), Some(format!("c{i}").as_str()));
            assert_eq!(command.timeout, Some(30_000));
        }
        let anonymous = engine.recv().await;
        assert!(anonymous.id().is_some_and(|id| !id.is_empty()));
        assert_eq!(anonymous.timeout, Some(250));

        assert!(out.lock().unwrap().iter().any(|v| v["event"] == "invalid_command"));

        engine.reply(&Message::with_id("load_image", "c7", json!({})), json!({"ok": true})).await;
        let response = wait_for_output(&out, "response", "c7").await;
        assert_eq!(response["message"]["data"]["ok"], true);
    }

    #[tokio::test]
    async fn unsent_commands_are_reported() {
        let (spawner, _engines) = FakeSpawner::new();
        let bridge =
            EngineBridge::new(BridgeConfig::new(EngineCommand::new("engine")).with_spawner(spawner));

        let (out, emit) = collector();
        let input = "{\"type\":\"load_image\",\"id\":\"early\",\"data\":{}}\n";
        relay_commands(&bridge, input.as_bytes(), Duration::from_secs(1), emit)
            .await
            .unwrap();

        let failed = wait_for_output(&out, "request_failed", "early").await;
        assert!(failed["error"].as_str().is_some_and(|e| e.contains("not running")));
    }
}
