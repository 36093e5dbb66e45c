use std::process;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::io::BufReader;

use engine_bridge::relay;
use engine_bridge::{BridgeConfig, EngineBridge, EngineCommand, Message, MessageType, VersionInfo};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Engine events echoed to stdout.
const ECHOED_EVENTS: [MessageType; 4] = [
    MessageType::StatusUpdate,
    MessageType::MetricsUpdate,
    MessageType::Error,
    MessageType::StartupComplete,
];

struct CliArgs {
    timeout: Duration,
    program: String,
    engine_args: Vec<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let cli = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: engine-bridge [--timeout-ms N] <program> [args...]");
            eprintln!();
            eprintln!("Reads JSON commands from stdin, one per line, and prints engine");
            eprintln!("events and command outcomes to stdout as JSON lines.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --timeout-ms <n>  Reply timeout for commands without one [default: 30000]");
            process::exit(2);
        }
    };

    engine_bridge::logging::init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut timeout_ms = DEFAULT_TIMEOUT_MS;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--timeout-ms" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout-ms requires a value")?;
                timeout_ms = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout-ms value: {raw}"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            // Everything from the program on belongs to the engine.
            program => {
                return Ok(CliArgs {
                    timeout: Duration::from_millis(timeout_ms),
                    program: program.to_string(),
                    engine_args: args[i + 1..].to_vec(),
                });
            }
        }
        i += 1;
    }

    Err("missing required argument: <program>".to_string())
}

fn emit(value: serde_json::Value) {
    println!("{value}");
}

async fn run(cli: CliArgs) -> anyhow::Result<()> {
    emit(json!({ "event": "bridge_started", "version": VersionInfo::new() }));

    let command = EngineCommand::new(&cli.program).args(&cli.engine_args);
    let bridge = EngineBridge::new(BridgeConfig::from_env(command));

    for kind in ECHOED_EVENTS {
        bridge
            .subscribe(kind, |msg: &Message| {
                emit(json!({ "event": "engine_message", "message": msg }));
            })
            .detach();
    }
    bridge
        .subscribe(MessageType::StartupComplete, |msg: &Message| {
            let version = VersionInfo::new().with_startup(msg);
            if version.engine.is_some() {
                emit(json!({ "event": "engine_version", "version": version }));
            }
        })
        .detach();

    let mut events = bridge.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_value(&event) {
                    Ok(value) => emit(value),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize bridge event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Lifecycle events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    bridge
        .start_engine()
        .await
        .with_context(|| format!("could not start {}", cli.program))?;

    relay::relay_commands(
        &bridge,
        BufReader::new(tokio::io::stdin()),
        cli.timeout,
        emit,
    )
    .await
    .context("failed to read stdin")?;

    tracing::info!("stdin closed, stopping engine");
    bridge.dispose().await;
    Ok(())
}
