//! Worker process.
//!
//! A worker owns the database pool, the notification listener, the metric
//! sync loop and the protocol servers. It reports heartbeats with its
//! resident memory on stdout (logs go to stderr) and takes shutdown
//! commands from stdin or directly via signals.

use crate::dispatch::Dispatcher;
use crate::handlers;
use crate::handlers::basics::API_VERSION;
use crate::state::{AppState, Shutdown};
use crate::{http, listener, metrics, notifications};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use validana_core::AppConfig;

/// Exit code telling the supervisor to hold the respawn for a while
/// (database unreachable and similar environment failures).
pub const STAY_DOWN_EXIT_CODE: i32 = 51;
/// Exit code for infrastructure failures (panics, lost runtime).
pub const FATAL_EXIT_CODE: i32 = 2;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// One heartbeat line on the worker's stdout.
#[derive(Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub memory_mb: i64,
}

/// One command line on the worker's stdin.
#[derive(Debug, Serialize, Deserialize)]
pub struct Command {
    pub shutdown: String,
}

/// Run the worker to completion, returning its exit code.
pub async fn run(config: AppConfig, worker_id: i32) -> i32 {
    match run_inner(config, worker_id).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, worker_id, "Worker startup failed");
            STAY_DOWN_EXIT_CODE
        }
    }
}

async fn run_inner(config: AppConfig, worker_id: i32) -> anyhow::Result<i32> {
    let store = validana_store::from_config(&config).await?;
    tracing::info!(worker_id, "Database pool ready");

    let state = AppState::new(config.clone(), store);
    let mut dispatcher = Dispatcher::new(&state.hubs);
    handlers::register(&mut dispatcher, API_VERSION, state.clone());
    state.set_dispatcher(Arc::new(dispatcher));

    // Channel notifications flow listener -> forwarder -> hub fanout.
    let (payload_tx, payload_rx) = mpsc::channel(256);
    let listener_task = validana_store::listener::spawn_forwarder(config.clone(), payload_tx);
    let fanout_task = notifications::spawn(state.clone(), payload_rx);

    if state.metrics.enabled() {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let known: Vec<i32> = (0..config.worker_count(cpus) as i32).collect();
        metrics::spawn_sync(
            state.metrics.clone(),
            state.store.clone(),
            worker_id,
            known,
        );
        tracing::info!(
            worker_id,
            interval_secs = config.metricsinterval,
            "Metrics sync enabled"
        );
    }

    spawn_heartbeat();
    spawn_command_reader(state.clone());
    spawn_signal_handlers(state.clone())?;

    let mut servers = Vec::new();
    if state.config.shared_port() {
        let router = http::router(state.clone(), true, true);
        servers.push(tokio::spawn(listener::serve(
            state.clone(),
            router,
            state.config.httpport,
        )));
    } else {
        let rest = http::router(state.clone(), true, false);
        servers.push(tokio::spawn(listener::serve(
            state.clone(),
            rest,
            state.config.httpport,
        )));
        let ws = http::router(state.clone(), false, true);
        servers.push(tokio::spawn(listener::serve(
            state.clone(),
            ws,
            state.config.wsport,
        )));
    }

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Listener ended with error"),
            Err(e) => tracing::error!(error = %e, "Listener task failed"),
        }
    }

    fanout_task.abort();
    listener_task.abort();
    state.store.close().await;
    tracing::info!(worker_id, "Worker drained and stopped");
    Ok(0)
}

/// Report resident memory to the supervisor every five seconds.
fn spawn_heartbeat() {
    tokio::spawn(async move {
        use std::io::Write;
        let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
        loop {
            interval.tick().await;
            let beat = Heartbeat {
                memory_mb: metrics::resident_memory_mb(),
            };
            let line = serde_json::to_string(&beat).expect("heartbeat serialises");
            let mut stdout = std::io::stdout();
            // stdout is a pipe under the supervisor; flush every line.
            if writeln!(stdout, "{line}").and_then(|_| stdout.flush()).is_err() {
                return;
            }
        }
    });
}

/// Take shutdown commands from the supervisor on stdin.
fn spawn_command_reader(state: Arc<AppState>) {
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<Command>(&line) {
                Ok(command) if command.shutdown == "graceful" => {
                    tracing::info!("Graceful shutdown requested");
                    state.request_shutdown(Shutdown::Graceful);
                }
                Ok(command) if command.shutdown == "hard" => {
                    tracing::info!("Hard shutdown requested");
                    state.request_shutdown(Shutdown::Hard);
                }
                _ => tracing::warn!(line, "Ignoring unknown supervisor command"),
            }
        }
    });
}

/// SIGINT drains gracefully, SIGTERM tears down hard.
fn spawn_signal_handlers(state: Arc<AppState>) -> anyhow::Result<()> {
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => state.request_shutdown(Shutdown::Graceful),
                _ = terminate.recv() => state.request_shutdown(Shutdown::Hard),
            }
        }
    });
    Ok(())
}
