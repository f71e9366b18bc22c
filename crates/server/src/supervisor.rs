//! Process supervisor.
//!
//! The master re-executes its own binary once per worker with `--worker
//! <id>`, piping stdio: heartbeats with resident memory arrive on the
//! child's stdout every five seconds, shutdown commands go down its
//! stdin. A worker missing three consecutive heartbeat checks or
//! exceeding the memory limit is asked to shut down gracefully and
//! hard-killed ten seconds later if still alive. Exit codes in `[50, 60)`
//! are a worker's way of asking to stay down briefly before respawn.

use crate::state::Shutdown;
use crate::worker::{Command as WorkerCommand, Heartbeat};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::watch;
use validana_core::AppConfig;

/// Environment variable carrying the merged configuration to workers.
pub const WORKER_CONFIG_ENV: &str = "VSERVER_WORKER_CONFIG";

const CHECK_PERIOD: Duration = Duration::from_secs(5);
const MISS_LIMIT: u32 = 3;
const KILL_GRACE: Duration = Duration::from_secs(10);
const STAY_DOWN_DELAY: Duration = Duration::from_secs(30);
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Run the master until every worker has exited. Returns the process exit
/// code: zero when the shutdown stayed graceful throughout.
pub async fn run(config: AppConfig) -> anyhow::Result<i32> {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    let count = config.worker_count(cpus);
    let config_json = Arc::<str>::from(serde_json::to_string(&config)?);
    tracing::info!(workers = count, cpus, "Starting workers");

    let (shutdown_tx, _) = watch::channel(None::<Shutdown>);
    spawn_signal_listener(shutdown_tx.clone())?;

    let mut managers = Vec::with_capacity(count);
    for worker_id in 0..count as i32 {
        managers.push(tokio::spawn(manage_worker(
            worker_id,
            config_json.clone(),
            shutdown_tx.subscribe(),
        )));
    }

    let mut any_hard = false;
    for manager in managers {
        any_hard |= manager.await.unwrap_or(true);
    }
    any_hard |= *shutdown_tx.borrow() == Some(Shutdown::Hard);

    tracing::info!(hard = any_hard, "All workers exited");
    Ok(if any_hard { 1 } else { 0 })
}

/// SIGINT drains gracefully, SIGTERM tears down hard. Either way every
/// worker is told to stop.
fn spawn_signal_listener(shutdown: watch::Sender<Option<Shutdown>>) -> anyhow::Result<()> {
    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            let phase = tokio::select! {
                _ = interrupt.recv() => Shutdown::Graceful,
                _ = terminate.recv() => Shutdown::Hard,
            };
            tracing::info!(?phase, "Shutting down workers");
            let _ = shutdown.send(Some(phase));
        }
    });
    Ok(())
}

/// Keep one worker slot alive: spawn, monitor, respawn.
/// Returns whether this slot ever needed a hard kill.
async fn manage_worker(
    worker_id: i32,
    config_json: Arc<str>,
    mut shutdown: watch::Receiver<Option<Shutdown>>,
) -> bool {
    let mut ever_hard = false;

    loop {
        let mut child = match spawn_worker(worker_id, &config_json) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Could not spawn worker");
                if wait_respawn(RESPAWN_DELAY, &mut shutdown).await {
                    return ever_hard;
                }
                continue;
            }
        };

        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("stdout is piped");
        let memory_limit_mb = limit_mb(&config_json);

        // Heartbeats come through a channel so the select loop never holds
        // a partially read line across cancellations.
        let (beat_tx, mut beats) = tokio::sync::mpsc::channel::<Heartbeat>(16);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(beat) = serde_json::from_str::<Heartbeat>(&line) {
                    if beat_tx.send(beat).await.is_err() {
                        return;
                    }
                }
            }
        });

        let mut check = tokio::time::interval(CHECK_PERIOD);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        check.tick().await;

        let mut beat_seen = false;
        let mut stdout_open = true;
        let mut misses = 0u32;
        let mut kill_deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

        let status = loop {
            tokio::select! {
                biased;

                status = child.wait() => break status,

                _ = shutdown.changed() => {
                    let phase = *shutdown.borrow();
                    if let Some(phase) = phase {
                        let command = match phase {
                            Shutdown::Hard => "hard",
                            _ => "graceful",
                        };
                        send_command(&mut stdin, command).await;
                        if kill_deadline.is_none() {
                            kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
                        }
                    }
                }

                beat = beats.recv(), if stdout_open => {
                    match beat {
                        Some(beat) => {
                            beat_seen = true;
                            if memory_limit_mb != 0
                                && beat.memory_mb as u64 > memory_limit_mb
                                && kill_deadline.is_none()
                            {
                                tracing::warn!(
                                    worker_id,
                                    memory_mb = beat.memory_mb,
                                    limit_mb = memory_limit_mb,
                                    "Worker exceeds memory limit, recycling"
                                );
                                send_command(&mut stdin, "graceful").await;
                                kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
                            }
                        }
                        // stdout closed; child.wait() will resolve shortly.
                        None => stdout_open = false,
                    }
                }

                _ = check.tick() => {
                    if beat_seen {
                        misses = 0;
                    } else {
                        misses += 1;
                    }
                    beat_seen = false;
                    if misses >= MISS_LIMIT && kill_deadline.is_none() {
                        tracing::warn!(worker_id, misses, "Worker heartbeat lost, recycling");
                        send_command(&mut stdin, "graceful").await;
                        kill_deadline = Some(Box::pin(tokio::time::sleep(KILL_GRACE)));
                    }
                }

                _ = async { kill_deadline.as_mut().expect("guarded").as_mut().await },
                        if kill_deadline.is_some() => {
                    tracing::warn!(worker_id, "Worker did not exit in time, killing");
                    let _ = child.start_kill();
                    ever_hard = true;
                    kill_deadline = None;
                }
            }
        };

        let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
        tracing::info!(worker_id, code, "Worker exited");

        if shutdown.borrow().is_some() {
            return ever_hard;
        }

        // Codes in [50, 60) ask for a cool-down before respawn.
        let delay = if (50..60).contains(&code) {
            tracing::warn!(worker_id, code, "Worker asked to stay down briefly");
            STAY_DOWN_DELAY
        } else {
            RESPAWN_DELAY
        };
        if wait_respawn(delay, &mut shutdown).await {
            return ever_hard;
        }
    }
}

fn spawn_worker(worker_id: i32, config_json: &str) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    tokio::process::Command::new(exe)
        .arg("--worker")
        .arg(worker_id.to_string())
        .env(WORKER_CONFIG_ENV, config_json)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
}

async fn send_command(stdin: &mut Option<ChildStdin>, shutdown: &str) {
    if let Some(pipe) = stdin {
        let command = WorkerCommand {
            shutdown: shutdown.to_string(),
        };
        let mut line = serde_json::to_string(&command).expect("command serialises");
        line.push('\n');
        if pipe.write_all(line.as_bytes()).await.is_err() {
            // Worker already gone; wait() will report it.
        }
    }
}

/// Sleep out a respawn delay, returning early (true) if shutdown starts.
async fn wait_respawn(delay: Duration, shutdown: &mut watch::Receiver<Option<Shutdown>>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => shutdown.borrow().is_some(),
    }
}

/// The memory limit travels inside the serialized worker config.
fn limit_mb(config_json: &str) -> u64 {
    serde_json::from_str::<AppConfig>(config_json)
        .map(|c| c.maxmemory)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stay_down_range_matches_worker_codes() {
        assert!((50..60).contains(&crate::worker::STAY_DOWN_EXIT_CODE));
        assert!(!(50..60).contains(&crate::worker::FATAL_EXIT_CODE));
        assert!(!(50..60).contains(&0));
    }

    #[test]
    fn heartbeat_roundtrip() {
        let beat = Heartbeat { memory_mb: 87 };
        let line = serde_json::to_string(&beat).unwrap();
        let parsed: Heartbeat = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.memory_mb, 87);
    }
}
