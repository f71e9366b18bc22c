//! Validana gateway binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Json};
use validana_core::{AppConfig, ENV_PREFIX};
use validana_server::worker::FATAL_EXIT_CODE;
use validana_server::{logging, supervisor, worker};

/// Validana - permissioned blockchain client gateway
#[derive(Parser, Debug)]
#[command(name = "validanad")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    config: Option<String>,

    /// Internal: run as a worker with the given id
    #[arg(long, hide = true)]
    worker: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let exit = match args.worker {
        Some(worker_id) => worker_main(worker_id).await?,
        None => master_main(args.config.as_deref()).await?,
    };
    std::process::exit(exit)
}

/// Worker mode: the merged configuration arrives through the environment,
/// already validated by the master.
async fn worker_main(worker_id: i32) -> Result<i32> {
    let raw = std::env::var(supervisor::WORKER_CONFIG_ENV)
        .context("worker started without configuration; run without --worker")?;
    let config: AppConfig =
        serde_json::from_str(&raw).context("invalid worker configuration")?;

    logging::init(&config);
    install_panic_hook(config.sentryurl.clone());
    tracing::info!(worker_id, "Worker starting");

    Ok(worker::run(config, worker_id).await)
}

/// Master mode: merge defaults, the JSON configuration file and the
/// environment, validate, then supervise workers.
async fn master_main(config_path: Option<&str>) -> Result<i32> {
    let mut figment = Figment::new();
    if let Some(path) = config_path {
        figment = figment.merge(Json::file(path));
    }
    let config: AppConfig = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|problems| anyhow::anyhow!("invalid configuration: {problems}"))?;

    logging::init(&config);
    tracing::info!("Validana gateway v{}", env!("CARGO_PKG_VERSION"));

    supervisor::run(config).await
}

/// Uncaught panics are infrastructure errors: log (scrubbed by the
/// facade) and exit with the code the supervisor respawns on.
fn install_panic_hook(sentryurl: String) {
    std::panic::set_hook(Box::new(move |info| {
        if sentryurl.is_empty() {
            tracing::error!(panic = %info, "Fatal error, terminating worker");
        } else {
            tracing::error!(panic = %info, sentry_url = %sentryurl, "Fatal error, terminating worker");
        }
        std::process::exit(FATAL_EXIT_CODE);
    }));
}
