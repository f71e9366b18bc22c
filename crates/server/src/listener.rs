//! Listening server.
//!
//! One TCP listener per configured port, optionally TLS. The certificate
//! file is polled and hot-swapped on change; a swap that fails to parse
//! keeps the previous secure context. Accept-loop failures restart the
//! listener under exponential back-off until a permanent shutdown is
//! requested. Shutdown phases map onto the server handle: graceful drains
//! connections without a deadline, hard gives them five seconds.

use crate::state::{AppState, Shutdown};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::TokioTimer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Sockets may idle this long before their first request.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(120);
/// Grace given to open connections on a non-graceful shutdown.
const HARD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Certificate files are polled at this period (doubles as the debounce).
const CERT_POLL_PERIOD: Duration = Duration::from_secs(5);

const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Serve `router` on `port` until shutdown. Returns once the listener has
/// fully stopped.
pub async fn serve(app: Arc<AppState>, router: Router, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let tls = if app.config.tls {
        let config = RustlsConfig::from_pem_file(&app.config.certpath, &app.config.keypath)
            .await
            .map_err(|e| anyhow::anyhow!("could not load TLS key material: {e}"))?;
        spawn_cert_watcher(
            config.clone(),
            PathBuf::from(&app.config.certpath),
            PathBuf::from(&app.config.keypath),
        );
        Some(config)
    } else {
        None
    };

    let mut backoff = BACKOFF_INITIAL;
    loop {
        let handle = Handle::new();
        let shutdown_task = tokio::spawn(propagate_shutdown(app.clone(), handle.clone()));

        tracing::info!(%addr, tls = tls.is_some(), "Listening");
        let make = router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>();
        let served = match &tls {
            Some(tls) => {
                let mut server = axum_server::bind_rustls(addr, tls.clone()).handle(handle.clone());
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(HEADER_READ_TIMEOUT);
                server.serve(make).await
            }
            None => {
                let mut server = axum_server::bind(addr).handle(handle.clone());
                server
                    .http_builder()
                    .http1()
                    .timer(TokioTimer::new())
                    .header_read_timeout(HEADER_READ_TIMEOUT);
                server.serve(make).await
            }
        };
        shutdown_task.abort();

        if app.shutdown_phase() != Shutdown::Running {
            // Permanent shutdown; no restart follows.
            return served.map_err(Into::into);
        }

        match served {
            Ok(()) => tracing::warn!(%addr, "Listener stopped unexpectedly, restarting"),
            Err(e) => tracing::warn!(%addr, error = %e, "Listener failed, restarting"),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Map shutdown phases onto the axum-server handle.
async fn propagate_shutdown(app: Arc<AppState>, handle: Handle) {
    let mut shutdown = app.shutdown_watch();
    loop {
        match *shutdown.borrow_and_update() {
            Shutdown::Running => {}
            Shutdown::Graceful => {
                handle.graceful_shutdown(None);
                // A later hard request still shortens the drain.
            }
            Shutdown::Hard => {
                handle.graceful_shutdown(Some(HARD_SHUTDOWN_GRACE));
                return;
            }
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Poll the certificate file and hot-swap the secure context on change.
fn spawn_cert_watcher(config: RustlsConfig, certpath: PathBuf, keypath: PathBuf) {
    tokio::spawn(async move {
        let mut last_modified = modified(&certpath);
        let mut interval = tokio::time::interval(CERT_POLL_PERIOD);
        interval.tick().await;
        loop {
            interval.tick().await;
            let current = modified(&certpath);
            if current == last_modified {
                continue;
            }
            last_modified = current;
            match config.reload_from_pem_file(&certpath, &keypath).await {
                Ok(()) => tracing::info!(cert = %certpath.display(), "Reloaded TLS certificate"),
                // The old context stays active.
                Err(e) => tracing::warn!(
                    cert = %certpath.display(),
                    error = %e,
                    "Certificate reload failed, previous certificate retained"
                ),
            }
        }
    });
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
