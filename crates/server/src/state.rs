//! Worker state shared across protocols and handlers.

use crate::dispatch::Dispatcher;
use crate::metrics::Metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use validana_core::{AppConfig, Cache, ConnectionId, HubRegistry};
use validana_store::BasicsStore;

/// Shutdown phases broadcast to every protocol task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    Running,
    /// Stop accepting, drain in-flight work, close sockets politely.
    Graceful,
    /// Terminate now; sockets get a short grace then are destroyed.
    Hard,
}

/// The caches the built-in handlers serve from.
pub struct GatewayCaches {
    /// Contract descriptors keyed by type ("" = all), swept periodically.
    pub contracts: Arc<Cache>,
    /// Latest block timestamp under the single key "time".
    pub time: Arc<Cache>,
}

impl GatewayCaches {
    pub fn new() -> Self {
        Self {
            contracts: Cache::create("contracts", Duration::from_secs(300)),
            time: Arc::new(Cache::new("time")),
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn BasicsStore>,
    pub hubs: Arc<HubRegistry>,
    pub metrics: Arc<Metrics>,
    pub caches: GatewayCaches,
    /// Set once after the dispatcher is built (handlers hold the state).
    dispatcher: OnceLock<Arc<Dispatcher>>,
    next_conn_id: AtomicU64,
    shutdown: watch::Sender<Shutdown>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn BasicsStore>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(Shutdown::Running);
        validana_core::cache::set_enabled(config.caching);
        let metrics = Arc::new(Metrics::new(config.metricsinterval));
        Arc::new(Self {
            config: Arc::new(config),
            store,
            hubs: Arc::new(HubRegistry::new()),
            metrics,
            caches: GatewayCaches::new(),
            dispatcher: OnceLock::new(),
            next_conn_id: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Install the dispatcher after registration. Panics if set twice.
    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        if self.dispatcher.set(dispatcher).is_err() {
            panic!("dispatcher already installed");
        }
    }

    /// The verb registry. Panics before `set_dispatcher`.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.dispatcher.get().expect("dispatcher not installed")
    }

    /// Allocate a connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribe to shutdown phase changes.
    pub fn shutdown_watch(&self) -> watch::Receiver<Shutdown> {
        self.shutdown.subscribe()
    }

    /// The current shutdown phase.
    pub fn shutdown_phase(&self) -> Shutdown {
        *self.shutdown.borrow()
    }

    /// Advance the shutdown phase. Going back to `Running` is not possible;
    /// `Hard` wins over `Graceful`.
    pub fn request_shutdown(&self, phase: Shutdown) {
        self.shutdown.send_if_modified(|current| match (*current, phase) {
            (Shutdown::Running, Shutdown::Graceful | Shutdown::Hard) => {
                *current = phase;
                true
            }
            (Shutdown::Graceful, Shutdown::Hard) => {
                *current = Shutdown::Hard;
                true
            }
            _ => false,
        });
    }
}
