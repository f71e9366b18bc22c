//! Per-worker metrics.
//!
//! Two metric groups land in `basics.metrics`. Total counters (request
//! outcomes, the latency and websocket-lifetime histograms) accumulate
//! locally and are added into the shared `worker = -1` rows on every sync,
//! then reset. Current gauges (memory, open websockets, last sync time)
//! are written under the worker's own id and replaced on every sync.
//!
//! Export reads the aggregated rows back from the store, so the numbers a
//! client sees always span all workers, including dead ones' totals.

use crate::error::{ApiError, ApiResult};
use crate::message::TransportKind;
use axum::http::StatusCode;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use validana_store::BasicsStore;
use validana_store::repos::AggregatedMetrics;

/// Upper bounds (ms) of the request latency histogram.
const LATENCY_BOUNDS_MS: [i64; 10] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
/// Upper bounds (s) of the websocket lifetime histogram.
const WS_BOUNDS_S: [i64; 6] = [10, 30, 60, 120, 300, 900];

const REQUEST_METRICS: [[&str; 2]; 3] = [
    ["requestsSuccessRest", "requestsSuccessWs"],
    ["requestsClientErrorRest", "requestsClientErrorWs"],
    ["requestsServerErrorRest", "requestsServerErrorWs"],
];

/// Renders aggregated rows into `(content_type, body)`.
pub type ExportFormatter = Arc<dyn Fn(&AggregatedMetrics) -> (String, String) + Send + Sync>;

/// Per-worker metric registers.
pub struct Metrics {
    interval: u32,
    requests: [[AtomicI64; 2]; 3],
    latency_buckets: [AtomicI64; 11],
    latency_total_ms: AtomicI64,
    ws_buckets: [AtomicI64; 7],
    ws_total_s: AtomicI64,
    ws_connections: AtomicI64,
    formatters: RwLock<HashMap<String, ExportFormatter>>,
}

impl Metrics {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            requests: Default::default(),
            latency_buckets: Default::default(),
            latency_total_ms: AtomicI64::new(0),
            ws_buckets: Default::default(),
            ws_total_s: AtomicI64::new(0),
            ws_connections: AtomicI64::new(0),
            formatters: RwLock::new(HashMap::new()),
        }
    }

    /// Whether metric gathering is configured at all.
    pub fn enabled(&self) -> bool {
        self.interval > 0
    }

    /// The configured sync interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval as u64)
    }

    /// Count a finished request by status class and transport.
    pub fn record_response(&self, transport: TransportKind, status: StatusCode) {
        let class = if status.is_server_error() {
            2
        } else if status.is_client_error() {
            1
        } else {
            0
        };
        let transport = match transport {
            TransportKind::Rest => 0,
            TransportKind::Ws => 1,
        };
        self.requests[class][transport].fetch_add(1, Ordering::Relaxed);
    }

    /// Record an end-to-end request latency.
    pub fn record_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as i64;
        let bucket = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// A websocket connected.
    pub fn record_ws_open(&self) {
        self.ws_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A websocket closed after `lifetime`.
    pub fn record_ws_close(&self, lifetime: Duration) {
        self.ws_connections.fetch_sub(1, Ordering::Relaxed);
        let secs = lifetime.as_secs() as i64;
        let bucket = WS_BOUNDS_S
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(WS_BOUNDS_S.len());
        self.ws_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.ws_total_s.fetch_add(secs, Ordering::Relaxed);
    }

    /// Register a custom export format.
    pub fn register_formatter(&self, format: impl Into<String>, formatter: ExportFormatter) {
        self.formatters
            .write()
            .expect("formatter lock poisoned")
            .insert(format.into(), formatter);
    }

    /// Snapshot the total counters for a sync.
    pub fn totals_snapshot(&self) -> Vec<(String, i64)> {
        let mut totals = Vec::new();
        for (class, transports) in REQUEST_METRICS.iter().enumerate() {
            for (transport, name) in transports.iter().enumerate() {
                totals.push((
                    name.to_string(),
                    self.requests[class][transport].load(Ordering::Relaxed),
                ));
            }
        }
        for (i, bucket) in self.latency_buckets.iter().enumerate() {
            totals.push((latency_metric_name(i), bucket.load(Ordering::Relaxed)));
        }
        totals.push((
            "latencyTotal".to_string(),
            self.latency_total_ms.load(Ordering::Relaxed),
        ));
        for (i, bucket) in self.ws_buckets.iter().enumerate() {
            totals.push((ws_metric_name(i), bucket.load(Ordering::Relaxed)));
        }
        totals.push((
            "websocketTotal".to_string(),
            self.ws_total_s.load(Ordering::Relaxed),
        ));
        totals
    }

    /// Subtract a persisted snapshot from the counters. Increments that
    /// happened during the sync survive into the next one.
    pub fn commit_totals(&self, snapshot: &[(String, i64)]) {
        for (name, value) in snapshot {
            if *value == 0 {
                continue;
            }
            if let Some(counter) = self.counter_by_name(name) {
                counter.fetch_sub(*value, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot the current gauges for a sync.
    pub fn currents_snapshot(&self, memory_mb: i64, now_ms: i64) -> Vec<(String, i64)> {
        vec![
            ("memory".to_string(), memory_mb),
            (
                "wsConnections".to_string(),
                self.ws_connections.load(Ordering::Relaxed),
            ),
            ("lastSync".to_string(), now_ms),
        ]
    }

    fn counter_by_name(&self, name: &str) -> Option<&AtomicI64> {
        for (class, transports) in REQUEST_METRICS.iter().enumerate() {
            for (transport, candidate) in transports.iter().enumerate() {
                if *candidate == name {
                    return Some(&self.requests[class][transport]);
                }
            }
        }
        for i in 0..self.latency_buckets.len() {
            if latency_metric_name(i) == name {
                return Some(&self.latency_buckets[i]);
            }
        }
        if name == "latencyTotal" {
            return Some(&self.latency_total_ms);
        }
        for i in 0..self.ws_buckets.len() {
            if ws_metric_name(i) == name {
                return Some(&self.ws_buckets[i]);
            }
        }
        if name == "websocketTotal" {
            return Some(&self.ws_total_s);
        }
        None
    }

    /// Render the aggregated store rows in `format`.
    pub async fn export(
        &self,
        store: &dyn BasicsStore,
        format: &str,
        include_defaults: bool,
    ) -> ApiResult<(String, String)> {
        if !self.enabled() {
            return Err(ApiError::bad_request("Gathering metrics is disabled."));
        }

        let mut data = store.aggregated_metrics().await?;
        if !include_defaults {
            let builtin: Vec<String> = builtin_metric_names();
            data.totals.retain(|name, _| !builtin.contains(name));
            data.currents.retain(|name, _| !builtin.contains(name));
        }

        match format {
            "json" => Ok(json_export(&data)),
            "prometheus" => Ok(prometheus_export(&data)),
            other => {
                let formatter = self
                    .formatters
                    .read()
                    .expect("formatter lock poisoned")
                    .get(other)
                    .cloned();
                match formatter {
                    Some(formatter) => Ok(formatter(&data)),
                    None => Err(ApiError::bad_request(format!("Unknown format: {other}."))),
                }
            }
        }
    }
}

fn latency_metric_name(bucket: usize) -> String {
    match LATENCY_BOUNDS_MS.get(bucket) {
        Some(bound) => format!("latency{bound}"),
        None => "latencyInf".to_string(),
    }
}

fn ws_metric_name(bucket: usize) -> String {
    match WS_BOUNDS_S.get(bucket) {
        Some(bound) => format!("websocket{bound}"),
        None => "websocketInf".to_string(),
    }
}

fn builtin_metric_names() -> Vec<String> {
    let mut names: Vec<String> = REQUEST_METRICS
        .iter()
        .flatten()
        .map(|s| s.to_string())
        .collect();
    for i in 0..=LATENCY_BOUNDS_MS.len() {
        names.push(latency_metric_name(i));
    }
    names.push("latencyTotal".to_string());
    for i in 0..=WS_BOUNDS_S.len() {
        names.push(ws_metric_name(i));
    }
    names.push("websocketTotal".to_string());
    names.extend(["memory", "wsConnections", "lastSync"].map(String::from));
    names
}

/// `json` built-in: the aggregated rows as a nested object.
fn json_export(data: &AggregatedMetrics) -> (String, String) {
    let body = json!({
        "totals": data.totals,
        "currents": data.currents,
    });
    ("application/json".to_string(), body.to_string())
}

/// `prometheus` built-in: text exposition with cumulative histograms.
fn prometheus_export(data: &AggregatedMetrics) -> (String, String) {
    let mut body = String::new();
    let total = |name: &str| data.totals.get(name).copied().unwrap_or(0);

    body.push_str("# TYPE validana_requests_total counter\n");
    for (class, label) in [(0, "success"), (1, "client_error"), (2, "server_error")] {
        for (transport, tlabel) in [(0, "rest"), (1, "ws")] {
            body.push_str(&format!(
                "validana_requests_total{{result=\"{label}\",transport=\"{tlabel}\"}} {}\n",
                total(REQUEST_METRICS[class][transport])
            ));
        }
    }

    body.push_str("# TYPE validana_latency histogram\n");
    let mut cumulative = 0;
    for (i, bound) in LATENCY_BOUNDS_MS.iter().enumerate() {
        cumulative += total(&latency_metric_name(i));
        body.push_str(&format!(
            "validana_latency_bucket{{le=\"{bound}\"}} {cumulative}\n"
        ));
    }
    cumulative += total("latencyInf");
    body.push_str(&format!(
        "validana_latency_bucket{{le=\"+Inf\"}} {cumulative}\n"
    ));
    body.push_str(&format!("validana_latency_sum {}\n", total("latencyTotal")));
    body.push_str(&format!("validana_latency_count {cumulative}\n"));

    body.push_str("# TYPE validana_websocket_duration histogram\n");
    let mut cumulative = 0;
    for (i, bound) in WS_BOUNDS_S.iter().enumerate() {
        cumulative += total(&ws_metric_name(i));
        body.push_str(&format!(
            "validana_websocket_duration_bucket{{le=\"{bound}\"}} {cumulative}\n"
        ));
    }
    cumulative += total("websocketInf");
    body.push_str(&format!(
        "validana_websocket_duration_bucket{{le=\"+Inf\"}} {cumulative}\n"
    ));
    body.push_str(&format!(
        "validana_websocket_duration_sum {}\n",
        total("websocketTotal")
    ));
    body.push_str(&format!("validana_websocket_duration_count {cumulative}\n"));

    // Custom totals registered by other modules.
    let builtin = builtin_metric_names();
    let mut custom: Vec<(&String, &i64)> = data
        .totals
        .iter()
        .filter(|(name, _)| !builtin.contains(name))
        .collect();
    custom.sort_by_key(|(name, _)| name.as_str());
    for (name, value) in custom {
        let name = sanitize_metric_name(name);
        body.push_str(&format!("# TYPE validana_{name}_total counter\n"));
        body.push_str(&format!("validana_{name}_total {value}\n"));
    }

    // Current gauges, one sample per worker.
    let mut currents: Vec<(&String, &Value)> = data.currents.iter().collect();
    currents.sort_by_key(|(name, _)| name.as_str());
    for (name, rows) in currents {
        let name = sanitize_metric_name(name);
        body.push_str(&format!("# TYPE validana_{name} gauge\n"));
        if let Some(rows) = rows.as_array() {
            for row in rows {
                let worker = row.get("worker").and_then(Value::as_i64).unwrap_or(0);
                let value = row.get("value").and_then(Value::as_i64).unwrap_or(0);
                body.push_str(&format!(
                    "validana_{name}{{worker=\"{worker}\"}} {value}\n"
                ));
            }
        }
    }

    ("text/plain; charset=UTF-8".to_string(), body)
}

/// camelCase metric names become snake_case samples.
fn sanitize_metric_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}

/// Resident memory of this process in MB.
pub fn resident_memory_mb() -> i64 {
    let mut system = System::new();
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|p| (p.memory() / (1024 * 1024)) as i64)
        .unwrap_or(0)
}

/// Spawn the periodic sync loop for this worker. `known_workers` is the
/// full id range the supervisor manages; on the first successful sync,
/// current rows of any other worker id are deleted.
pub fn spawn_sync(
    metrics: Arc<Metrics>,
    store: Arc<dyn BasicsStore>,
    worker_id: i32,
    known_workers: Vec<i32>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would sync an empty snapshot.
        interval.tick().await;

        let mut cleaned_stale_rows = false;
        loop {
            interval.tick().await;

            let totals = metrics.totals_snapshot();
            let now_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
            let currents = metrics.currents_snapshot(resident_memory_mb(), now_ms);

            match store.sync_metrics(worker_id, &totals, &currents).await {
                Ok(()) => {
                    metrics.commit_totals(&totals);
                    if !cleaned_stale_rows {
                        cleaned_stale_rows = true;
                        match store.delete_stale_workers(&known_workers).await {
                            Ok(0) => {}
                            Ok(removed) => tracing::info!(
                                removed,
                                "Removed current metrics of departed workers"
                            ),
                            Err(e) => {
                                tracing::warn!(error = %e, "Could not clean stale metric rows")
                            }
                        }
                    }
                }
                Err(e) => {
                    // Totals stay in place and land with the next sync.
                    tracing::warn!(error = %e, "Metrics sync failed");
                }
            }
        }
    })
}
