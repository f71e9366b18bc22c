//! Metrics repository trait.

use crate::error::StoreResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Cross-worker metric rows aggregated for export.
#[derive(Clone, Debug, Default)]
pub struct AggregatedMetrics {
    /// Total counters: the single `worker = -1` row per metric.
    pub totals: HashMap<String, i64>,
    /// Current gauges: per-metric JSON array of `{worker, value}` objects.
    pub currents: HashMap<String, Value>,
}

/// Repository for `basics.metrics`.
#[async_trait]
pub trait MetricsRepo: Send + Sync {
    /// Persist one worker's snapshot atomically: totals are added into the
    /// shared `worker = -1` rows, currents replace the worker's own rows.
    async fn sync_metrics(
        &self,
        worker: i32,
        totals: &[(String, i64)],
        currents: &[(String, i64)],
    ) -> StoreResult<()>;

    /// Delete current rows left behind by workers not in `known_workers`.
    async fn delete_stale_workers(&self, known_workers: &[i32]) -> StoreResult<u64>;

    /// Read the aggregated rows for export.
    async fn aggregated_metrics(&self) -> StoreResult<AggregatedMetrics>;
}
