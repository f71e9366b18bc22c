//! PostgreSQL access for the Validana gateway.
//!
//! This crate provides the data-plane model shared with the processor:
//! - Transaction rows inserted with status `new` and read back once marked
//! - Blocks and contract descriptors (read-only)
//! - Per-worker metric rows
//! - The `LISTEN blocks` notification stream on a dedicated connection

pub mod error;
pub mod listener;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use postgres::PostgresStore;
pub use store::BasicsStore;

use std::sync::Arc;
use validana_core::AppConfig;

/// Open the store from configuration, optionally bootstrapping the schema.
pub async fn from_config(config: &AppConfig) -> StoreResult<Arc<dyn BasicsStore>> {
    let store = PostgresStore::connect(config).await?;
    if config.dbschema {
        store.migrate().await?;
    }
    store.health_check().await?;
    Ok(Arc::new(store) as Arc<dyn BasicsStore>)
}
