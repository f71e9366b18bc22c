//! Store abstraction.

use crate::error::StoreResult;
use crate::repos::{BlockRepo, ContractRepo, MetricsRepo, TransactionRepo};
use async_trait::async_trait;

/// The complete store interface consumed by the server.
///
/// Production uses [`crate::PostgresStore`]; the server's integration tests
/// provide an in-memory implementation.
#[async_trait]
pub trait BasicsStore:
    TransactionRepo + BlockRepo + ContractRepo + MetricsRepo + Send + Sync
{
    /// Create the `basics` schema objects if absent.
    async fn migrate(&self) -> StoreResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> StoreResult<()>;

    /// Drain and close the underlying connections. Called on graceful
    /// worker shutdown after the protocols finish.
    async fn close(&self) {}
}
