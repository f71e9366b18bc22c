//! Transaction repository trait.

use crate::error::StoreResult;
use crate::models::{NewTransaction, TransactionRow};
use async_trait::async_trait;

/// Repository for `basics.transactions`.
///
/// The gateway only ever inserts rows with status `new`; everything else on
/// this table is written by the processor.
#[async_trait]
pub trait TransactionRepo: Send + Sync {
    /// Insert a fresh submission. Fails with `AlreadyExists` when the id is
    /// already present.
    async fn insert_transaction(&self, tx: &NewTransaction) -> StoreResult<()>;

    /// Fetch a single transaction by id.
    async fn get_transaction(&self, transaction_id: &[u8]) -> StoreResult<Option<TransactionRow>>;

    /// Fetch every transaction whose id is in `transaction_ids`.
    /// Unknown ids are simply absent from the result.
    async fn get_transactions_by_ids(
        &self,
        transaction_ids: &[Vec<u8>],
    ) -> StoreResult<Vec<TransactionRow>>;

    /// Fetch the rows the processor marked at exactly `processed_ts`,
    /// in block position order.
    async fn get_transactions_processed_at(
        &self,
        processed_ts: i64,
    ) -> StoreResult<Vec<TransactionRow>>;
}
