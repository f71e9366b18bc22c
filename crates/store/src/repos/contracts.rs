//! Contract repository trait.

use crate::error::StoreResult;
use crate::models::ContractRow;
use async_trait::async_trait;

/// Repository for `basics.contracts` (read-only on this side).
#[async_trait]
pub trait ContractRepo: Send + Sync {
    /// All known contracts.
    async fn list_contracts(&self) -> StoreResult<Vec<ContractRow>>;

    /// Contracts of one type. Multiple versions of a type may coexist.
    async fn get_contracts_by_type(&self, contract_type: &str) -> StoreResult<Vec<ContractRow>>;
}
