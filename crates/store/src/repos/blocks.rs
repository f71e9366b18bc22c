//! Block repository trait.

use crate::error::StoreResult;
use crate::models::BlockRow;
use async_trait::async_trait;

/// Repository for `basics.blocks` (read-only on this side).
#[async_trait]
pub trait BlockRepo: Send + Sync {
    /// The most recent block, if any exists yet.
    async fn latest_block(&self) -> StoreResult<Option<BlockRow>>;
}
