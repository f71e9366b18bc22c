//! The `time` verb: timestamp of the latest block.

use crate::error::{ApiError, ApiResult};
use crate::message::Message;
use crate::state::AppState;
use serde_json::Value;
use std::sync::Arc;

/// Millisecond timestamp of the most recent block, served from a short
/// cache. An empty chain is a client-visible condition, not a failure.
pub async fn time(app: Arc<AppState>, _message: Arc<Message>) -> ApiResult<Value> {
    let cached = app.caches.time.get("time").await?;
    if cached.is_null() {
        return Err(ApiError::bad_request("No existing blocks found."));
    }
    Ok(cached)
}
