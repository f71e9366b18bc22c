//! The `metrics` verb: export aggregated metrics.

use super::basics::{body_object, require_str};
use crate::error::{ApiError, ApiResult};
use crate::message::Message;
use crate::state::AppState;
use serde_json::Value;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Export the cross-worker metric rows. Requires the configured bearer
/// token; the comparison is constant time so the token cannot be probed
/// byte by byte.
pub async fn metrics(app: Arc<AppState>, message: Arc<Message>) -> ApiResult<Value> {
    let body = body_object(&message.data)?;
    let format = require_str(&body, "format")?;
    let token = require_str(&body, "token")?;

    let matches: bool = token
        .as_bytes()
        .ct_eq(app.config.metricstoken.as_bytes())
        .into();
    if !matches {
        return Err(ApiError::unauthorized("Invalid token."));
    }

    // Export latency is dominated by the database aggregate; keep it out
    // of the request histogram.
    message.clear_latency();

    let (content_type, export) = app
        .metrics
        .export(app.store.as_ref(), &format, true)
        .await?;
    message.set_header("Content-Type", content_type);
    Ok(Value::String(export))
}
