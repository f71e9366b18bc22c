//! The `contracts` verb: list smart contract descriptors.

use super::basics::body_object;
use crate::error::{ApiError, ApiResult};
use crate::message::Message;
use crate::state::AppState;
use serde_json::Value;
use std::sync::Arc;

/// Serve contract descriptors from the contracts cache. The body is
/// `{type?}` or a bare type string; no type means every contract.
pub async fn contracts(app: Arc<AppState>, message: Arc<Message>) -> ApiResult<Value> {
    let contract_type = match &message.data {
        Value::String(contract_type) => contract_type.clone(),
        data => {
            let body = body_object(data)?;
            match body.get("type") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(contract_type)) => contract_type.clone(),
                Some(_) => return Err(ApiError::bad_request("Missing or invalid type.")),
            }
        }
    };

    Ok(app.caches.contracts.get(&contract_type).await?)
}
