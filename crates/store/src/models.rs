//! Row models for the `basics` schema.
//!
//! The schema is shared with the processor: this side inserts transactions
//! with status `new` and reads them back once the processor has marked
//! them; blocks and contracts are read-only here.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::FromRow;
use validana_core::tx::hex_encode;

/// Processing status of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Inserted by the gateway, not yet picked up.
    New,
    /// Structurally unusable for the processor.
    Invalid,
    /// Executed and included in a block.
    Accepted,
    /// Executed and rejected by the contract.
    Rejected,
}

impl TxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Invalid => "invalid",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "new" => Ok(Self::New),
            "invalid" => Ok(Self::Invalid),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(StoreError::InvalidRow(format!(
                "unknown transaction status '{other}'"
            ))),
        }
    }

    /// Whether the processor is done with this transaction.
    pub fn is_processed(self) -> bool {
        !matches!(self, Self::New)
    }
}

/// A row of `basics.transactions`.
#[derive(Clone, Debug, FromRow)]
pub struct TransactionRow {
    pub transaction_id: Vec<u8>,
    pub version: i16,
    pub contract_hash: Vec<u8>,
    pub valid_till: i64,
    pub payload: String,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub create_ts: Option<i64>,
    pub block_id: Option<i64>,
    pub position_in_block: Option<i32>,
    pub processed_ts: Option<i64>,
    pub status: String,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub contract_type: Option<String>,
    pub message: Option<String>,
}

impl TransactionRow {
    /// The transaction id as lower-case hex.
    pub fn id_hex(&self) -> String {
        hex_encode(&self.transaction_id)
    }

    /// Parsed status; rows written by the processor always parse.
    pub fn tx_status(&self) -> StoreResult<TxStatus> {
        TxStatus::parse(&self.status)
    }

    /// Full response shape for the `transaction` verb.
    pub fn api_json(&self) -> Value {
        json!({
            "id": self.id_hex(),
            "version": self.version,
            "contractHash": hex_encode(&self.contract_hash),
            "validTill": self.valid_till,
            "payload": self.payload,
            "publicKey": hex_encode(&self.public_key),
            "createTs": self.create_ts,
            "blockId": self.block_id,
            "positionInBlock": self.position_in_block,
            "processedTs": self.processed_ts,
            "status": self.status,
            "sender": self.sender,
            "receiver": self.receiver,
            "contractType": self.contract_type,
            "message": self.message,
        })
    }

    /// Reduced `{id, status, message}` shape for the `txStatus` verb.
    pub fn status_json(&self) -> Value {
        json!({
            "id": self.id_hex(),
            "status": self.status,
            "message": self.message,
        })
    }
}

/// A fresh submission, inserted with status `new`.
#[derive(Clone, Debug)]
pub struct NewTransaction {
    pub transaction_id: Vec<u8>,
    pub version: i16,
    pub contract_hash: Vec<u8>,
    pub valid_till: i64,
    pub payload: String,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub create_ts: i64,
}

/// A row of `basics.blocks` (read-only here).
#[derive(Clone, Debug, FromRow)]
pub struct BlockRow {
    pub block_id: i64,
    pub version: i16,
    pub previous_block_hash: Vec<u8>,
    pub processed_ts: i64,
    pub transactions: Vec<u8>,
    pub transactions_amount: i32,
    pub signature: Vec<u8>,
}

/// A row of `basics.contracts` (read-only here).
#[derive(Clone, Debug, FromRow)]
pub struct ContractRow {
    pub contract_hash: Vec<u8>,
    pub contract_type: String,
    pub contract_version: String,
    pub description: String,
    pub contract_template: Value,
    pub validana_version: i32,
}

impl ContractRow {
    /// Descriptor shape served by the `contracts` verb.
    pub fn api_json(&self) -> Value {
        json!({
            "hash": hex_encode(&self.contract_hash),
            "type": self.contract_type,
            "version": self.contract_version,
            "description": self.description,
            "template": self.contract_template,
            "validanaVersion": self.validana_version,
        })
    }
}

/// A row of `basics.metrics`, keyed on `(metric, worker)`.
/// Cross-worker totals use `worker = -1`; per-worker gauges use the real id.
#[derive(Clone, Debug, FromRow)]
pub struct MetricRow {
    pub metric: String,
    pub worker: i32,
    pub value: i64,
}

/// Payload of the `blocks` notification channel.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BlockNotification {
    /// Millisecond timestamp the processor stamped on the processed rows.
    pub ts: i64,
    /// Number of regular transactions processed, when known.
    #[serde(default)]
    pub txs: Option<i64>,
    /// Number of other (system) transactions processed.
    #[serde(default)]
    pub other: i64,
    /// The block id, when the notification carries it.
    #[serde(default)]
    pub block: Option<i64>,
}

impl BlockNotification {
    /// Whether the notification announces any processed work.
    pub fn has_work(&self) -> bool {
        self.txs.unwrap_or(0) > 0 || self.other != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> TransactionRow {
        TransactionRow {
            transaction_id: vec![0xff, 0x00],
            version: 1,
            contract_hash: vec![0xaa],
            valid_till: 0,
            payload: "{}".to_string(),
            signature: vec![],
            public_key: vec![],
            create_ts: Some(1),
            block_id: Some(4),
            position_in_block: Some(0),
            processed_ts: Some(2),
            status: "accepted".to_string(),
            sender: Some("alice".to_string()),
            receiver: None,
            contract_type: Some("transfer".to_string()),
            message: None,
        }
    }

    #[test]
    fn status_parse_roundtrip() {
        for status in [
            TxStatus::New,
            TxStatus::Invalid,
            TxStatus::Accepted,
            TxStatus::Rejected,
        ] {
            assert_eq!(TxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TxStatus::parse("gone").is_err());
        assert!(!TxStatus::New.is_processed());
        assert!(TxStatus::Rejected.is_processed());
    }

    #[test]
    fn api_json_uses_hex_ids() {
        let value = row().api_json();
        assert_eq!(value["id"], "ff00");
        assert_eq!(value["status"], "accepted");
        assert_eq!(value["contractType"], "transfer");
    }

    #[test]
    fn status_json_is_reduced() {
        let value = row().status_json();
        assert_eq!(
            value.as_object().unwrap().keys().collect::<Vec<_>>(),
            vec!["id", "message", "status"]
        );
    }

    #[test]
    fn notification_work_detection() {
        let parse = |raw: &str| serde_json::from_str::<BlockNotification>(raw).unwrap();
        assert!(parse(r#"{"ts":1,"txs":2,"other":0}"#).has_work());
        assert!(parse(r#"{"ts":1,"other":3}"#).has_work());
        assert!(!parse(r#"{"ts":1,"txs":0,"other":0}"#).has_work());
    }
}
