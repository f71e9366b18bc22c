//! Test support: an in-memory store implementation.
//!
//! **For testing only.** Mirrors the Postgres semantics the gateway relies
//! on (duplicate-id detection, metric upserts) closely enough for protocol
//! and handler tests to run without a database.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use validana_store::error::{StoreError, StoreResult};
use validana_store::models::*;
use validana_store::repos::*;
use validana_store::store::BasicsStore;

/// In-memory stand-in for the relational store.
#[derive(Default)]
pub struct MemoryStore {
    pub transactions: Mutex<Vec<TransactionRow>>,
    pub blocks: Mutex<Vec<BlockRow>>,
    pub contracts: Mutex<Vec<ContractRow>>,
    pub metric_rows: Mutex<HashMap<(String, i32), i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block so `time` has something to report.
    pub fn push_block(&self, block_id: i64, processed_ts: i64) {
        self.blocks.lock().unwrap().push(BlockRow {
            block_id,
            version: 1,
            previous_block_hash: vec![0; 32],
            processed_ts,
            transactions: Vec::new(),
            transactions_amount: 0,
            signature: vec![0; 64],
        });
    }

    /// Add a contract descriptor.
    pub fn push_contract(&self, contract_type: &str, version: &str) {
        let mut hash = vec![0u8; 32];
        hash[0] = self.contracts.lock().unwrap().len() as u8 + 1;
        self.contracts.lock().unwrap().push(ContractRow {
            contract_hash: hash,
            contract_type: contract_type.to_string(),
            contract_version: version.to_string(),
            description: format!("{contract_type} contract"),
            contract_template: json!({}),
            validana_version: 1,
        });
    }

    /// Mark a stored transaction the way the processor would.
    pub fn mark_processed(
        &self,
        transaction_id: &[u8],
        status: TxStatus,
        message: Option<&str>,
        processed_ts: i64,
    ) {
        let mut rows = self.transactions.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.transaction_id == transaction_id)
            .expect("transaction not stored");
        row.status = status.as_str().to_string();
        row.message = message.map(str::to_string);
        row.processed_ts = Some(processed_ts);
        row.block_id = Some(1);
        row.position_in_block = Some(0);
    }

    /// Insert an already processed row directly.
    pub fn push_processed(&self, row: TransactionRow) {
        self.transactions.lock().unwrap().push(row);
    }
}

/// A processed transaction row fixture.
pub fn processed_row(id: [u8; 16], status: TxStatus, processed_ts: i64) -> TransactionRow {
    TransactionRow {
        transaction_id: id.to_vec(),
        version: 1,
        contract_hash: vec![0x22; 32],
        valid_till: 0,
        payload: "{}".to_string(),
        signature: vec![0; 64],
        public_key: vec![0; 33],
        create_ts: Some(processed_ts - 10),
        block_id: Some(1),
        position_in_block: Some(0),
        processed_ts: Some(processed_ts),
        status: status.as_str().to_string(),
        sender: Some("sender-address".to_string()),
        receiver: Some("receiver-address".to_string()),
        contract_type: Some("transfer".to_string()),
        message: None,
    }
}

/// The store as the server consumes it.
pub fn memory_store() -> Arc<dyn BasicsStore> {
    Arc::new(MemoryStore::new())
}

#[async_trait]
impl TransactionRepo for MemoryStore {
    async fn insert_transaction(&self, tx: &NewTransaction) -> StoreResult<()> {
        let mut rows = self.transactions.lock().unwrap();
        if rows.iter().any(|r| r.transaction_id == tx.transaction_id) {
            return Err(StoreError::AlreadyExists(format!(
                "transaction {}",
                validana_core::tx::hex_encode(&tx.transaction_id)
            )));
        }
        rows.push(TransactionRow {
            transaction_id: tx.transaction_id.clone(),
            version: tx.version,
            contract_hash: tx.contract_hash.clone(),
            valid_till: tx.valid_till,
            payload: tx.payload.clone(),
            signature: tx.signature.clone(),
            public_key: tx.public_key.clone(),
            create_ts: Some(tx.create_ts),
            block_id: None,
            position_in_block: None,
            processed_ts: None,
            status: TxStatus::New.as_str().to_string(),
            sender: None,
            receiver: None,
            contract_type: None,
            message: None,
        });
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: &[u8]) -> StoreResult<Option<TransactionRow>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.transaction_id == transaction_id)
            .cloned())
    }

    async fn get_transactions_by_ids(
        &self,
        transaction_ids: &[Vec<u8>],
    ) -> StoreResult<Vec<TransactionRow>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| transaction_ids.contains(&r.transaction_id))
            .cloned()
            .collect())
    }

    async fn get_transactions_processed_at(
        &self,
        processed_ts: i64,
    ) -> StoreResult<Vec<TransactionRow>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.processed_ts == Some(processed_ts))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BlockRepo for MemoryStore {
    async fn latest_block(&self) -> StoreResult<Option<BlockRow>> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .iter()
            .max_by_key(|b| b.block_id)
            .cloned())
    }
}

#[async_trait]
impl ContractRepo for MemoryStore {
    async fn list_contracts(&self) -> StoreResult<Vec<ContractRow>> {
        Ok(self.contracts.lock().unwrap().clone())
    }

    async fn get_contracts_by_type(&self, contract_type: &str) -> StoreResult<Vec<ContractRow>> {
        Ok(self
            .contracts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contract_type == contract_type)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MetricsRepo for MemoryStore {
    async fn sync_metrics(
        &self,
        worker: i32,
        totals: &[(String, i64)],
        currents: &[(String, i64)],
    ) -> StoreResult<()> {
        let mut rows = self.metric_rows.lock().unwrap();
        for (metric, value) in totals {
            *rows.entry((metric.clone(), -1)).or_insert(0) += value;
        }
        for (metric, value) in currents {
            rows.insert((metric.clone(), worker), *value);
        }
        Ok(())
    }

    async fn delete_stale_workers(&self, known_workers: &[i32]) -> StoreResult<u64> {
        let mut rows = self.metric_rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|(_, worker), _| *worker == -1 || known_workers.contains(worker));
        Ok((before - rows.len()) as u64)
    }

    async fn aggregated_metrics(&self) -> StoreResult<AggregatedMetrics> {
        let rows = self.metric_rows.lock().unwrap();
        let mut aggregated = AggregatedMetrics::default();
        let mut current_rows: HashMap<String, Vec<(i32, i64)>> = HashMap::new();
        for ((metric, worker), value) in rows.iter() {
            if *worker == -1 {
                aggregated.totals.insert(metric.clone(), *value);
            } else {
                current_rows
                    .entry(metric.clone())
                    .or_default()
                    .push((*worker, *value));
            }
        }
        for (metric, mut values) in current_rows {
            values.sort_by_key(|(worker, _)| *worker);
            let array: Vec<Value> = values
                .into_iter()
                .map(|(worker, value)| json!({"worker": worker, "value": value}))
                .collect();
            aggregated.currents.insert(metric, Value::Array(array));
        }
        Ok(aggregated)
    }
}

#[async_trait]
impl BasicsStore for MemoryStore {
    async fn migrate(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
