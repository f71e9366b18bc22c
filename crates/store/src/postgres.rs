//! PostgreSQL-based store implementation.

use crate::error::{StoreError, StoreResult};
use crate::models::*;
use crate::repos::{AggregatedMetrics, BlockRepo, ContractRepo, MetricsRepo, TransactionRepo};
use crate::store::BasicsStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use validana_core::AppConfig;
use validana_core::tx::hex_encode;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Connection options for the configured database. Shared with the
/// notification listener, which opens its own out-of-pool connection.
pub fn connect_options(config: &AppConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&config.dbhost)
        .port(config.dbport)
        .username(&config.dbuser)
        .password(&config.dbpassword)
        .database(&config.dbname)
}

/// PostgreSQL-backed store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Open the worker's connection pool.
    pub async fn connect(config: &AppConfig) -> StoreResult<Self> {
        tracing::info!(
            host = %config.dbhost,
            port = config.dbport,
            database = %config.dbname,
            username = %config.dbuser,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .min_connections(config.dbminconnections)
            .max_connections(config.dbmaxconnections)
            .connect_with(connect_options(config))
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl BasicsStore for PostgresStore {
    async fn migrate(&self) -> StoreResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared
        // statement, so the schema is split and executed statement by
        // statement.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TransactionRepo for PostgresStore {
    async fn insert_transaction(&self, tx: &NewTransaction) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO basics.transactions (
                transaction_id, version, contract_hash, valid_till, payload,
                signature, public_key, create_ts, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'new')
            "#,
        )
        .bind(&tx.transaction_id)
        .bind(tx.version)
        .bind(&tx.contract_hash)
        .bind(tx.valid_till)
        .bind(&tx.payload)
        .bind(&tx.signature)
        .bind(&tx.public_key)
        .bind(tx.create_ts)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StoreError::from_unique_violation(
                e,
                format!("transaction {}", hex_encode(&tx.transaction_id)),
            )
        })?;
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: &[u8]) -> StoreResult<Option<TransactionRow>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM basics.transactions WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_transactions_by_ids(
        &self,
        transaction_ids: &[Vec<u8>],
    ) -> StoreResult<Vec<TransactionRow>> {
        if transaction_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM basics.transactions WHERE transaction_id = ANY($1)",
        )
        .bind(transaction_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_transactions_processed_at(
        &self,
        processed_ts: i64,
    ) -> StoreResult<Vec<TransactionRow>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM basics.transactions WHERE processed_ts = $1 ORDER BY block_id, position_in_block",
        )
        .bind(processed_ts)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl BlockRepo for PostgresStore {
    async fn latest_block(&self) -> StoreResult<Option<BlockRow>> {
        let row = sqlx::query_as::<_, BlockRow>(
            "SELECT * FROM basics.blocks ORDER BY block_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl ContractRepo for PostgresStore {
    async fn list_contracts(&self) -> StoreResult<Vec<ContractRow>> {
        let rows = sqlx::query_as::<_, ContractRow>(
            "SELECT * FROM basics.contracts ORDER BY contract_type, contract_version",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_contracts_by_type(&self, contract_type: &str) -> StoreResult<Vec<ContractRow>> {
        let rows = sqlx::query_as::<_, ContractRow>(
            "SELECT * FROM basics.contracts WHERE contract_type = $1 ORDER BY contract_version",
        )
        .bind(contract_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl MetricsRepo for PostgresStore {
    async fn sync_metrics(
        &self,
        worker: i32,
        totals: &[(String, i64)],
        currents: &[(String, i64)],
    ) -> StoreResult<()> {
        // One transaction per sync: either the whole snapshot lands or none
        // of it, so local counters can be reset right after.
        let mut tx = self.pool.begin().await?;

        for (metric, value) in totals {
            sqlx::query(
                r#"
                INSERT INTO basics.metrics (metric, worker, value)
                VALUES ($1, -1, $2)
                ON CONFLICT (metric, worker)
                DO UPDATE SET value = basics.metrics.value + EXCLUDED.value
                "#,
            )
            .bind(metric)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        for (metric, value) in currents {
            sqlx::query(
                r#"
                INSERT INTO basics.metrics (metric, worker, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (metric, worker)
                DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(metric)
            .bind(worker)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_stale_workers(&self, known_workers: &[i32]) -> StoreResult<u64> {
        let result =
            sqlx::query("DELETE FROM basics.metrics WHERE worker <> -1 AND worker <> ALL($1)")
                .bind(known_workers)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn aggregated_metrics(&self) -> StoreResult<AggregatedMetrics> {
        let totals: Vec<(String, i64)> =
            sqlx::query_as("SELECT metric, value FROM basics.metrics WHERE worker = -1")
                .fetch_all(&self.pool)
                .await?;

        let currents: Vec<(String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT metric,
                   jsonb_agg(jsonb_build_object('worker', worker, 'value', value) ORDER BY worker) AS values
            FROM basics.metrics
            WHERE worker <> -1
            GROUP BY metric
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(AggregatedMetrics {
            totals: totals.into_iter().collect::<HashMap<_, _>>(),
            currents: currents.into_iter().collect::<HashMap<_, _>>(),
        })
    }
}
