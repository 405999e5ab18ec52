use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::{balance_table_name, BalanceSnapshot, BucketKey, TokenRecord};
use crate::utils::math::{big_decimal_to_u256, u256_to_big_decimal};

/// Postgres caps a statement at 65535 bind parameters
const RECORD_ROWS_PER_STATEMENT: usize = 65_535 / 8;
const SNAPSHOT_ROWS_PER_STATEMENT: usize = 65_535 / 3;

/// Table-per-day sink for transfer records and valued snapshots
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ensure_table(&self, key: &BucketKey) -> Result<(), AppError>;

    /// Insert all records or none. Rows already present under the same dedup key are ignored.
    /// Returns the number of rows actually added.
    async fn insert_records(&self, key: &BucketKey, records: &[TokenRecord]) -> Result<u64, AppError>;

    /// Records of one bucket ordered by block and event index. A missing table reads as empty.
    async fn read_records(&self, key: &BucketKey) -> Result<Vec<TokenRecord>, AppError>;

    async fn ensure_balance_table(&self, day: NaiveDate) -> Result<(), AppError>;

    /// Upsert snapshots of one day, replacing earlier values for the same address
    async fn insert_balance_snapshots(&self, day: NaiveDate, snapshots: &[BalanceSnapshot]) -> Result<(), AppError>;

    async fn insert_balance_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<(), AppError> {
        self.insert_balance_snapshots(snapshot.day, std::slice::from_ref(snapshot)).await
    }

    async fn drop_bucket(&self, key: &BucketKey) -> Result<(), AppError>;

    async fn drop_balance_table(&self, day: NaiveDate) -> Result<(), AppError>;
}

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn table_exists(&self, table: &str) -> Result<bool, AppError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn drop_table(&self, table: &str) -> Result<(), AppError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&self.pool)
            .await?;
        info!(table, "Dropped table");
        Ok(())
    }
}

fn decode_error(table: &str, field: &str, err: impl std::fmt::Display) -> AppError {
    AppError::DecodeError(format!("Bad {} in {}: {}", field, table, err))
}

fn to_u64(value: i64, table: &str, field: &str) -> Result<u64, AppError> {
    u64::try_from(value).map_err(|e| decode_error(table, field, e))
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ensure_table(&self, key: &BucketKey) -> Result<(), AppError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                coin_id BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp BIGINT NOT NULL,
                tx_hash CHAR(66) NOT NULL,
                event_index INTEGER NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42) NOT NULL,
                value NUMERIC(78, 0) NOT NULL,
                UNIQUE (coin_id, tx_hash, event_index)
            )",
            key.table_name()
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_records(&self, key: &BucketKey, records: &[TokenRecord]) -> Result<u64, AppError> {
        if records.is_empty() {
            return Ok(0);
        }
        let table = key.table_name();
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in records.chunks(RECORD_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (coin_id, block_number, block_timestamp, tx_hash, event_index, from_address, to_address, value) ",
                table
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.coin_id as i64)
                    .push_bind(record.block_number as i64)
                    .push_bind(record.timestamp as i64)
                    .push_bind(alloy::hex::encode_prefixed(record.tx_hash))
                    .push_bind(record.event_index as i32)
                    .push_bind(record.from.to_checksum(None))
                    .push_bind(record.to.to_checksum(None))
                    .push_bind(u256_to_big_decimal(record.value));
            });
            builder.push(" ON CONFLICT (coin_id, tx_hash, event_index) DO NOTHING");

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(table = %table, rows = records.len(), inserted, "Inserted records");
        Ok(inserted)
    }

    async fn read_records(&self, key: &BucketKey) -> Result<Vec<TokenRecord>, AppError> {
        let table = key.table_name();
        if !self.table_exists(&table).await? {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT coin_id, block_number, block_timestamp, tx_hash, event_index, from_address, to_address, value \
             FROM {} ORDER BY block_number, event_index",
            table
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TokenRecord, AppError> {
                let tx_hash: String = row.try_get("tx_hash")?;
                let from: String = row.try_get("from_address")?;
                let to: String = row.try_get("to_address")?;
                let value: BigDecimal = row.try_get("value")?;
                let event_index: i32 = row.try_get("event_index")?;

                Ok(TokenRecord {
                    coin_id: to_u64(row.try_get("coin_id")?, &table, "coin_id")?,
                    block_number: to_u64(row.try_get("block_number")?, &table, "block_number")?,
                    timestamp: to_u64(row.try_get("block_timestamp")?, &table, "block_timestamp")?,
                    tx_hash: tx_hash.trim().parse::<B256>().map_err(|e| decode_error(&table, "tx_hash", e))?,
                    event_index: u32::try_from(event_index).map_err(|e| decode_error(&table, "event_index", e))?,
                    from: from.parse::<Address>().map_err(|e| decode_error(&table, "from_address", e))?,
                    to: to.parse::<Address>().map_err(|e| decode_error(&table, "to_address", e))?,
                    value: big_decimal_to_u256(&value)?,
                })
            })
            .collect()
    }

    async fn ensure_balance_table(&self, day: NaiveDate) -> Result<(), AppError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                date DATE NOT NULL,
                address VARCHAR(42) NOT NULL,
                value NUMERIC NOT NULL,
                UNIQUE (date, address)
            )",
            balance_table_name(day)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_balance_snapshots(&self, day: NaiveDate, snapshots: &[BalanceSnapshot]) -> Result<(), AppError> {
        if snapshots.is_empty() {
            return Ok(());
        }
        let table = balance_table_name(day);
        let mut tx = self.pool.begin().await?;

        for chunk in snapshots.chunks(SNAPSHOT_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (date, address, value) ", table));
            builder.push_values(chunk, |mut row, snapshot| {
                row.push_bind(snapshot.day)
                    .push_bind(snapshot.address.to_checksum(None))
                    .push_bind(snapshot.value.clone());
            });
            builder.push(" ON CONFLICT (date, address) DO UPDATE SET value = EXCLUDED.value");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(table = %table, rows = snapshots.len(), "Wrote balance snapshots");
        Ok(())
    }

    async fn drop_bucket(&self, key: &BucketKey) -> Result<(), AppError> {
        self.drop_table(&key.table_name()).await
    }

    async fn drop_balance_table(&self, day: NaiveDate) -> Result<(), AppError> {
        self.drop_table(&balance_table_name(day)).await
    }
}

#[derive(Default)]
struct MemoryTables {
    records: HashMap<BucketKey, Vec<TokenRecord>>,
    seen: HashMap<BucketKey, HashSet<(u64, B256, u32)>>,
    balances: HashMap<NaiveDate, BTreeMap<Address, BigDecimal>>,
}

/// Process-local store with the same semantics as the Postgres one, for dry runs and tests
#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<MemoryTables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buckets that currently hold a table, in key order
    pub async fn buckets(&self) -> Vec<BucketKey> {
        let tables = self.tables.lock().await;
        let mut keys: Vec<BucketKey> = tables.records.keys().copied().collect();
        keys.sort();
        keys
    }

    pub async fn record_count(&self) -> usize {
        self.tables.lock().await.records.values().map(Vec::len).sum()
    }

    pub async fn balance_snapshots(&self, day: NaiveDate) -> Vec<BalanceSnapshot> {
        let tables = self.tables.lock().await;
        tables
            .balances
            .get(&day)
            .map(|rows| {
                rows.iter()
                    .map(|(address, value)| BalanceSnapshot {
                        day,
                        address: *address,
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn ensure_table(&self, key: &BucketKey) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        tables.records.entry(*key).or_default();
        tables.seen.entry(*key).or_default();
        Ok(())
    }

    async fn insert_records(&self, key: &BucketKey, records: &[TokenRecord]) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        let MemoryTables { records: rows, seen, .. } = &mut *tables;

        let (Some(rows), Some(seen)) = (rows.get_mut(key), seen.get_mut(key)) else {
            return Err(AppError::DatabaseError(format!(
                "relation \"{}\" does not exist",
                key.table_name()
            )));
        };

        let mut inserted = 0;
        for record in records {
            if seen.insert(record.dedup_key()) {
                rows.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn read_records(&self, key: &BucketKey) -> Result<Vec<TokenRecord>, AppError> {
        let tables = self.tables.lock().await;
        let mut records = tables.records.get(key).cloned().unwrap_or_default();
        records.sort_by_key(|r| (r.block_number, r.event_index));
        Ok(records)
    }

    async fn ensure_balance_table(&self, day: NaiveDate) -> Result<(), AppError> {
        self.tables.lock().await.balances.entry(day).or_default();
        Ok(())
    }

    async fn insert_balance_snapshots(&self, day: NaiveDate, snapshots: &[BalanceSnapshot]) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        let rows = tables.balances.get_mut(&day).ok_or_else(|| {
            AppError::DatabaseError(format!("relation \"{}\" does not exist", balance_table_name(day)))
        })?;
        for snapshot in snapshots {
            rows.insert(snapshot.address, snapshot.value.clone());
        }
        Ok(())
    }

    async fn drop_bucket(&self, key: &BucketKey) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        tables.records.remove(key);
        tables.seen.remove(key);
        Ok(())
    }

    async fn drop_balance_table(&self, day: NaiveDate) -> Result<(), AppError> {
        self.tables.lock().await.balances.remove(&day);
        Ok(())
    }
}
