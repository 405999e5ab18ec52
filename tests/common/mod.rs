#![allow(dead_code)]

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use celo_balance_ledger::{
    database::{InMemoryRecordStore, RecordStore},
    error::{AppError, RetryConfig},
    models::{
        BalanceSnapshot, BucketKey, CallTraceNode, ChainBlock, ChainTransaction, LogEntry, LogQuery, LogRange,
        TokenRecord, TRANSFER_EVENT_TOPIC,
    },
    services::ChainClient,
};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 2021-01-01 00:00:00 UTC
pub const GENESIS_TIME: u64 = 1_609_459_200;
pub const BLOCK_TIME: u64 = 5;
pub const DAY: u64 = 86_400;

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 2,
        jitter_factor: 0.0,
        backoff_multiplier: 1.0,
    }
}

pub fn transfer_log(contract: Address, block: u64, log_index: u64, from: Address, to: Address, value: u64) -> LogEntry {
    LogEntry {
        address: contract,
        topics: vec![TRANSFER_EVENT_TOPIC, from.into_word(), to.into_word()],
        data: Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec()),
        block_number: Some(block),
        transaction_hash: Some(B256::with_last_byte((block % 256) as u8)),
        log_index: Some(log_index),
    }
}

pub fn record(coin_id: u64, block: u64, timestamp: u64, from: Address, to: Address, value: u64) -> TokenRecord {
    TokenRecord {
        coin_id,
        block_number: block,
        timestamp,
        tx_hash: B256::from(U256::from(block)),
        event_index: 0,
        from,
        to,
        value: U256::from(value),
    }
}

pub fn call(call_type: &str, from: Address, to: Address, value: u64, calls: Vec<CallTraceNode>) -> CallTraceNode {
    CallTraceNode {
        from: Some(from),
        to: Some(to),
        call_type: Some(call_type.to_string()),
        value: (value > 0).then(|| U256::from(value)),
        error: None,
        calls,
    }
}

/// Chain client answering from scripted data and recording every call.
///
/// Blocks that are not scripted exist with no transactions and a timestamp of
/// `GENESIS_TIME + height * block_time`.
pub struct ScriptedChain {
    pub block_time: u64,
    blocks: HashMap<u64, ChainBlock>,
    logs: Vec<LogEntry>,
    traces: HashMap<B256, CallTraceNode>,
    balances: HashMap<(Address, u64), U256>,
    failing_windows: HashSet<(Address, u64)>,
    failing_blocks: HashSet<u64>,
    failing_traces: HashSet<B256>,
    cancel_at: Option<(u64, CancellationToken)>,
    pub log_queries: Mutex<Vec<LogQuery>>,
    pub block_requests: Mutex<Vec<u64>>,
    pub balance_requests: Mutex<Vec<(Address, u64)>>,
}

impl Default for ScriptedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self {
            block_time: BLOCK_TIME,
            blocks: HashMap::new(),
            logs: Vec::new(),
            traces: HashMap::new(),
            balances: HashMap::new(),
            failing_windows: HashSet::new(),
            failing_blocks: HashSet::new(),
            failing_traces: HashSet::new(),
            cancel_at: None,
            log_queries: Mutex::new(Vec::new()),
            block_requests: Mutex::new(Vec::new()),
            balance_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn timestamp_of(&self, height: u64) -> u64 {
        GENESIS_TIME + height * self.block_time
    }

    pub fn with_block_time(mut self, block_time: u64) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn with_log(mut self, log: LogEntry) -> Self {
        self.logs.push(log);
        self
    }

    pub fn with_transaction(mut self, height: u64, tx: ChainTransaction) -> Self {
        let timestamp = self.timestamp_of(height);
        self.blocks
            .entry(height)
            .or_insert_with(|| ChainBlock { number: height, timestamp, transactions: Vec::new() })
            .transactions
            .push(tx);
        self
    }

    pub fn with_trace(mut self, tx_hash: B256, trace: CallTraceNode) -> Self {
        self.traces.insert(tx_hash, trace);
        self
    }

    pub fn with_balance(mut self, address: Address, height: u64, balance: u64) -> Self {
        self.balances.insert((address, height), U256::from(balance));
        self
    }

    /// Log queries for `contract` starting at `from` always fail
    pub fn failing_window(mut self, contract: Address, from: u64) -> Self {
        self.failing_windows.insert((contract, from));
        self
    }

    pub fn failing_block(mut self, height: u64) -> Self {
        self.failing_blocks.insert(height);
        self
    }

    pub fn failing_trace(mut self, tx_hash: B256) -> Self {
        self.failing_traces.insert(tx_hash);
        self
    }

    /// Cancel `token` when block `height` is requested
    pub fn cancel_when_block_requested(mut self, height: u64, token: CancellationToken) -> Self {
        self.cancel_at = Some((height, token));
        self
    }

    pub fn balance_request_count(&self) -> usize {
        self.balance_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<ChainBlock>, AppError> {
        self.block_requests.lock().unwrap().push(height);
        if let Some((at, token)) = &self.cancel_at {
            if *at == height {
                token.cancel();
            }
        }
        if self.failing_blocks.contains(&height) {
            return Err(AppError::BlockchainError(format!("block {} unavailable", height)));
        }
        Ok(Some(self.blocks.get(&height).cloned().unwrap_or_else(|| ChainBlock {
            number: height,
            timestamp: self.timestamp_of(height),
            transactions: Vec::new(),
        })))
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, AppError> {
        self.log_queries.lock().unwrap().push(query.clone());
        let LogRange::Blocks { from, to } = query.range else {
            return Err(AppError::ValidationError("block hash filters are not scripted".to_string()));
        };
        if query.addresses.iter().any(|a| self.failing_windows.contains(&(*a, from))) {
            return Err(AppError::BlockchainError(format!("eth_getLogs failed for [{}, {}]", from, to)));
        }
        Ok(self
            .logs
            .iter()
            .filter(|log| query.addresses.contains(&log.address))
            .filter(|log| log.block_number.map_or(false, |b| b >= from && b <= to))
            .cloned()
            .collect())
    }

    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallTraceNode, AppError> {
        if self.failing_traces.contains(&tx_hash) {
            return Err(AppError::BlockchainError(format!("trace of {} timed out", tx_hash)));
        }
        self.traces
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("trace {}", tx_hash)))
    }

    async fn get_balance_at(&self, address: Address, height: u64) -> Result<U256, AppError> {
        self.balance_requests.lock().unwrap().push((address, height));
        self.balances
            .get(&(address, height))
            .copied()
            .ok_or_else(|| AppError::NotFound(format!("balance of {} at {}", address, height)))
    }
}

/// In-memory record store whose inserts into chosen days fail after `failure_delay`
pub struct FailingStore {
    pub inner: InMemoryRecordStore,
    failing_days: HashSet<NaiveDate>,
    failure_delay: Duration,
    pub failed_inserts: Mutex<Vec<BucketKey>>,
}

impl FailingStore {
    pub fn new(failing_days: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            failing_days: failing_days.into_iter().collect(),
            failure_delay: Duration::ZERO,
            failed_inserts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    pub fn failed_insert_count(&self) -> usize {
        self.failed_inserts.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn ensure_table(&self, key: &BucketKey) -> Result<(), AppError> {
        self.inner.ensure_table(key).await
    }

    async fn insert_records(&self, key: &BucketKey, records: &[TokenRecord]) -> Result<u64, AppError> {
        if self.failing_days.contains(&key.day) {
            tokio::time::sleep(self.failure_delay).await;
            self.failed_inserts.lock().unwrap().push(*key);
            return Err(AppError::DatabaseError("disk full".to_string()));
        }
        self.inner.insert_records(key, records).await
    }

    async fn read_records(&self, key: &BucketKey) -> Result<Vec<TokenRecord>, AppError> {
        self.inner.read_records(key).await
    }

    async fn ensure_balance_table(&self, day: NaiveDate) -> Result<(), AppError> {
        self.inner.ensure_balance_table(day).await
    }

    async fn insert_balance_snapshots(&self, day: NaiveDate, snapshots: &[BalanceSnapshot]) -> Result<(), AppError> {
        self.inner.insert_balance_snapshots(day, snapshots).await
    }

    async fn drop_bucket(&self, key: &BucketKey) -> Result<(), AppError> {
        self.inner.drop_bucket(key).await
    }

    async fn drop_balance_table(&self, day: NaiveDate) -> Result<(), AppError> {
        self.inner.drop_balance_table(day).await
    }
}
