use alloy::primitives::{Address, B256, U256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FetchErrorPolicy, Settings};
use crate::database::CheckpointStore;
use crate::error::{with_retry, AppError, RetryConfig};
use crate::models::{
    AssetRegistry, ChainBlock, ChainTransaction, LogEntry, LogQuery, PipelineKind, TokenRecord,
    TRANSFER_EVENT_TOPIC,
};
use crate::services::blockchain_service::ChainClient;
use crate::services::bucketed_writer::{BucketedWriter, FlushStats};
use crate::services::trace_flattener::{flatten_trace, TraceContext};

const NATIVE_PROGRESS_LOG_INTERVAL: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub start_height: u64,
    pub end_height: u64,
    pub window_size: u64,
    pub policy: FetchErrorPolicy,
    pub retry: RetryConfig,
    pub trace_internal_calls: bool,
    pub native_coin_id: u64,
}

impl ScanConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let scan = &settings.scan;
        Self {
            start_height: scan.start_height,
            end_height: scan.end_height,
            window_size: scan.window_size.max(1),
            policy: scan.fetch_error_policy,
            retry: RetryConfig::for_scan(scan.retry_attempts, scan.retry_base_delay_ms),
            trace_internal_calls: scan.trace_internal_calls,
            native_coin_id: settings.blockchain.native_coin_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub resumed_from: u64,
    /// Last height whose records were all pushed, if any
    pub last_scanned: Option<u64>,
    pub records: u64,
    /// Windows, log queries, logs or blocks dropped under the skip policy or as undecodable
    pub skipped: u64,
    /// Transactions whose trace failed and were recorded from the top-level value only
    pub trace_fallbacks: u64,
    pub cancelled: bool,
    pub flush: FlushStats,
}

/// Consecutive inclusive windows `[i, min(i + size - 1, end)]` covering `[start, end]`
pub fn windows(start: u64, end: u64, size: u64) -> impl Iterator<Item = (u64, u64)> {
    let size = size.max(1);
    let mut next = Some(start).filter(|s| *s <= end);
    std::iter::from_fn(move || {
        let from = next?;
        let to = from.saturating_add(size - 1).min(end);
        next = to.checked_add(1).filter(|n| *n <= end);
        Some((from, to))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u32,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

impl DecodedTransfer {
    pub fn into_record(self, coin_id: u64, timestamp: u64) -> TokenRecord {
        TokenRecord {
            coin_id,
            block_number: self.block_number,
            timestamp,
            tx_hash: self.tx_hash,
            event_index: self.log_index,
            from: self.from,
            to: self.to,
            value: self.value,
        }
    }
}

/// Decode an ERC20 `Transfer` log. `Ok(None)` for a zero amount.
pub fn decode_transfer(log: &LogEntry) -> Result<Option<DecodedTransfer>, AppError> {
    let malformed = |what: &str| AppError::DecodeError(format!("Transfer log {}: {}", what, describe(log)));

    if log.topics.len() != 3 || log.topics[0] != TRANSFER_EVENT_TOPIC {
        return Err(malformed("has unexpected topics"));
    }
    if log.data.len() != 32 {
        return Err(malformed("data is not a single word"));
    }
    let value = U256::try_from_be_slice(&log.data).ok_or_else(|| malformed("amount overflows"))?;
    if value.is_zero() {
        return Ok(None);
    }

    let block_number = log.block_number.ok_or_else(|| malformed("has no block number"))?;
    let tx_hash = log.transaction_hash.ok_or_else(|| malformed("has no transaction hash"))?;
    let log_index = log
        .log_index
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| malformed("has no usable log index"))?;

    Ok(Some(DecodedTransfer {
        block_number,
        tx_hash,
        log_index,
        from: Address::from_word(log.topics[1]),
        to: Address::from_word(log.topics[2]),
        value,
    }))
}

fn describe(log: &LogEntry) -> String {
    format!(
        "contract {} block {:?} tx {:?} index {:?}",
        log.address, log.block_number, log.transaction_hash, log.log_index
    )
}

/// Plain value transfer of a transaction, if it moves any value to a known recipient
pub fn top_level_record(coin_id: u64, block: &ChainBlock, tx: &ChainTransaction) -> Option<TokenRecord> {
    let to = tx.to?;
    if tx.value.is_zero() {
        return None;
    }
    Some(TokenRecord {
        coin_id,
        block_number: block.number,
        timestamp: block.timestamp,
        tx_hash: tx.hash,
        event_index: 0,
        from: tx.from,
        to,
        value: tx.value,
    })
}

/// Turns node responses into transfer records for one pipeline at a time
pub struct TransferScanner {
    client: Arc<dyn ChainClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ScanConfig,
}

impl TransferScanner {
    pub fn new(client: Arc<dyn ChainClient>, checkpoints: Arc<dyn CheckpointStore>, config: ScanConfig) -> Self {
        Self {
            client,
            checkpoints,
            config,
        }
    }

    /// First height to scan: one past the checkpoint, never below the configured start
    pub async fn resume_height(&self, kind: PipelineKind) -> Result<u64, AppError> {
        let checkpoint = self.checkpoints.load(kind).await?;
        let resume = match checkpoint {
            Some(height) => height.saturating_add(1).max(self.config.start_height),
            None => self.config.start_height,
        };
        info!(pipeline = %kind, checkpoint = ?checkpoint, resume, "Resolved scan start");
        Ok(resume)
    }

    async fn fetch<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        with_retry(operation, &self.config.retry, op).await
    }

    /// Apply the fetch policy to an error that survived retries
    fn tolerate(&self, err: AppError, unit: &str) -> Result<(), AppError> {
        match self.config.policy {
            FetchErrorPolicy::Skip => {
                warn!(unit, error = %err, "Skipping after fetch failure");
                Ok(())
            }
            FetchErrorPolicy::Abort => {
                error!(unit, error = %err, "Aborting scan after fetch failure");
                Err(err)
            }
        }
    }

    async fn block(&self, height: u64) -> Result<ChainBlock, AppError> {
        self.fetch("get_block_by_height", || self.client.get_block_by_height(height))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Block {}", height)))
    }

    /// Scan token transfers of every configured contract over `[resume, end]`.
    ///
    /// The writer is always finished before returning, also on error or cancellation.
    pub async fn scan_token_transfers(
        &self,
        assets: &AssetRegistry,
        mut writer: BucketedWriter,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, AppError> {
        let mut summary = ScanSummary {
            resumed_from: self.resume_height(PipelineKind::TokenTransfers).await?,
            ..Default::default()
        };
        let outcome = self.token_windows(assets, &mut writer, cancel, &mut summary).await;
        self.conclude(PipelineKind::TokenTransfers, outcome, writer, summary).await
    }

    async fn token_windows(
        &self,
        assets: &AssetRegistry,
        writer: &mut BucketedWriter,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) -> Result<(), AppError> {
        for (from, to) in windows(summary.resumed_from, self.config.end_height, self.config.window_size) {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            let mut timestamps: HashMap<u64, u64> = HashMap::new();
            let mut window_records = 0u64;

            for (asset, contract) in assets.token_contracts() {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    return Ok(());
                }

                let query = LogQuery::transfers(contract, from, to);
                let logs = match self.fetch("filter_logs", || self.client.filter_logs(&query)).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        self.tolerate(e, &format!("logs of {} in [{}, {}]", asset.name, from, to))?;
                        summary.skipped += 1;
                        continue;
                    }
                };

                for log in &logs {
                    let transfer = match decode_transfer(log) {
                        Ok(Some(transfer)) => transfer,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(asset = %asset.name, error = %e, "Skipping undecodable log");
                            summary.skipped += 1;
                            continue;
                        }
                    };

                    let timestamp = match timestamps.get(&transfer.block_number) {
                        Some(timestamp) => *timestamp,
                        None => match self.block(transfer.block_number).await {
                            Ok(block) => {
                                timestamps.insert(transfer.block_number, block.timestamp);
                                block.timestamp
                            }
                            Err(e) => {
                                self.tolerate(e, &format!("block {} of {} log", transfer.block_number, asset.name))?;
                                summary.skipped += 1;
                                continue;
                            }
                        },
                    };

                    writer.push(transfer.into_record(asset.coin_id, timestamp)).await?;
                    window_records += 1;
                }
            }

            writer.commit(to).await?;
            summary.last_scanned = Some(to);
            summary.records += window_records;
            info!(from, to, records = window_records, "Scanned token window");
        }
        Ok(())
    }

    /// Scan native value transfers block by block over `[resume, end]`
    pub async fn scan_native_transfers(
        &self,
        mut writer: BucketedWriter,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, AppError> {
        let mut summary = ScanSummary {
            resumed_from: self.resume_height(PipelineKind::NativeTransfers).await?,
            ..Default::default()
        };
        let outcome = self.native_blocks(&mut writer, cancel, &mut summary).await;
        self.conclude(PipelineKind::NativeTransfers, outcome, writer, summary).await
    }

    async fn native_blocks(
        &self,
        writer: &mut BucketedWriter,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) -> Result<(), AppError> {
        let start = summary.resumed_from;
        if start > self.config.end_height {
            return Ok(());
        }

        for height in start..=self.config.end_height {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(());
            }

            match self.block(height).await {
                Ok(block) => {
                    let mut block_records = 0u64;
                    for tx in &block.transactions {
                        let records = self.transaction_records(&block, tx, summary).await;
                        block_records += records.len() as u64;
                        writer.push_all(records).await?;
                    }
                    summary.records += block_records;
                    debug!(block = height, txs = block.transactions.len(), records = block_records, "Scanned block");
                }
                Err(e) => {
                    self.tolerate(e, &format!("block {}", height))?;
                    summary.skipped += 1;
                }
            }

            writer.commit(height).await?;
            summary.last_scanned = Some(height);
            if height % NATIVE_PROGRESS_LOG_INTERVAL == 0 {
                info!(block = height, records = summary.records, "Native scan progress");
            }
        }
        Ok(())
    }

    async fn transaction_records(
        &self,
        block: &ChainBlock,
        tx: &ChainTransaction,
        summary: &mut ScanSummary,
    ) -> Vec<TokenRecord> {
        let coin_id = self.config.native_coin_id;
        if !self.config.trace_internal_calls {
            return top_level_record(coin_id, block, tx).into_iter().collect();
        }

        let traced = self
            .fetch("trace_transaction", || self.client.trace_transaction(tx.hash))
            .await
            .and_then(|root| {
                if let Some(reason) = &root.error {
                    debug!(tx = %tx.hash, reason = %reason, "Reverted transaction");
                    return Ok(Vec::new());
                }
                let ctx = TraceContext {
                    coin_id,
                    block_number: block.number,
                    timestamp: block.timestamp,
                    tx_hash: tx.hash,
                };
                Ok(flatten_trace(&root, &ctx)?)
            });

        match traced {
            Ok(records) => records,
            Err(e) => {
                warn!(tx = %tx.hash, error = %e, "Trace unusable, recording top-level value only");
                summary.trace_fallbacks += 1;
                top_level_record(coin_id, block, tx).into_iter().collect()
            }
        }
    }

    /// Finish the writer whatever happened, then report the scan outcome
    async fn conclude(
        &self,
        kind: PipelineKind,
        outcome: Result<(), AppError>,
        writer: BucketedWriter,
        mut summary: ScanSummary,
    ) -> Result<ScanSummary, AppError> {
        let flushed = writer.finish().await;
        match (outcome, flushed) {
            (Ok(()), Ok(stats)) => {
                summary.flush = stats;
                info!(
                    pipeline = %kind,
                    records = summary.records,
                    skipped = summary.skipped,
                    cancelled = summary.cancelled,
                    checkpoint = ?summary.flush.checkpoint,
                    "Scan finished"
                );
                Ok(summary)
            }
            (Err(e), flushed) => {
                if let Err(flush_error) = flushed {
                    error!(pipeline = %kind, error = %flush_error, "Flush failed while aborting");
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
        }
    }
}
