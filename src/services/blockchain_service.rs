use crate::config::Settings;
use crate::error::AppError;
use crate::models::{CallTraceNode, ChainBlock, ChainTransaction, LogEntry, LogQuery, LogRange};
use alloy::{
    eips::BlockId,
    primitives::{Address, B256, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{BlockNumberOrTag, Filter},
    transports::http::{Client, Http},
};
use async_trait::async_trait;
use serde_json::{json, value::RawValue};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// The node operations the pipelines depend on
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Block with its full transaction list, `None` when the node does not have it
    async fn get_block_by_height(&self, height: u64) -> Result<Option<ChainBlock>, AppError>;

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, AppError>;

    /// `callTracer` trace of one transaction
    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallTraceNode, AppError>;

    async fn get_balance_at(&self, address: Address, height: u64) -> Result<U256, AppError>;
}

/// JSON-RPC client over HTTP
pub struct BlockchainService {
    provider: Arc<RootProvider<Http<Client>>>,
}

impl BlockchainService {
    pub fn new(settings: &Settings) -> Result<Self, AppError> {
        let rpc_url = settings.blockchain.rpc_url.parse::<Url>()
            .map_err(|e| AppError::ConfigError(format!("Invalid RPC URL: {}", e)))?;
        let provider = Arc::new(ProviderBuilder::new().on_http(rpc_url));

        Ok(Self { provider })
    }

    pub async fn get_block_number(&self) -> Result<u64, AppError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| rpc_error("Failed to get block number".to_string(), e))
    }
}

/// Classify a node error. Throttling responses become `RateLimitError`, the rest `BlockchainError`.
fn rpc_error(context: String, err: impl fmt::Display) -> AppError {
    let message = format!("{}: {}", context, err);
    let lower = message.to_lowercase();
    if lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("rate limit")
        || lower.contains("rate-limit")
        || lower.contains("request limit")
    {
        return AppError::RateLimitError(message);
    }
    AppError::BlockchainError(message)
}

/// Decode a `callTracer` result.
///
/// serde_json stops at 128 nested levels and each frame costs two (object and `calls` array),
/// so call trees deeper than about 60 frames come back as `DecodeError` and the scanner
/// records only the top-level value of that transaction.
fn decode_trace(tx_hash: B256, raw: &str) -> Result<CallTraceNode, AppError> {
    serde_json::from_str(raw)
        .map_err(|e| AppError::DecodeError(format!("Malformed trace for {}: {}", tx_hash, e)))
}

fn to_filter(query: &LogQuery) -> Filter {
    let filter = Filter::new()
        .address(query.addresses.clone())
        .event_signature(query.topics.clone());
    match query.range {
        LogRange::Blocks { from, to } => filter.from_block(from).to_block(to),
        LogRange::BlockHash(hash) => filter.at_block_hash(hash),
    }
}

#[async_trait]
impl ChainClient for BlockchainService {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<ChainBlock>, AppError> {
        let block = self.provider
            .get_block_by_number(BlockNumberOrTag::Number(height), true)
            .await
            .map_err(|e| rpc_error(format!("Failed to get block {}", height), e))?;

        let Some(block) = block else {
            return Ok(None);
        };

        let transactions = block
            .transactions
            .as_transactions()
            .unwrap_or_default()
            .iter()
            .map(|tx| ChainTransaction {
                hash: tx.hash,
                from: tx.from,
                to: tx.to,
                value: tx.value,
            })
            .collect();

        Ok(Some(ChainBlock {
            number: height,
            timestamp: block.header.timestamp,
            transactions,
        }))
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, AppError> {
        let logs = self.provider
            .get_logs(&to_filter(query))
            .await
            .map_err(|e| rpc_error("Failed to get logs".to_string(), e))?;

        debug!(count = logs.len(), range = ?query.range, "Fetched logs");

        Ok(logs
            .into_iter()
            .map(|log| LogEntry {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number: log.block_number,
                transaction_hash: log.transaction_hash,
                log_index: log.log_index,
            })
            .collect())
    }

    async fn trace_transaction(&self, tx_hash: B256) -> Result<CallTraceNode, AppError> {
        let raw: Box<RawValue> = self.provider
            .raw_request(
                "debug_traceTransaction".into(),
                (tx_hash, json!({ "tracer": "callTracer" })),
            )
            .await
            .map_err(|e| rpc_error(format!("Failed to trace {}", tx_hash), e))?;

        decode_trace(tx_hash, raw.get())
    }

    async fn get_balance_at(&self, address: Address, height: u64) -> Result<U256, AppError> {
        self.provider
            .get_balance(address)
            .block_id(BlockId::number(height))
            .await
            .map_err(|e| rpc_error(format!("Failed to get balance of {} at {}", address, height), e))
    }
}
