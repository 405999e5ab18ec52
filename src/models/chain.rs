use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// `Transfer(address,address,uint256)` event signature
pub const TRANSFER_EVENT_TOPIC: B256 =
    alloy::primitives::b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: B256,
    /// Recovered sender
    pub from: Address,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRange {
    /// Inclusive height bounds
    Blocks { from: u64, to: u64 },
    BlockHash(B256),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub addresses: Vec<Address>,
    /// Topic 0 alternatives
    pub topics: Vec<B256>,
    pub range: LogRange,
}

impl LogQuery {
    /// Transfer events of one contract over an inclusive height window
    pub fn transfers(contract: Address, from: u64, to: u64) -> Self {
        Self {
            addresses: vec![contract],
            topics: vec![TRANSFER_EVENT_TOPIC],
            range: LogRange::Blocks { from, to },
        }
    }
}
