use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// End-of-day valuation of one address across all assets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub day: NaiveDate,
    pub address: Address,
    pub value: BigDecimal,
}

/// Outcome of one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub days_replayed: u32,
    pub days_processed: u32,
    pub records_applied: u64,
    pub reconciliations: u64,
    pub negative_balance_warnings: u64,
    pub snapshots_written: u64,
}
