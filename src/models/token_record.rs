use alloy::primitives::{Address, B256, U256};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::utils::time::day_of_timestamp;

/// One observed value transfer, token or native, as persisted in a day bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRecord {
    pub coin_id: u64,
    pub block_number: u64,
    /// Unix seconds of the containing block
    pub timestamp: u64,
    pub tx_hash: B256,
    /// Log index, pre-order trace node index, or 0 for a plain value transfer
    pub event_index: u32,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

impl TokenRecord {
    /// Identity of the record within its bucket table
    pub fn dedup_key(&self) -> (u64, B256, u32) {
        (self.coin_id, self.tx_hash, self.event_index)
    }

    pub fn day(&self) -> Result<NaiveDate, AppError> {
        day_of_timestamp(self.timestamp)
    }

    pub fn is_mint(&self) -> bool {
        self.from == Address::ZERO
    }

    pub fn is_burn(&self) -> bool {
        self.to == Address::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_burn_detection() {
        let record = TokenRecord {
            coin_id: 825,
            block_number: 10,
            timestamp: 1_600_000_000,
            tx_hash: B256::repeat_byte(1),
            event_index: 3,
            from: Address::ZERO,
            to: Address::repeat_byte(7),
            value: U256::from(5),
        };
        assert!(record.is_mint());
        assert!(!record.is_burn());
        assert_eq!(record.dedup_key(), (825, B256::repeat_byte(1), 3));
        assert_eq!(record.day().unwrap(), NaiveDate::from_ymd_opt(2020, 9, 13).unwrap());
    }
}
