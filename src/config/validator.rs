use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use url::Url;

use crate::config::settings::Settings;
use crate::error::AppError;
use crate::utils::time::parse_day;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid URL for {field}: {value}")]
    InvalidUrl { field: String, value: String },
    #[error("Invalid range: {field} - {message}")]
    InvalidRange { field: String, message: String },
    #[error("Invalid format: {field} - {message}")]
    InvalidFormat { field: String, message: String },
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Conflicting asset definitions for coin id {coin_id}: decimals {first} and {second}")]
    ConflictingAsset { coin_id: u64, first: u8, second: u8 },
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

impl Settings {
    /// Check every section. The first failure is returned as `AppError::ConfigError`.
    pub fn validate(&self) -> Result<(), AppError> {
        self.validate_shared()?;
        self.validate_scan_pipeline()?;
        self.validate_balances_pipeline()?;
        Ok(())
    }

    /// Sections every pipeline depends on
    pub fn validate_shared(&self) -> Result<(), AppError> {
        self.validate_database()?;
        self.validate_assets()?;
        Ok(())
    }

    pub fn validate_scan_pipeline(&self) -> Result<(), AppError> {
        self.validate_blockchain()?;
        self.validate_scan()?;
        Ok(())
    }

    pub fn validate_balances_pipeline(&self) -> Result<(), AppError> {
        self.validate_blockchain()?;
        self.validate_statistics()?;
        Ok(())
    }

    pub fn validate_database(&self) -> ValidationResult<()> {
        if self.database.url.trim().is_empty() {
            return Err(ValidationError::MissingField("database.url".to_string()));
        }
        if self.database.max_connections == 0 || self.database.max_connections < self.database.min_connections {
            return Err(ValidationError::InvalidRange {
                field: "database.max_connections".to_string(),
                message: "must be >= 1 and >= min_connections".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_blockchain(&self) -> ValidationResult<()> {
        let scanning = self.pipelines.token_transfers || self.pipelines.native_transfers;
        // Reconciliation reads balances too, so the node is needed for every pipeline
        if scanning || self.pipelines.balances {
            Url::parse(&self.blockchain.rpc_url).map_err(|_| ValidationError::InvalidUrl {
                field: "blockchain.rpc_url".to_string(),
                value: self.blockchain.rpc_url.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate_scan(&self) -> ValidationResult<()> {
        let scan = &self.scan;
        if scan.window_size == 0 {
            return Err(ValidationError::InvalidRange {
                field: "scan.window_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if scan.end_height < scan.start_height {
            return Err(ValidationError::InvalidRange {
                field: "scan.end_height".to_string(),
                message: format!(
                    "end height {} is below start height {}",
                    scan.end_height, scan.start_height
                ),
            });
        }
        let scanning = self.pipelines.token_transfers || self.pipelines.native_transfers;
        if scanning && scan.end_height == 0 {
            return Err(ValidationError::MissingField("scan.end_height".to_string()));
        }
        if scan.flush_workers == 0 {
            return Err(ValidationError::InvalidRange {
                field: "scan.flush_workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if scan.max_buffered_records == 0 {
            return Err(ValidationError::InvalidRange {
                field: "scan.max_buffered_records".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_statistics(&self) -> ValidationResult<()> {
        if !self.pipelines.balances {
            return Ok(());
        }
        let stats = &self.statistics;
        let begin = parse_field_day(&stats.date_begin, "statistics.date_begin")?;
        let end = parse_field_day(&stats.date_end, "statistics.date_end")?;
        if end < begin {
            return Err(ValidationError::InvalidRange {
                field: "statistics.date_end".to_string(),
                message: format!("{} is before date_begin {}", end, begin),
            });
        }
        if let Some(replay_from) = &stats.replay_from {
            let replay_from = parse_field_day(replay_from, "statistics.replay_from")?;
            if replay_from > begin {
                return Err(ValidationError::InvalidRange {
                    field: "statistics.replay_from".to_string(),
                    message: format!("{} is after date_begin {}", replay_from, begin),
                });
            }
        }
        if stats.price_file.trim().is_empty() {
            return Err(ValidationError::MissingField("statistics.price_file".to_string()));
        }
        if !Path::new(&stats.price_file).is_file() {
            return Err(ValidationError::InvalidFormat {
                field: "statistics.price_file".to_string(),
                message: format!("{} does not exist", stats.price_file),
            });
        }
        Ok(())
    }

    pub fn validate_assets(&self) -> ValidationResult<()> {
        let mut seen: HashMap<u64, u8> = HashMap::new();
        for asset in &self.assets {
            if let Some(&first) = seen.get(&asset.coin_id) {
                if first != asset.decimals {
                    return Err(ValidationError::ConflictingAsset {
                        coin_id: asset.coin_id,
                        first,
                        second: asset.decimals,
                    });
                }
            }
            seen.insert(asset.coin_id, asset.decimals);

            if let Some(contract) = &asset.contract {
                contract.parse::<alloy::primitives::Address>().map_err(|e| ValidationError::InvalidFormat {
                    field: format!("assets.{}.contract", asset.name),
                    message: e.to_string(),
                })?;
            }
        }
        if let Some(&decimals) = seen.get(&self.blockchain.native_coin_id) {
            if decimals != self.blockchain.native_decimals {
                return Err(ValidationError::ConflictingAsset {
                    coin_id: self.blockchain.native_coin_id,
                    first: decimals,
                    second: self.blockchain.native_decimals,
                });
            }
        }
        Ok(())
    }
}

fn parse_field_day(value: &str, field: &str) -> ValidationResult<chrono::NaiveDate> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field.to_string()));
    }
    parse_day(value).map_err(|e| ValidationError::InvalidFormat {
        field: field.to_string(),
        message: e.to_string(),
    })
}
