use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;
use crate::utils::time::{day_key, day_of_timestamp};

/// The two scan pipelines. Each owns a disjoint table namespace and checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipelineKind {
    TokenTransfers,
    NativeTransfers,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 2] = [PipelineKind::TokenTransfers, PipelineKind::NativeTransfers];

    pub fn table_prefix(&self) -> &'static str {
        match self {
            PipelineKind::TokenTransfers => "event_",
            PipelineKind::NativeTransfers => "tx_",
        }
    }

    pub fn checkpoint_name(&self) -> &'static str {
        match self {
            PipelineKind::TokenTransfers => "token_progress",
            PipelineKind::NativeTransfers => "native_progress",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::TokenTransfers => write!(f, "token_transfers"),
            PipelineKind::NativeTransfers => write!(f, "native_transfers"),
        }
    }
}

/// A UTC calendar day within one pipeline's namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub kind: PipelineKind,
    pub day: NaiveDate,
}

impl BucketKey {
    pub fn new(kind: PipelineKind, day: NaiveDate) -> Self {
        Self { kind, day }
    }

    pub fn from_timestamp(kind: PipelineKind, timestamp: u64) -> Result<Self, AppError> {
        Ok(Self::new(kind, day_of_timestamp(timestamp)?))
    }

    pub fn table_name(&self) -> String {
        format!("{}{}", self.kind.table_prefix(), day_key(self.day))
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_name())
    }
}

/// Table holding the valued snapshots of one day
pub fn balance_table_name(day: NaiveDate) -> String {
    format!("ods_balance_{}", day_key(day))
}
