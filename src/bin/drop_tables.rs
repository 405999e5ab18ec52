//! Drops per-day tables over an inclusive date range.
//!
//! Usage: `drop_tables <from YYYY-MM-DD> <to YYYY-MM-DD> [tokens|native|balances|all]...`
//! Without a table group every group is dropped.

use celo_balance_ledger::{
    config::Settings,
    database::{establish_connection, PgRecordStore, RecordStore},
    models::{BucketKey, PipelineKind},
    utils::{logging::init_tracing, time::{days_inclusive, parse_day}},
    AppError,
};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableGroup {
    Records(PipelineKind),
    Balances,
}

fn parse_groups(args: &[String]) -> Result<Vec<TableGroup>, AppError> {
    let all = vec![
        TableGroup::Records(PipelineKind::TokenTransfers),
        TableGroup::Records(PipelineKind::NativeTransfers),
        TableGroup::Balances,
    ];
    if args.is_empty() {
        return Ok(all);
    }

    let mut groups = Vec::new();
    for arg in args {
        match arg.as_str() {
            "tokens" => groups.push(TableGroup::Records(PipelineKind::TokenTransfers)),
            "native" => groups.push(TableGroup::Records(PipelineKind::NativeTransfers)),
            "balances" => groups.push(TableGroup::Balances),
            "all" => return Ok(all),
            other => return Err(AppError::ConfigError(format!("Unknown table group: {}", other))),
        }
    }
    Ok(groups)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let settings = Settings::new()?;
    init_tracing(&settings.logging)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        return Err(AppError::ConfigError(
            "usage: drop_tables <from YYYY-MM-DD> <to YYYY-MM-DD> [tokens|native|balances|all]...".to_string(),
        )
        .into());
    }
    let from = parse_day(&args[0])?;
    let to = parse_day(&args[1])?;
    let groups = parse_groups(&args[2..])?;

    let pool = establish_connection(&settings.database).await?;
    let store = PgRecordStore::new(pool);

    let mut dropped = 0usize;
    let mut failures = 0usize;
    for day in days_inclusive(from, to) {
        for group in &groups {
            let result = match group {
                TableGroup::Records(kind) => store.drop_bucket(&BucketKey::new(*kind, day)).await,
                TableGroup::Balances => store.drop_balance_table(day).await,
            };
            match result {
                Ok(()) => dropped += 1,
                Err(e) => {
                    error!(day = %day, group = ?group, error = %e, "Drop failed");
                    failures += 1;
                }
            }
        }
    }

    info!(dropped, failures, "Done");
    drop_outcome(dropped, failures)?;
    Ok(())
}

/// A partial drop is an error so scripts can detect it
fn drop_outcome(dropped: usize, failures: usize) -> Result<(), AppError> {
    if failures > 0 {
        return Err(AppError::DatabaseError(format!(
            "{} of {} table drops failed",
            failures,
            dropped + failures
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groups() {
        assert_eq!(parse_groups(&[]).unwrap().len(), 3);
        assert_eq!(
            parse_groups(&["native".to_string()]).unwrap(),
            vec![TableGroup::Records(PipelineKind::NativeTransfers)]
        );
        assert!(parse_groups(&["events".to_string()]).is_err());
    }

    #[test]
    fn test_partial_drop_is_an_error() {
        assert!(drop_outcome(6, 0).is_ok());
        assert!(drop_outcome(0, 0).is_ok());
        let err = drop_outcome(4, 2).unwrap_err();
        assert_eq!(err, AppError::DatabaseError("2 of 6 table drops failed".to_string()));
    }
}
