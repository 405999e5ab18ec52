use celo_balance_ledger::{
    config::Settings,
    database::{establish_connection, FileCheckpointStore, PgRecordStore},
    services::{run_pipelines, BlockchainService, PipelineContext, PipelineOutcome},
    utils::logging::init_tracing,
    AppError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = Settings::new()?;
    init_tracing(&settings.logging)?;
    info!("Starting Celo balance ledger");

    // Per-pipeline sections are checked by each pipeline task
    settings.validate_shared()?;
    info!(
        start = settings.scan.start_height,
        end = settings.scan.end_height,
        policy = ?settings.scan.fetch_error_policy,
        "Configuration loaded"
    );

    let db_pool = establish_connection(&settings.database).await?;
    let client = Arc::new(BlockchainService::new(&settings)?);
    match client.get_block_number().await {
        Ok(head) => info!(head, "Connected to node"),
        Err(e) => warn!(error = %e, "Could not read chain head"),
    }

    let ctx = PipelineContext {
        settings: settings.clone(),
        client,
        store: Arc::new(PgRecordStore::new(db_pool)),
        checkpoints: Arc::new(FileCheckpointStore::new(&settings.checkpoint.directory)),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let outcomes = run_pipelines(ctx, cancel).await;

    let mut failed = 0;
    for (task, outcome) in &outcomes {
        match outcome {
            Ok(PipelineOutcome::Scan(summary)) => info!(
                task = %task,
                records = summary.records,
                skipped = summary.skipped,
                last_scanned = ?summary.last_scanned,
                checkpoint = ?summary.flush.checkpoint,
                cancelled = summary.cancelled,
                "Scan summary"
            ),
            Ok(PipelineOutcome::Balances(summary)) => info!(
                task = %task,
                days = summary.days_processed,
                snapshots = summary.snapshots_written,
                reconciliations = summary.reconciliations,
                negative_balances = summary.negative_balance_warnings,
                "Aggregation summary"
            ),
            Err(e) => {
                error!(task = %task, error = %e, "Pipeline failed");
                failed += 1;
            }
        }
    }

    info!("Shutting down Celo balance ledger");
    if failed > 0 {
        return Err(AppError::InternalError(format!("{} pipeline(s) failed", failed)).into());
    }
    Ok(())
}
