use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use crate::config::Settings;
use crate::database::{CheckpointStore, RecordStore};
use crate::error::AppError;
use crate::models::{AggregationSummary, AssetRegistry, PipelineKind};
use crate::services::balance_aggregator::{AggregatorConfig, BalanceAggregator};
use crate::services::blockchain_service::ChainClient;
use crate::services::bucketed_writer::{BucketedWriter, WriterConfig};
use crate::services::price_table::PriceTable;
use crate::services::transfer_scanner::{ScanConfig, ScanSummary, TransferScanner};

/// Handles shared by every pipeline task
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: Settings,
    pub client: Arc<dyn ChainClient>,
    pub store: Arc<dyn RecordStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTask {
    Scan(PipelineKind),
    Balances,
}

impl fmt::Display for PipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineTask::Scan(kind) => write!(f, "{}", kind),
            PipelineTask::Balances => write!(f, "balances"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Scan(ScanSummary),
    Balances(AggregationSummary),
}

pub async fn run_scan(
    ctx: PipelineContext,
    kind: PipelineKind,
    cancel: CancellationToken,
) -> Result<ScanSummary, AppError> {
    ctx.settings.validate_scan_pipeline()?;
    let assets = AssetRegistry::from_settings(&ctx.settings)?;
    let scanner = TransferScanner::new(
        ctx.client.clone(),
        ctx.checkpoints.clone(),
        ScanConfig::from_settings(&ctx.settings),
    );
    let writer = BucketedWriter::new(
        kind,
        ctx.store.clone(),
        ctx.checkpoints.clone(),
        WriterConfig::from_settings(&ctx.settings.scan),
    );

    match kind {
        PipelineKind::TokenTransfers => scanner.scan_token_transfers(&assets, writer, &cancel).await,
        PipelineKind::NativeTransfers => scanner.scan_native_transfers(writer, &cancel).await,
    }
}

pub async fn run_balances(ctx: PipelineContext, cancel: CancellationToken) -> Result<AggregationSummary, AppError> {
    ctx.settings.validate_balances_pipeline()?;
    let assets = AssetRegistry::from_settings(&ctx.settings)?;
    let config = AggregatorConfig::from_settings(&ctx.settings)?;
    let prices = PriceTable::load(&ctx.settings.statistics.price_file).await?;

    let mut aggregator = BalanceAggregator::new(ctx.client.clone(), ctx.store.clone(), assets, prices, config);
    aggregator.run(&cancel).await
}

async fn run_task(
    ctx: PipelineContext,
    task: PipelineTask,
    cancel: CancellationToken,
) -> Result<PipelineOutcome, AppError> {
    match task {
        PipelineTask::Scan(kind) => run_scan(ctx, kind, cancel).await.map(PipelineOutcome::Scan),
        PipelineTask::Balances => run_balances(ctx, cancel).await.map(PipelineOutcome::Balances),
    }
}

/// Tasks enabled in settings, in launch order
pub fn enabled_tasks(settings: &Settings) -> Vec<PipelineTask> {
    let mut tasks = Vec::new();
    if settings.pipelines.token_transfers {
        tasks.push(PipelineTask::Scan(PipelineKind::TokenTransfers));
    }
    if settings.pipelines.native_transfers {
        tasks.push(PipelineTask::Scan(PipelineKind::NativeTransfers));
    }
    if settings.pipelines.balances {
        tasks.push(PipelineTask::Balances);
    }
    tasks
}

/// Run every enabled pipeline as its own task and collect each outcome.
///
/// Each task validates its own settings sections first. A failing task does not
/// stop the others. Each task gets a child of `cancel`.
pub async fn run_pipelines(
    ctx: PipelineContext,
    cancel: CancellationToken,
) -> Vec<(PipelineTask, Result<PipelineOutcome, AppError>)> {
    let mut set = JoinSet::new();

    for task in enabled_tasks(&ctx.settings) {
        let ctx = ctx.clone();
        let token = cancel.child_token();
        let span = tracing::info_span!("pipeline", task = %task);
        set.spawn(
            async move {
                info!("Pipeline started");
                let outcome = run_task(ctx, task, token).await;
                (task, outcome)
            }
            .instrument(span),
        );
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((task, outcome)) => {
                match &outcome {
                    Ok(_) => info!(task = %task, "Pipeline completed"),
                    Err(e) => error!(task = %task, error = %e, "Pipeline failed"),
                }
                outcomes.push((task, outcome));
            }
            Err(e) => error!(error = %e, "Pipeline task panicked or was aborted"),
        }
    }
    outcomes
}
