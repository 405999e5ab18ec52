use alloy::primitives::Address;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use num_bigint::{BigInt, Sign};
use num_traits::{Signed, Zero};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::database::RecordStore;
use crate::error::{with_retry, AppError, RetryConfig};
use crate::models::{AggregationSummary, AssetRegistry, BalanceSnapshot, BucketKey, PipelineKind, TokenRecord};
use crate::services::blockchain_service::ChainClient;
use crate::services::price_table::PriceTable;
use crate::utils::math::{round_valuation, u256_to_bigint, valuate};
use crate::utils::time::{days_inclusive, parse_day};

/// Running signed balance per address and coin id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    balances: HashMap<Address, HashMap<u64, BigInt>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, address: &Address, coin_id: u64) -> BigInt {
        self.balances
            .get(address)
            .and_then(|assets| assets.get(&coin_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_balance(&mut self, address: Address, coin_id: u64, balance: BigInt) {
        self.balances.entry(address).or_default().insert(coin_id, balance);
    }

    fn adjust(&mut self, address: Address, coin_id: u64, delta: BigInt) -> BigInt {
        let balance = self.balances.entry(address).or_default().entry(coin_id).or_default();
        *balance += delta;
        balance.clone()
    }

    /// Take the amount off the sender. Returns the new balance, or `None` for a mint.
    pub fn debit(&mut self, record: &TokenRecord) -> Option<BigInt> {
        if record.is_mint() {
            return None;
        }
        Some(self.adjust(record.from, record.coin_id, -u256_to_bigint(record.value)))
    }

    /// Add the amount to the recipient. Returns the new balance, or `None` for a burn.
    pub fn credit(&mut self, record: &TokenRecord) -> Option<BigInt> {
        if record.is_burn() {
            return None;
        }
        Some(self.adjust(record.to, record.coin_id, u256_to_bigint(record.value)))
    }

    /// Debit then credit, without any reconciliation
    pub fn apply(&mut self, record: &TokenRecord) {
        self.debit(record);
        self.credit(record);
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &HashMap<u64, BigInt>)> {
        self.balances.iter()
    }

    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balances.is_empty()
    }
}

/// Merge both pipelines' records of one day into replay order
pub fn replay_order(mut native: Vec<TokenRecord>, tokens: Vec<TokenRecord>) -> Vec<TokenRecord> {
    native.extend(tokens);
    // Stable, so native records stay ahead of token records on ties
    native.sort_by_key(|r| (r.block_number, r.event_index));
    native
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub date_begin: NaiveDate,
    pub date_end: NaiveDate,
    /// Days from here up to `date_begin` are replayed without writing snapshots
    pub replay_from: Option<NaiveDate>,
}

impl AggregatorConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let stats = &settings.statistics;
        Ok(Self {
            date_begin: parse_day(&stats.date_begin)?,
            date_end: parse_day(&stats.date_end)?,
            replay_from: stats.replay_from.as_deref().map(parse_day).transpose()?,
        })
    }
}

/// Replays stored transfers day by day and writes valued end-of-day balances
pub struct BalanceAggregator {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn RecordStore>,
    assets: AssetRegistry,
    prices: PriceTable,
    config: AggregatorConfig,
    chain_retry: RetryConfig,
    store_retry: RetryConfig,
    ledger: Ledger,
    negative: HashSet<(Address, u64)>,
    unpriced: HashSet<u64>,
}

impl BalanceAggregator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn RecordStore>,
        assets: AssetRegistry,
        prices: PriceTable,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            client,
            store,
            assets,
            prices,
            config,
            chain_retry: RetryConfig::for_blockchain(),
            store_retry: RetryConfig::for_database(),
            ledger: Ledger::new(),
            negative: HashSet::new(),
            unpriced: HashSet::new(),
        }
    }

    pub fn with_retry_configs(mut self, chain_retry: RetryConfig, store_retry: RetryConfig) -> Self {
        self.chain_retry = chain_retry;
        self.store_retry = store_retry;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<AggregationSummary, AppError> {
        let mut summary = AggregationSummary::default();

        if let Some(replay_from) = self.config.replay_from {
            if let Some(last_warmup) = self.config.date_begin.pred_opt() {
                for day in days_inclusive(replay_from, last_warmup) {
                    if cancel.is_cancelled() {
                        info!(day = %day, "Aggregation cancelled during warm-up");
                        return Ok(summary);
                    }
                    let applied = self.apply_day(day, &mut summary).await?;
                    summary.days_replayed += 1;
                    debug!(day = %day, records = applied, "Replayed warm-up day");
                }
            }
        }

        for day in days_inclusive(self.config.date_begin, self.config.date_end) {
            if cancel.is_cancelled() {
                info!(day = %day, "Aggregation cancelled");
                break;
            }
            let applied = self.apply_day(day, &mut summary).await?;
            let written = self.write_snapshots(day).await?;
            summary.days_processed += 1;
            summary.snapshots_written += written;
            info!(day = %day, records = applied, snapshots = written, "Aggregated day");
        }

        info!(
            days = summary.days_processed,
            records = summary.records_applied,
            reconciliations = summary.reconciliations,
            negative_balances = summary.negative_balance_warnings,
            snapshots = summary.snapshots_written,
            "Aggregation finished"
        );
        Ok(summary)
    }

    async fn read_day(&self, kind: PipelineKind, day: NaiveDate) -> Result<Vec<TokenRecord>, AppError> {
        let key = BucketKey::new(kind, day);
        with_retry("read_records", &self.store_retry, || self.store.read_records(&key)).await
    }

    /// Apply every record of one day to the ledger. Returns the number of records applied.
    pub async fn apply_day(&mut self, day: NaiveDate, summary: &mut AggregationSummary) -> Result<u64, AppError> {
        let native = self.read_day(PipelineKind::NativeTransfers, day).await?;
        let tokens = self.read_day(PipelineKind::TokenTransfers, day).await?;
        let records = replay_order(native, tokens);

        for record in &records {
            self.apply_record(record, summary).await?;
        }
        Ok(records.len() as u64)
    }

    pub async fn apply_record(&mut self, record: &TokenRecord, summary: &mut AggregationSummary) -> Result<(), AppError> {
        if let Some(balance) = self.ledger.debit(record) {
            if balance.is_negative() {
                if record.coin_id == self.assets.native_coin_id() {
                    self.reconcile(record, &balance).await?;
                    summary.reconciliations += 1;
                } else if self.negative.insert((record.from, record.coin_id)) {
                    warn!(
                        address = %record.from,
                        coin_id = record.coin_id,
                        balance = %balance,
                        block = record.block_number,
                        "Negative balance without reconciliation path"
                    );
                    summary.negative_balance_warnings += 1;
                }
            } else {
                self.negative.remove(&(record.from, record.coin_id));
            }
        }

        if let Some(balance) = self.ledger.credit(record) {
            if !balance.is_negative() {
                self.negative.remove(&(record.to, record.coin_id));
            }
        }

        summary.records_applied += 1;
        Ok(())
    }

    /// Replace a negative native balance with the node's balance at the record's height
    async fn reconcile(&mut self, record: &TokenRecord, computed: &BigInt) -> Result<(), AppError> {
        let (address, height) = (record.from, record.block_number);
        let on_chain = with_retry("get_balance_at", &self.chain_retry, || {
            self.client.get_balance_at(address, height)
        })
        .await?;

        let on_chain = u256_to_bigint(on_chain);
        debug!(
            address = %address,
            block = height,
            computed = %computed,
            on_chain = %on_chain,
            "Reconciled native balance"
        );
        self.ledger.set_balance(address, record.coin_id, on_chain);
        Ok(())
    }

    /// End-of-day valuations, one per address whose total is non-zero, ordered by address
    pub fn valuations(&mut self, day: NaiveDate) -> Vec<BalanceSnapshot> {
        let mut snapshots = Vec::new();

        for (address, balances) in self.ledger.accounts() {
            let mut total = BigDecimal::zero();
            for (&coin_id, balance) in balances {
                match balance.sign() {
                    Sign::NoSign => continue,
                    Sign::Minus => {
                        debug!(address = %address, coin_id, balance = %balance, "Negative balance left out of valuation");
                        continue;
                    }
                    Sign::Plus => {}
                }
                let Some(decimals) = self.assets.decimals(coin_id) else {
                    if self.unpriced.insert(coin_id) {
                        warn!(coin_id, "No decimals configured, asset left out of valuation");
                    }
                    continue;
                };
                total += valuate(balance, decimals, &self.prices.price(coin_id, day));
            }

            let value = round_valuation(&total);
            if !value.is_zero() {
                snapshots.push(BalanceSnapshot {
                    day,
                    address: *address,
                    value,
                });
            }
        }

        snapshots.sort_by(|a, b| a.address.cmp(&b.address));
        snapshots
    }

    async fn write_snapshots(&mut self, day: NaiveDate) -> Result<u64, AppError> {
        let snapshots = self.valuations(day);
        let store = self.store.clone();

        with_retry("ensure_balance_table", &self.store_retry, || store.ensure_balance_table(day)).await?;
        with_retry("insert_balance_snapshots", &self.store_retry, || {
            store.insert_balance_snapshots(day, &snapshots)
        })
        .await?;
        Ok(snapshots.len() as u64)
    }
}
