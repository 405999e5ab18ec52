use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ScanSettings;
use crate::database::{CheckpointStore, RecordStore};
use crate::error::{with_retry, AppError, RetryConfig};
use crate::models::{BucketKey, PipelineKind, TokenRecord};

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub workers: usize,
    /// Buffer size that forces a flush even without a day boundary
    pub max_buffered_records: usize,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_buffered_records: 50_000,
            queue_capacity: 8,
            retry: RetryConfig::for_database(),
        }
    }
}

impl WriterConfig {
    pub fn from_settings(scan: &ScanSettings) -> Self {
        Self {
            workers: scan.flush_workers.max(1),
            max_buffered_records: scan.max_buffered_records.max(1),
            ..Self::default()
        }
    }
}

/// Counters reported when the writer is finished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub records_buffered: u64,
    pub records_inserted: u64,
    pub jobs_dispatched: u64,
    pub checkpoint: Option<u64>,
}

/// Tracks which flush jobs are durable and the height that may be checkpointed.
///
/// Jobs complete in any order. Only the longest run of completed jobs starting at the first
/// sequence number counts, so the reported height never covers data still in flight.
#[derive(Debug, Default)]
pub struct FlushProgress {
    next_seq: u64,
    completed: BTreeMap<u64, Option<u64>>,
    durable_height: Option<u64>,
}

impl FlushProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record job `seq` as durable. Returns the new checkpoint height when it advanced.
    pub fn complete(&mut self, seq: u64, height: Option<u64>) -> Option<u64> {
        if seq < self.next_seq {
            return None;
        }
        self.completed.insert(seq, height);

        let mut advanced = None;
        while let Some(height) = self.completed.remove(&self.next_seq) {
            self.next_seq += 1;
            if let Some(height) = height {
                if self.durable_height.map_or(true, |durable| height > durable) {
                    self.durable_height = Some(height);
                    advanced = Some(height);
                }
            }
        }
        advanced
    }

    pub fn durable_height(&self) -> Option<u64> {
        self.durable_height
    }

    /// Completed jobs still waiting on an earlier one
    pub fn pending(&self) -> usize {
        self.completed.len()
    }
}

struct FlushJob {
    seq: u64,
    buckets: Vec<(BucketKey, Vec<TokenRecord>)>,
    checkpoint: Option<u64>,
}

struct Shared {
    kind: PipelineKind,
    store: Arc<dyn RecordStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    retry: RetryConfig,
    progress: Mutex<FlushProgress>,
    failure: OnceLock<AppError>,
    inserted: AtomicU64,
}

impl Shared {
    fn fail(&self, err: AppError) {
        error!(pipeline = %self.kind, error = %err, "Persistence failed");
        let _ = self.failure.set(err);
    }

    async fn write_bucket(&self, key: &BucketKey, records: &[TokenRecord]) -> Result<u64, AppError> {
        with_retry("ensure_table", &self.retry, || self.store.ensure_table(key)).await?;
        with_retry("insert_records", &self.retry, || self.store.insert_records(key, records)).await
    }

    async fn process(&self, job: FlushJob) -> Result<(), AppError> {
        for (key, records) in &job.buckets {
            let inserted = self.write_bucket(key, records).await?;
            self.inserted.fetch_add(inserted, Ordering::Relaxed);
            info!(bucket = %key, records = records.len(), inserted, "Flushed bucket");
        }

        // Saves happen under the lock so checkpoints are written in order
        let mut progress = self.progress.lock().await;
        if let Some(height) = progress.complete(job.seq, job.checkpoint) {
            if self.failure.get().is_none() {
                with_retry("save_checkpoint", &self.retry, || self.checkpoints.save(self.kind, height)).await?;
                debug!(pipeline = %self.kind, height, "Checkpoint advanced");
            }
        }
        Ok(())
    }
}

async fn flush_worker(id: usize, shared: Arc<Shared>, jobs: Arc<Mutex<mpsc::Receiver<FlushJob>>>) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };
        let seq = job.seq;
        if let Err(e) = shared.process(job).await {
            error!(worker = id, seq, "Flush job failed");
            shared.fail(e);
        }
    }
    debug!(worker = id, pipeline = %shared.kind, "Flush worker stopped");
}

/// Buffers records per day bucket and hands completed buckets to a pool of flush workers.
///
/// A record for a bucket that is not open, while anything is buffered, flushes every open
/// bucket first. `commit(height)` declares that everything up to `height` has been pushed;
/// the checkpoint moves to that height once all of it is durable.
pub struct BucketedWriter {
    kind: PipelineKind,
    max_buffered_records: usize,
    buffer: BTreeMap<BucketKey, Vec<TokenRecord>>,
    buffered: usize,
    pending_checkpoint: Option<u64>,
    next_seq: u64,
    records_buffered: u64,
    sender: Option<mpsc::Sender<FlushJob>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl BucketedWriter {
    pub fn new(
        kind: PipelineKind,
        store: Arc<dyn RecordStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: WriterConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let shared = Arc::new(Shared {
            kind,
            store,
            checkpoints,
            retry: config.retry.clone(),
            progress: Mutex::new(FlushProgress::new()),
            failure: OnceLock::new(),
            inserted: AtomicU64::new(0),
        });

        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(flush_worker(id, shared.clone(), receiver.clone())))
            .collect();

        Self {
            kind,
            max_buffered_records: config.max_buffered_records.max(1),
            buffer: BTreeMap::new(),
            buffered: 0,
            pending_checkpoint: None,
            next_seq: 0,
            records_buffered: 0,
            sender: Some(sender),
            workers,
            shared,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Records currently held in memory
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Open bucket keys, in order
    pub fn open_buckets(&self) -> Vec<BucketKey> {
        self.buffer.keys().copied().collect()
    }

    pub async fn durable_height(&self) -> Option<u64> {
        self.shared.progress.lock().await.durable_height()
    }

    fn check_failure(&self) -> Result<(), AppError> {
        match self.shared.failure.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub async fn push(&mut self, record: TokenRecord) -> Result<(), AppError> {
        self.check_failure()?;
        let key = BucketKey::from_timestamp(self.kind, record.timestamp)?;

        if self.buffered > 0 && !self.buffer.contains_key(&key) {
            self.dispatch().await?;
        }

        self.buffer.entry(key).or_default().push(record);
        self.buffered += 1;
        self.records_buffered += 1;

        if self.buffered >= self.max_buffered_records {
            debug!(pipeline = %self.kind, buffered = self.buffered, "Buffer limit reached, flushing early");
            self.dispatch().await?;
        }
        Ok(())
    }

    pub async fn push_all(&mut self, records: impl IntoIterator<Item = TokenRecord>) -> Result<(), AppError> {
        for record in records {
            self.push(record).await?;
        }
        Ok(())
    }

    /// Everything up to and including `height` has been pushed
    pub async fn commit(&mut self, height: u64) -> Result<(), AppError> {
        self.check_failure()?;
        self.pending_checkpoint = Some(height);
        if self.buffer.is_empty() {
            // Marker job, so the checkpoint is ordered after earlier in-flight flushes
            self.dispatch().await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self) -> Result<(), AppError> {
        let buckets: Vec<_> = std::mem::take(&mut self.buffer).into_iter().collect();
        self.buffered = 0;

        let job = FlushJob {
            seq: self.next_seq,
            buckets,
            checkpoint: self.pending_checkpoint.take(),
        };
        self.next_seq += 1;

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| AppError::InternalError("Writer already finished".to_string()))?;
        if sender.send(job).await.is_err() {
            self.check_failure()?;
            return Err(AppError::InternalError("Flush workers stopped".to_string()));
        }
        Ok(())
    }

    /// Flush what is left, wait for every worker and report the first persistence error
    pub async fn finish(mut self) -> Result<FlushStats, AppError> {
        if !self.buffer.is_empty() || self.pending_checkpoint.is_some() {
            if let Err(e) = self.dispatch().await {
                error!(pipeline = %self.kind, error = %e, "Final flush could not be dispatched");
            }
        }
        self.sender.take();

        for handle in self.workers.drain(..) {
            handle.await?;
        }

        self.check_failure()?;

        let stats = FlushStats {
            records_buffered: self.records_buffered,
            records_inserted: self.shared.inserted.load(Ordering::Relaxed),
            jobs_dispatched: self.next_seq,
            checkpoint: self.shared.progress.lock().await.durable_height(),
        };
        info!(
            pipeline = %self.kind,
            records = stats.records_buffered,
            inserted = stats.records_inserted,
            checkpoint = ?stats.checkpoint,
            "Writer finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemoryCheckpointStore, InMemoryRecordStore};
    use alloy::primitives::{Address, B256, U256};
    use chrono::NaiveDate;

    const DAY: u64 = 86_400;
    const BASE: u64 = 1_600_041_600; // 2020-09-14 00:00:00 UTC

    fn record(block_number: u64, timestamp: u64) -> TokenRecord {
        TokenRecord {
            coin_id: 825,
            block_number,
            timestamp,
            tx_hash: B256::with_last_byte(block_number as u8),
            event_index: 0,
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            value: U256::from(1),
        }
    }

    fn writer(
        store: Arc<InMemoryRecordStore>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        max_buffered_records: usize,
    ) -> BucketedWriter {
        BucketedWriter::new(
            PipelineKind::TokenTransfers,
            store,
            checkpoints,
            WriterConfig {
                workers: 2,
                max_buffered_records,
                queue_capacity: 4,
                retry: RetryConfig::none(),
            },
        )
    }

    #[test]
    fn test_flush_progress_waits_for_contiguous_prefix() {
        let mut progress = FlushProgress::new();
        assert_eq!(progress.complete(1, Some(20)), None);
        assert_eq!(progress.complete(2, None), None);
        assert_eq!(progress.pending(), 2);
        assert_eq!(progress.durable_height(), None);

        // Job 0 lands last and releases the whole run
        assert_eq!(progress.complete(0, Some(10)), Some(20));
        assert_eq!(progress.pending(), 0);
        assert_eq!(progress.complete(3, Some(15)), None);
        assert_eq!(progress.durable_height(), Some(20));
    }

    #[tokio::test]
    async fn test_boundary_flushes_all_open_buckets() {
        let store = Arc::new(InMemoryRecordStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let mut writer = writer(store.clone(), checkpoints.clone(), 1_000);

        writer.push(record(1, BASE)).await.unwrap();
        writer.push(record(2, BASE + 10)).await.unwrap();
        assert_eq!(writer.buffered(), 2);

        // A new day closes the open bucket before buffering
        writer.push(record(3, BASE + DAY)).await.unwrap();
        assert_eq!(writer.buffered(), 1);
        assert_eq!(writer.open_buckets().len(), 1);

        writer.commit(3).await.unwrap();
        let stats = writer.finish().await.unwrap();

        assert_eq!(stats.records_buffered, 3);
        assert_eq!(stats.records_inserted, 3);
        assert_eq!(stats.checkpoint, Some(3));
        assert_eq!(checkpoints.load(PipelineKind::TokenTransfers).await.unwrap(), Some(3));

        let days: Vec<NaiveDate> = store.buckets().await.into_iter().map(|k| k.day).collect();
        assert_eq!(
            days,
            vec![NaiveDate::from_ymd_opt(2020, 9, 14).unwrap(), NaiveDate::from_ymd_opt(2020, 9, 15).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_early_flush_on_buffer_limit() {
        let store = Arc::new(InMemoryRecordStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let mut writer = writer(store.clone(), checkpoints, 2);

        writer.push(record(1, BASE)).await.unwrap();
        writer.push(record(2, BASE + 1)).await.unwrap();
        assert_eq!(writer.buffered(), 0);
        writer.push(record(3, BASE + 2)).await.unwrap();
        assert_eq!(writer.buffered(), 1);

        let stats = writer.finish().await.unwrap();
        assert_eq!(stats.records_inserted, 3);
        assert_eq!(stats.checkpoint, None);
    }

    #[tokio::test]
    async fn test_commit_with_open_bucket_defers_checkpoint() {
        let store = Arc::new(InMemoryRecordStore::new());
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let mut writer = writer(store.clone(), checkpoints.clone(), 1_000);

        writer.push(record(5, BASE)).await.unwrap();
        writer.commit(5).await.unwrap();
        tokio::task::yield_now().await;
        // Record 5 is still only in memory
        assert_eq!(writer.durable_height().await, None);
        assert_eq!(store.record_count().await, 0);

        let stats = writer.finish().await.unwrap();
        assert_eq!(stats.checkpoint, Some(5));
        assert_eq!(store.record_count().await, 1);
    }
}
