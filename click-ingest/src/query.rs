//! The available-now streaming query: read everything the topic holds at start,
//! append it to the table in one or more checkpointed micro-batches, then stop.

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::time::Instant;

use common_kafka::Watermarks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointLog, CommitEntry, OffsetEntry, PartitionOffsets};
use crate::delta::{AppendOutcome, DeltaSink};
use crate::error::{IngestError, Result};
use crate::event::ClickEvent;
use crate::metrics_consts::{
    BATCHES_COMPLETED_COUNTER, BATCH_DURATION_HISTOGRAM, DATA_LOSS_COUNTER, ROWS_WRITTEN_COUNTER,
};
use crate::source::OffsetSource;
use crate::storage::StorageLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Upper bound on offsets per micro-batch, summed over partitions.
    pub max_offsets_per_batch: Option<NonZeroU64>,
    pub fail_on_data_loss: bool,
    /// Finish the in-flight batch on shutdown instead of abandoning it.
    pub stop_gracefully: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_offsets_per_batch: None,
            fail_on_data_loss: true,
            stop_gracefully: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Created,
    Running,
    Terminated { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryProgress {
    pub query_id: Uuid,
    /// Batches run to completion in this run, recovered ones included.
    pub batches: u64,
    pub rows_written: u64,
    /// Batches the table already held, found while recovering.
    pub skipped: u64,
}

impl QueryProgress {
    fn new(query_id: Uuid) -> Self {
        Self {
            query_id,
            batches: 0,
            rows_written: 0,
            skipped: 0,
        }
    }
}

pub struct StreamingQuery<S> {
    name: String,
    source: S,
    checkpoint: StorageLocation,
    sink: DeltaSink,
    options: QueryOptions,
    shutdown: CancellationToken,
    status: QueryStatus,
}

impl<S: OffsetSource> StreamingQuery<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        checkpoint: StorageLocation,
        sink: DeltaSink,
        options: QueryOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            checkpoint,
            sink,
            options,
            shutdown,
            status: QueryStatus::Created,
        }
    }

    pub fn status(&self) -> &QueryStatus {
        &self.status
    }

    /// Run the query until everything available at start is committed, or until it
    /// is stopped or fails.
    pub async fn await_termination(&mut self) -> Result<QueryProgress> {
        self.status = QueryStatus::Running;
        info!(
            query = %self.name,
            topic = self.source.topic(),
            checkpoint = self.checkpoint.url(),
            table = self.sink.table().location().url(),
            "Starting streaming query"
        );

        let start = Instant::now();
        let result = self.run().await;

        match &result {
            Ok(progress) => info!(
                query = %self.name,
                query_id = %progress.query_id,
                batches = progress.batches,
                rows = progress.rows_written,
                skipped = progress.skipped,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Streaming query terminated"
            ),
            Err(e) => error!(query = %self.name, error = %e, "Streaming query failed"),
        }

        self.status = QueryStatus::Terminated {
            error: result.as_ref().err().map(ToString::to_string),
        };
        result
    }

    async fn run(&self) -> Result<QueryProgress> {
        let log = CheckpointLog::open(self.checkpoint.clone()).await?;
        let mut progress = QueryProgress::new(log.query_id());
        let topic = self.source.topic();

        let mut next_batch_id = log.next_batch_id().await?;
        let mut committed_end = None;

        if let Some(entry) = log.latest_offsets_for(topic).await? {
            if log.is_committed(entry.batch_id).await? {
                committed_end = Some(entry.end);
            } else {
                info!(
                    batch_id = entry.batch_id,
                    offsets = entry.num_offsets(),
                    "Re-running batch left unfinished by a previous run"
                );
                let watermarks = self.source.watermarks().await?;
                let recovered = self.revalidate(&entry, &watermarks)?;
                self.run_batch(&log, &recovered, &mut progress).await?;
                committed_end = Some(recovered.end);
            }
        }

        if self.shutdown.is_cancelled() {
            info!("Shutdown requested, not planning new batches");
            return Ok(progress);
        }

        // The available-now target: nothing produced after this point is read.
        let watermarks = self.source.watermarks().await?;
        let start = self.resolve_start(committed_end.as_ref(), &watermarks)?;
        let target: PartitionOffsets = watermarks
            .iter()
            .map(|(partition, marks)| (*partition, marks.high))
            .collect();

        let plan = plan_batches(&start, &target, self.options.max_offsets_per_batch);
        if plan.is_empty() {
            info!(topic = self.source.topic(), "No new offsets available");
        }

        for (start, end) in plan {
            if self.shutdown.is_cancelled() {
                info!(next_batch_id, "Shutdown requested, stopping between batches");
                break;
            }

            let entry = OffsetEntry::new(next_batch_id, topic, start, end);
            log.write_offsets(&entry).await?;
            self.run_batch(&log, &entry, &mut progress).await?;
            next_batch_id += 1;
        }

        Ok(progress)
    }

    async fn run_batch(
        &self,
        log: &CheckpointLog,
        entry: &OffsetEntry,
        progress: &mut QueryProgress,
    ) -> Result<()> {
        let outcome = if self.options.stop_gracefully {
            self.execute(log, entry).await?
        } else {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    warn!(batch_id = entry.batch_id, "Abandoning in-flight batch");
                    return Err(IngestError::Interrupted);
                }
                outcome = self.execute(log, entry) => outcome?,
            }
        };

        progress.batches += 1;
        let topic = self.source.topic().to_string();
        let result = match outcome {
            AppendOutcome::Committed { rows, .. } => {
                progress.rows_written += rows;
                metrics::counter!(ROWS_WRITTEN_COUNTER, "topic" => topic.clone()).increment(rows);
                "committed"
            }
            AppendOutcome::AlreadyCommitted => {
                progress.skipped += 1;
                "already_committed"
            }
            AppendOutcome::Empty => "empty",
        };
        metrics::counter!(BATCHES_COMPLETED_COUNTER, "topic" => topic, "result" => result)
            .increment(1);
        Ok(())
    }

    /// Fetch, decode and append one batch, then mark it committed in the checkpoint.
    async fn execute(&self, log: &CheckpointLog, entry: &OffsetEntry) -> Result<AppendOutcome> {
        let batch_start = Instant::now();
        let ranges = entry.ranges();
        let messages = self.source.fetch(&ranges).await?;

        let expected = entry.num_offsets();
        if (messages.len() as u64) < expected {
            // Compacted topics and transaction markers leave holes in offset ranges.
            debug!(
                batch_id = entry.batch_id,
                expected,
                received = messages.len(),
                "Fewer messages than offsets in batch"
            );
        }

        let events: Vec<ClickEvent> = messages
            .iter()
            .map(|message| ClickEvent::from_payload(message.payload.as_deref()))
            .collect();

        let outcome = self
            .sink
            .append(log.query_id(), entry.batch_id, &events)
            .await?;

        log.write_commit(&CommitEntry::new(entry.batch_id, events.len() as u64))
            .await?;

        metrics::histogram!(BATCH_DURATION_HISTOGRAM).record(batch_start.elapsed().as_secs_f64());
        info!(
            batch_id = entry.batch_id,
            rows = events.len(),
            outcome = ?outcome,
            elapsed_ms = batch_start.elapsed().as_millis() as u64,
            "Batch complete"
        );
        Ok(outcome)
    }

    /// First offset to read per partition. Unseen partitions start at their earliest
    /// offset.
    fn resolve_start(
        &self,
        committed: Option<&PartitionOffsets>,
        watermarks: &BTreeMap<i32, Watermarks>,
    ) -> Result<PartitionOffsets> {
        let mut start = PartitionOffsets::new();

        for (&partition, marks) in watermarks {
            let offset = match committed.and_then(|offsets| offsets.get(&partition)) {
                Some(&checkpointed) => self.available_offset(partition, checkpointed, marks)?,
                None => marks.low,
            };
            start.insert(partition, offset);
        }

        Ok(start)
    }

    /// The recorded range of an unfinished batch, checked against what the topic still
    /// holds before it is read again.
    fn revalidate(
        &self,
        entry: &OffsetEntry,
        watermarks: &BTreeMap<i32, Watermarks>,
    ) -> Result<OffsetEntry> {
        let mut recovered = entry.clone();

        for (partition, range) in entry.ranges() {
            if range.is_empty() {
                continue;
            }
            let Some(marks) = watermarks.get(&partition) else {
                continue;
            };

            let start = self.available_offset(partition, range.start, marks)?;
            let end = if range.end > marks.high {
                // Fails or warns the same way an unavailable start does.
                self.available_offset(partition, range.end, marks)?;
                marks.high
            } else {
                range.end
            };

            recovered.start.insert(partition, start);
            recovered.end.insert(partition, end.max(start));
        }

        Ok(recovered)
    }

    /// `checkpointed` if the partition still holds it, otherwise its earliest offset
    /// when data loss is tolerated.
    fn available_offset(
        &self,
        partition: i32,
        checkpointed: i64,
        marks: &Watermarks,
    ) -> Result<i64> {
        let topic = self.source.topic();

        if checkpointed < marks.low {
            // Retention removed data that was never read.
            if self.options.fail_on_data_loss {
                return Err(IngestError::DataLoss {
                    topic: topic.to_string(),
                    partition,
                    checkpointed,
                    earliest: marks.low,
                });
            }
            warn!(
                topic,
                partition,
                checkpointed,
                low = marks.low,
                "Checkpointed offset was removed by retention, some data was lost"
            );
        } else if checkpointed > marks.high {
            // The log is shorter than what was already read: the topic was recreated.
            if self.options.fail_on_data_loss {
                return Err(IngestError::OffsetAhead {
                    topic: topic.to_string(),
                    partition,
                    checkpointed,
                    latest: marks.high,
                });
            }
            warn!(
                topic,
                partition,
                checkpointed,
                high = marks.high,
                "Checkpointed offset is past the end of the partition, reading from earliest"
            );
        } else {
            return Ok(checkpointed);
        }

        metrics::counter!(DATA_LOSS_COUNTER, "topic" => topic.to_string()).increment(1);
        Ok(marks.low)
    }
}

/// Split `[start, target)` into consecutive batches of at most `max_per_batch` offsets.
///
/// Each batch takes from every partition in proportion to what that partition still
/// has left; rounding leftovers go to the lowest partitions with room. Every batch
/// lists all partitions in both its start and its end.
pub fn plan_batches(
    start: &PartitionOffsets,
    target: &PartitionOffsets,
    max_per_batch: Option<NonZeroU64>,
) -> Vec<(PartitionOffsets, PartitionOffsets)> {
    let mut current: PartitionOffsets = target
        .iter()
        .map(|(partition, end)| (*partition, start.get(partition).copied().unwrap_or(*end)))
        .collect();

    let remaining_of = |current: &PartitionOffsets| -> BTreeMap<i32, u64> {
        current
            .iter()
            .map(|(partition, offset)| {
                let end = target.get(partition).copied().unwrap_or(*offset);
                (*partition, u64::try_from(end - offset).unwrap_or(0))
            })
            .collect()
    };

    let mut batches = Vec::new();
    loop {
        let remaining = remaining_of(&current);
        let total: u64 = remaining.values().sum();
        if total == 0 {
            return batches;
        }

        let limit = max_per_batch.map_or(total, |max| max.get().min(total));
        let mut shares: BTreeMap<i32, u64> = remaining
            .iter()
            .map(|(partition, left)| {
                let share = u128::from(*left) * u128::from(limit) / u128::from(total);
                (*partition, u64::try_from(share).unwrap_or(*left))
            })
            .collect();

        let mut leftover = limit - shares.values().sum::<u64>();
        for (partition, share) in shares.iter_mut() {
            if leftover == 0 {
                break;
            }
            let room = remaining[partition] - *share;
            let extra = room.min(leftover);
            *share += extra;
            leftover -= extra;
        }

        let end: PartitionOffsets = current
            .iter()
            .map(|(partition, offset)| {
                let share = i64::try_from(shares[partition]).unwrap_or(i64::MAX);
                (*partition, offset + share)
            })
            .collect();

        batches.push((current, end.clone()));
        current = end;
    }
}
