use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use chrono::Utc;
use object_store::PutPayload;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::{Action, Add, CommitInfo, Format, Metadata, Protocol, Txn};
use super::table::{check_writable, CommitAttempt, DeltaTable, TableSnapshot};
use crate::error::{IngestError, Result};
use crate::event::{self, ClickEvent, FIELDS};
use crate::metrics_consts::COMMIT_CONFLICTS_COUNTER;

const MAX_COMMIT_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParquetCompression {
    Uncompressed,
    Snappy,
    Gzip,
    Zstd,
}

impl ParquetCompression {
    fn codec(self) -> Compression {
        match self {
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
        }
    }

    /// Codec tag in data file names, e.g. `part-...-c000.snappy.parquet`.
    fn file_suffix(self) -> &'static str {
        match self {
            ParquetCompression::Uncompressed => "",
            ParquetCompression::Snappy => ".snappy",
            ParquetCompression::Gzip => ".gz",
            ParquetCompression::Zstd => ".zstd",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCompressionError(pub String);

impl FromStr for ParquetCompression {
    type Err = ParseCompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uncompressed" | "none" => Ok(ParquetCompression::Uncompressed),
            "snappy" => Ok(ParquetCompression::Snappy),
            "gzip" => Ok(ParquetCompression::Gzip),
            "zstd" => Ok(ParquetCompression::Zstd),
            _ => Err(ParseCompressionError(s.to_string())),
        }
    }
}

/// What an append did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Committed { version: i64, rows: u64 },
    /// The table already holds this batch for this query.
    AlreadyCommitted,
    /// Nothing to write.
    Empty,
}

/// Append-only Delta writer for click events.
#[derive(Debug, Clone)]
pub struct DeltaSink {
    table: DeltaTable,
    compression: ParquetCompression,
}

impl DeltaSink {
    pub fn new(table: DeltaTable, compression: ParquetCompression) -> Self {
        Self { table, compression }
    }

    pub fn table(&self) -> &DeltaTable {
        &self.table
    }

    /// Append one micro-batch. Retrying a batch id that already landed for `query_id`
    /// is a no-op.
    pub async fn append(
        &self,
        query_id: Uuid,
        batch_id: u64,
        events: &[ClickEvent],
    ) -> Result<AppendOutcome> {
        let app_id = query_id.to_string();
        let batch_version = i64::try_from(batch_id).unwrap_or(i64::MAX);
        let mut snapshot = self.table.snapshot().await?;

        if self.already_committed(&snapshot, &app_id, batch_version) {
            info!(batch_id, "Batch already present in table, skipping write");
            return Ok(AppendOutcome::AlreadyCommitted);
        }
        check_writable(&snapshot, self.table.location().url())?;
        if events.is_empty() {
            return Ok(AppendOutcome::Empty);
        }

        let add = self.write_data_file(events).await?;
        let rows = events.len() as u64;

        for _ in 0..MAX_COMMIT_ATTEMPTS {
            let version = snapshot.next_version();
            let actions = self.commit_actions(&snapshot, &app_id, batch_version, add.clone());

            match self.table.try_commit(version, &actions).await? {
                CommitAttempt::Committed(version) => {
                    info!(
                        table = self.table.location().url(),
                        batch_id,
                        version,
                        rows,
                        file = add.path,
                        "Committed batch to delta table"
                    );
                    return Ok(AppendOutcome::Committed { version, rows });
                }
                CommitAttempt::Conflict(_) => {
                    metrics::counter!(COMMIT_CONFLICTS_COUNTER).increment(1);
                    snapshot = self.table.snapshot().await?;
                    if self.already_committed(&snapshot, &app_id, batch_version) {
                        // Our data file stays behind unreferenced; readers never see it.
                        warn!(batch_id, file = add.path, "Batch was committed by a concurrent writer");
                        return Ok(AppendOutcome::AlreadyCommitted);
                    }
                    check_writable(&snapshot, self.table.location().url())?;
                }
            }
        }

        Err(IngestError::CommitConflict {
            batch_id,
            attempts: MAX_COMMIT_ATTEMPTS,
        })
    }

    fn already_committed(&self, snapshot: &TableSnapshot, app_id: &str, batch_version: i64) -> bool {
        snapshot
            .app_version(app_id)
            .is_some_and(|version| version >= batch_version)
    }

    fn commit_actions(
        &self,
        snapshot: &TableSnapshot,
        app_id: &str,
        batch_version: i64,
        add: Add,
    ) -> Vec<Action> {
        let now = Utc::now().timestamp_millis();
        let mut actions = Vec::with_capacity(5);

        if snapshot.metadata.is_none() {
            actions.push(Action::Protocol(Protocol::default()));
            actions.push(Action::Metadata(Metadata {
                id: Uuid::new_v4().to_string(),
                name: None,
                description: None,
                format: Format {
                    provider: "parquet".to_string(),
                    options: HashMap::new(),
                },
                schema_string: event::delta_schema_string(),
                partition_columns: Vec::new(),
                configuration: HashMap::new(),
                created_time: Some(now),
            }));
        }

        actions.push(Action::Add(add));
        actions.push(Action::Txn(Txn {
            app_id: app_id.to_string(),
            version: batch_version,
            last_updated: Some(now),
        }));
        actions.push(Action::CommitInfo(CommitInfo {
            timestamp: now,
            operation: "STREAMING UPDATE".to_string(),
            operation_parameters: BTreeMap::from([
                ("outputMode".to_string(), "Append".to_string()),
                ("queryId".to_string(), app_id.to_string()),
                ("epochId".to_string(), batch_version.to_string()),
            ]),
            read_version: snapshot.version,
            is_blind_append: true,
            engine_info: concat!("click-ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }));

        actions
    }

    async fn write_data_file(&self, events: &[ClickEvent]) -> Result<Add> {
        let batch = event::to_record_batch(events)?;
        let properties = WriterProperties::builder()
            .set_compression(self.compression.codec())
            .build();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(properties))?;
        writer.write(&batch)?;
        writer.close()?;

        let name = format!(
            "part-00000-{}-c000{}.parquet",
            Uuid::new_v4(),
            self.compression.file_suffix()
        );
        let size = i64::try_from(buffer.len()).unwrap_or(i64::MAX);
        let path = self.table.location().path(&name);
        self.table
            .location()
            .store()
            .put(&path, PutPayload::from(buffer))
            .await?;

        Ok(Add {
            path: name,
            partition_values: HashMap::new(),
            size,
            modification_time: Utc::now().timestamp_millis(),
            data_change: true,
            stats: Some(file_stats(events).to_string()),
        })
    }
}

/// Delta file statistics: row count, per-column null counts, min/max of the numeric
/// columns.
fn file_stats(events: &[ClickEvent]) -> Value {
    let mut null_count = Map::new();
    for (index, (name, _)) in FIELDS.iter().enumerate() {
        let nulls = events.iter().filter(|event| event.nulls()[index]).count();
        null_count.insert(name.to_string(), json!(nulls));
    }

    let mut min_values = Map::new();
    let mut max_values = Map::new();

    let user_ids = events.iter().filter_map(|event| event.user_id);
    if let (Some(min), Some(max)) = (user_ids.clone().min(), user_ids.max()) {
        min_values.insert("user_id".to_string(), json!(min));
        max_values.insert("user_id".to_string(), json!(max));
    }

    let prices: Vec<f32> = events
        .iter()
        .filter_map(|event| event.price)
        .filter(|price| !price.is_nan())
        .collect();
    if let (Some(min), Some(max)) = (
        prices.iter().copied().reduce(f32::min),
        prices.iter().copied().reduce(f32::max),
    ) {
        if min.is_finite() && max.is_finite() {
            min_values.insert("price".to_string(), json!(min));
            max_values.insert("price".to_string(), json!(max));
        }
    }

    json!({
        "numRecords": events.len(),
        "minValues": min_values,
        "maxValues": max_values,
        "nullCount": null_count,
    })
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMode,
        PutMultipartOpts, PutOptions, PutResult,
    };
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    use super::super::actions::to_commit_bytes;
    use super::super::table::DELTA_LOG_DIR;
    use super::*;
    use crate::storage::StorageLocation;

    /// In-memory store where another writer wins the next `steal` commit races: the
    /// intruder commit lands at the version we are about to create.
    #[derive(Debug)]
    struct RacingStore {
        inner: InMemory,
        steal: AtomicUsize,
        intruder: Bytes,
    }

    impl RacingStore {
        fn new(intruder: &[Action]) -> Self {
            Self {
                inner: InMemory::new(),
                steal: AtomicUsize::new(0),
                intruder: Bytes::from(to_commit_bytes(intruder).unwrap()),
            }
        }

        fn steal_next_commits(&self, count: usize) {
            self.steal.store(count, Ordering::SeqCst);
        }
    }

    impl fmt::Display for RacingStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "RacingStore({})", self.inner)
        }
    }

    #[async_trait]
    impl ObjectStore for RacingStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            let racing = matches!(opts.mode, PutMode::Create)
                && location.as_ref().contains(DELTA_LOG_DIR)
                && self
                    .steal
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
            if racing {
                self.inner
                    .put(location, PutPayload::from(self.intruder.clone()))
                    .await?;
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn racing_sink(store: Arc<RacingStore>) -> DeltaSink {
        let location = StorageLocation::new(
            store,
            Path::from("bucket/delta-lake/clicks"),
            "memory://bucket/delta-lake/clicks",
        );
        DeltaSink::new(DeltaTable::new(location), ParquetCompression::Snappy)
    }

    fn intruder_txn(app_id: &str, version: i64) -> Action {
        Action::Txn(Txn {
            app_id: app_id.to_string(),
            version,
            last_updated: None,
        })
    }

    fn memory_sink() -> DeltaSink {
        let location = StorageLocation::new(
            Arc::new(InMemory::new()),
            Path::from("bucket/delta-lake/clicks"),
            "memory://bucket/delta-lake/clicks",
        );
        DeltaSink::new(DeltaTable::new(location), ParquetCompression::Snappy)
    }

    fn click(id: &str, user_id: i32, price: f32) -> ClickEvent {
        ClickEvent {
            click_id: Some(id.to_string()),
            user_id: Some(user_id),
            price: Some(price),
            ..Default::default()
        }
    }

    async fn read_rows(sink: &DeltaSink) -> usize {
        let snapshot = sink.table().snapshot().await.unwrap();
        let mut rows = 0;
        for add in snapshot.files.values() {
            let location = sink.table().location();
            let bytes: Bytes = location
                .store()
                .get(&location.path(&add.path))
                .await
                .unwrap()
                .bytes()
                .await
                .unwrap();
            let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
                .unwrap()
                .build()
                .unwrap();
            for batch in reader {
                rows += batch.unwrap().num_rows();
            }
        }
        rows
    }

    #[tokio::test]
    async fn first_append_creates_the_table() {
        let sink = memory_sink();
        let query_id = Uuid::new_v4();

        let outcome = sink
            .append(query_id, 0, &[click("a", 1, 2.5), click("b", 2, 1.0)])
            .await
            .unwrap();

        assert_eq!(outcome, AppendOutcome::Committed { version: 0, rows: 2 });

        let snapshot = sink.table().snapshot().await.unwrap();
        assert_eq!(snapshot.protocol, Some(Protocol::default()));
        assert_eq!(
            snapshot.metadata.as_ref().unwrap().schema_string,
            event::delta_schema_string()
        );
        assert_eq!(snapshot.app_version(&query_id.to_string()), Some(0));
        assert_eq!(snapshot.num_records(), 2);

        let add = snapshot.files.values().next().unwrap();
        assert!(add.path.starts_with("part-00000-"));
        assert!(add.path.ends_with("-c000.snappy.parquet"));
        assert_eq!(read_rows(&sink).await, 2);
    }

    #[tokio::test]
    async fn later_appends_skip_protocol_and_metadata() {
        let sink = memory_sink();
        let query_id = Uuid::new_v4();

        sink.append(query_id, 0, &[click("a", 1, 1.0)]).await.unwrap();
        let outcome = sink.append(query_id, 1, &[click("b", 2, 2.0)]).await.unwrap();

        assert_eq!(outcome, AppendOutcome::Committed { version: 1, rows: 1 });

        let location = sink.table().location();
        let commit = location
            .store()
            .get(&location.path("_delta_log/00000000000000000001.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let text = String::from_utf8(commit.to_vec()).unwrap();
        assert!(!text.contains("\"protocol\""));
        assert!(!text.contains("\"metaData\""));
        assert!(text.contains("\"add\""));
        assert!(text.contains("\"txn\""));
        assert!(text.contains("STREAMING UPDATE"));
        assert_eq!(read_rows(&sink).await, 2);
    }

    #[tokio::test]
    async fn replayed_batch_is_not_written_twice() {
        let sink = memory_sink();
        let query_id = Uuid::new_v4();
        let events = [click("a", 1, 1.0)];

        sink.append(query_id, 0, &events).await.unwrap();
        let outcome = sink.append(query_id, 0, &events).await.unwrap();

        assert_eq!(outcome, AppendOutcome::AlreadyCommitted);
        assert_eq!(sink.table().snapshot().await.unwrap().num_records(), 1);
    }

    #[tokio::test]
    async fn other_queries_do_not_suppress_writes() {
        let sink = memory_sink();

        sink.append(Uuid::new_v4(), 3, &[click("a", 1, 1.0)]).await.unwrap();
        let outcome = sink
            .append(Uuid::new_v4(), 0, &[click("b", 2, 2.0)])
            .await
            .unwrap();

        assert_eq!(outcome, AppendOutcome::Committed { version: 1, rows: 1 });
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let sink = memory_sink();

        let outcome = sink.append(Uuid::new_v4(), 0, &[]).await.unwrap();

        assert_eq!(outcome, AppendOutcome::Empty);
        assert_eq!(sink.table().snapshot().await.unwrap().version, None);
    }

    #[tokio::test]
    async fn queries_sharing_a_table_interleave_versions() {
        let sink = memory_sink();
        let query_id = Uuid::new_v4();
        sink.append(query_id, 0, &[click("a", 1, 1.0)]).await.unwrap();

        let other = Uuid::new_v4();
        sink.append(other, 0, &[click("b", 2, 2.0)]).await.unwrap();

        let outcome = sink.append(query_id, 1, &[click("c", 3, 3.0)]).await.unwrap();

        assert_eq!(outcome, AppendOutcome::Committed { version: 2, rows: 1 });
        assert_eq!(read_rows(&sink).await, 3);
    }

    #[test]
    fn stats_cover_counts_and_numeric_bounds() {
        let events = vec![
            click("a", 5, 2.5),
            click("b", -1, 10.0),
            ClickEvent::default(),
        ];

        let stats = file_stats(&events);

        assert_eq!(stats["numRecords"], 3);
        assert_eq!(stats["minValues"]["user_id"], -1);
        assert_eq!(stats["maxValues"]["user_id"], 5);
        assert_eq!(stats["minValues"]["price"], 2.5);
        assert_eq!(stats["maxValues"]["price"], 10.0);
        assert_eq!(stats["nullCount"]["click_id"], 1);
        assert_eq!(stats["nullCount"]["product"], 3);
    }

    #[test]
    fn compression_names_parse() {
        assert_eq!("snappy".parse(), Ok(ParquetCompression::Snappy));
        assert_eq!("ZSTD".parse(), Ok(ParquetCompression::Zstd));
        assert_eq!("none".parse(), Ok(ParquetCompression::Uncompressed));
        assert!("lzo".parse::<ParquetCompression>().is_err());
    }

    #[tokio::test]
    async fn lost_commit_race_retries_at_the_next_version() {
        let store = Arc::new(RacingStore::new(&[intruder_txn("other-query", 0)]));
        let sink = racing_sink(store.clone());
        let query_id = Uuid::new_v4();
        sink.append(query_id, 0, &[click("a", 1, 1.0)]).await.unwrap();

        store.steal_next_commits(1);
        let outcome = sink.append(query_id, 1, &[click("b", 2, 2.0)]).await.unwrap();

        assert_eq!(outcome, AppendOutcome::Committed { version: 2, rows: 1 });
        let snapshot = sink.table().snapshot().await.unwrap();
        assert_eq!(snapshot.app_version("other-query"), Some(0));
        assert_eq!(snapshot.app_version(&query_id.to_string()), Some(1));
        assert_eq!(read_rows(&sink).await, 2);
    }

    #[tokio::test]
    async fn race_lost_to_the_same_batch_is_not_retried() {
        let query_id = Uuid::new_v4();
        let store = Arc::new(RacingStore::new(&[intruder_txn(&query_id.to_string(), 1)]));
        let sink = racing_sink(store.clone());
        sink.append(query_id, 0, &[click("a", 1, 1.0)]).await.unwrap();

        store.steal_next_commits(1);
        let outcome = sink.append(query_id, 1, &[click("b", 2, 2.0)]).await.unwrap();

        assert_eq!(outcome, AppendOutcome::AlreadyCommitted);
        assert_eq!(sink.table().snapshot().await.unwrap().version, Some(1));
    }

    #[tokio::test]
    async fn endless_conflicts_give_up_after_bounded_attempts() {
        let store = Arc::new(RacingStore::new(&[intruder_txn("other-query", 0)]));
        let sink = racing_sink(store.clone());
        let query_id = Uuid::new_v4();
        sink.append(query_id, 0, &[click("a", 1, 1.0)]).await.unwrap();

        store.steal_next_commits(usize::MAX);
        let err = sink
            .append(query_id, 1, &[click("b", 2, 2.0)])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::CommitConflict {
                batch_id: 1,
                attempts: MAX_COMMIT_ATTEMPTS
            }
        ));
        let snapshot = sink.table().snapshot().await.unwrap();
        assert_eq!(snapshot.version, Some(10));
        assert_eq!(snapshot.app_version(&query_id.to_string()), Some(0));
    }

    #[tokio::test]
    async fn incompatible_table_is_not_written() {
        let sink = memory_sink();
        let newer = Action::Protocol(Protocol {
            min_reader_version: 3,
            min_writer_version: 7,
        });
        sink.table().try_commit(0, &[newer]).await.unwrap();

        let err = sink
            .append(Uuid::new_v4(), 0, &[click("a", 1, 1.0)])
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::UnsupportedLog { .. }));
        assert_eq!(sink.table().snapshot().await.unwrap().version, Some(0));
    }
}
