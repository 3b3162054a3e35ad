//! Write-ahead progress log for the streaming query.
//!
//! Layout under the checkpoint location:
//!
//! - `metadata`: the query id, created on the first run
//! - `offsets/<batch_id>`: offset range of a batch, written before the batch runs
//! - `commits/<batch_id>`: written once the batch is durably in the table
//!
//! A batch with an offsets entry but no commit entry was interrupted and is re-run
//! with exactly the same range on the next start.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{PutMode, PutOptions, PutPayload};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use common_kafka::OffsetRange;

use crate::error::{IngestError, Result};
use crate::storage::StorageLocation;

pub const METADATA_FILENAME: &str = "metadata";
pub const OFFSETS_DIR: &str = "offsets";
pub const COMMITS_DIR: &str = "commits";
pub const LOG_VERSION: u32 = 1;

/// Offset per partition. Depending on context this is the first offset to read
/// or one past the last offset read.
pub type PartitionOffsets = BTreeMap<i32, i64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEntry {
    pub version: u32,
    pub batch_id: u64,
    pub timestamp_ms: i64,
    pub topic: String,
    pub start: PartitionOffsets,
    pub end: PartitionOffsets,
}

impl OffsetEntry {
    pub fn new(batch_id: u64, topic: &str, start: PartitionOffsets, end: PartitionOffsets) -> Self {
        Self {
            version: LOG_VERSION,
            batch_id,
            timestamp_ms: Utc::now().timestamp_millis(),
            topic: topic.to_string(),
            start,
            end,
        }
    }

    /// Per-partition ranges to read. Partitions without a start offset begin at their end,
    /// i.e. contribute nothing.
    pub fn ranges(&self) -> BTreeMap<i32, OffsetRange> {
        self.end
            .iter()
            .map(|(partition, end)| {
                let start = self.start.get(partition).copied().unwrap_or(*end);
                (*partition, OffsetRange::new(start, *end))
            })
            .collect()
    }

    pub fn num_offsets(&self) -> u64 {
        self.ranges().values().map(OffsetRange::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub version: u32,
    pub batch_id: u64,
    pub timestamp_ms: i64,
    pub num_output_rows: u64,
}

impl CommitEntry {
    pub fn new(batch_id: u64, num_output_rows: u64) -> Self {
        Self {
            version: LOG_VERSION,
            batch_id,
            timestamp_ms: Utc::now().timestamp_millis(),
            num_output_rows,
        }
    }
}

pub struct CheckpointLog {
    location: StorageLocation,
    query_id: Uuid,
}

impl CheckpointLog {
    /// Open the checkpoint, creating its metadata if this is the first run.
    pub async fn open(location: StorageLocation) -> Result<Self> {
        let metadata_path = location.path(METADATA_FILENAME);

        let metadata = match read_json::<QueryMetadata>(&location, &metadata_path).await? {
            Some(metadata) => metadata,
            None => {
                let fresh = QueryMetadata { id: Uuid::new_v4() };
                match put_if_absent(&location, &metadata_path, &fresh).await {
                    Ok(()) => {
                        info!(query_id = %fresh.id, checkpoint = location.url(), "Created checkpoint");
                        fresh
                    }
                    // Lost the race against another run creating it; use theirs.
                    Err(IngestError::ObjectStore(object_store::Error::AlreadyExists { .. })) => {
                        read_json(&location, &metadata_path).await?.ok_or_else(|| {
                            IngestError::CorruptCheckpoint {
                                path: metadata_path.to_string(),
                                reason: "metadata vanished after creation".to_string(),
                            }
                        })?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        Ok(Self {
            location,
            query_id: metadata.id,
        })
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// The id the next planned batch gets. Ids are shared by every topic using
    /// this checkpoint.
    pub async fn next_batch_id(&self) -> Result<u64> {
        Ok(self
            .batch_ids(OFFSETS_DIR)
            .await?
            .last()
            .map_or(0, |id| id + 1))
    }

    /// The most recent offsets entry planned for `topic`.
    pub async fn latest_offsets_for(&self, topic: &str) -> Result<Option<OffsetEntry>> {
        for batch_id in self.batch_ids(OFFSETS_DIR).await?.into_iter().rev() {
            let path = self.location.path(&format!("{OFFSETS_DIR}/{batch_id}"));
            let Some(entry) = read_json::<OffsetEntry>(&self.location, &path).await? else {
                continue;
            };
            if entry.topic == topic {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub async fn is_committed(&self, batch_id: u64) -> Result<bool> {
        let path = self.location.path(&format!("{COMMITS_DIR}/{batch_id}"));
        Ok(read_json::<CommitEntry>(&self.location, &path)
            .await?
            .is_some())
    }

    pub async fn write_offsets(&self, entry: &OffsetEntry) -> Result<()> {
        self.write_entry(OFFSETS_DIR, entry.batch_id, entry).await
    }

    pub async fn write_commit(&self, entry: &CommitEntry) -> Result<()> {
        self.write_entry(COMMITS_DIR, entry.batch_id, entry).await
    }

    /// Batch ids present in `dir`, ascending. Names that are not batch ids are ignored.
    pub async fn batch_ids(&self, dir: &str) -> Result<Vec<u64>> {
        let directory = self.location.join(dir);
        let objects: Vec<_> = self
            .location
            .store()
            .list(Some(directory.root()))
            .try_collect()
            .await?;

        let mut ids: Vec<u64> = objects
            .iter()
            .filter_map(|meta| directory.relative_name(&meta.location))
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn write_entry<T: Serialize>(&self, dir: &str, batch_id: u64, entry: &T) -> Result<()> {
        let path = self.location.path(&format!("{dir}/{batch_id}"));
        match put_if_absent(&self.location, &path, entry).await {
            Err(IngestError::ObjectStore(object_store::Error::AlreadyExists { .. })) => Err(
                IngestError::ConcurrentRun(format!("{} ({dir}/{batch_id})", self.location.url())),
            ),
            other => other,
        }
    }
}

async fn read_json<T: DeserializeOwned>(
    location: &StorageLocation,
    path: &Path,
) -> Result<Option<T>> {
    let bytes: Bytes = match location.store().get(path).await {
        Ok(result) => result.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| IngestError::CorruptCheckpoint {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

async fn put_if_absent<T: Serialize>(
    location: &StorageLocation,
    path: &Path,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    let options = PutOptions {
        mode: PutMode::Create,
        ..Default::default()
    };

    location
        .store()
        .put_opts(path, PutPayload::from(body), options)
        .await?;
    Ok(())
}
