use std::collections::{BTreeMap, HashMap};

use futures::{stream, StreamExt, TryStreamExt};
use object_store::{PutMode, PutOptions, PutPayload};
use serde::Deserialize;
use tracing::{debug, warn};

use super::actions::{
    to_commit_bytes, Action, Add, LogLine, Metadata, Protocol, MIN_READER_VERSION,
    MIN_WRITER_VERSION,
};
use crate::error::{IngestError, Result};
use crate::event::FIELDS;
use crate::storage::StorageLocation;

pub const DELTA_LOG_DIR: &str = "_delta_log";

// Commit files fetched concurrently while replaying the log
const REPLAY_CONCURRENCY: usize = 16;

/// State of the table after replaying the log.
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    /// `None` while the table has no commits yet.
    pub version: Option<i64>,
    pub protocol: Option<Protocol>,
    pub metadata: Option<Metadata>,
    pub app_transactions: HashMap<String, i64>,
    pub files: BTreeMap<String, Add>,
}

impl TableSnapshot {
    pub fn next_version(&self) -> i64 {
        self.version.map_or(0, |version| version + 1)
    }

    pub fn app_version(&self, app_id: &str) -> Option<i64> {
        self.app_transactions.get(app_id).copied()
    }

    /// Sum of `numRecords` over live files. Files without stats count as zero.
    pub fn num_records(&self) -> u64 {
        self.files.values().filter_map(Add::num_records).sum()
    }

    fn apply(&mut self, line: LogLine) {
        if let Some(protocol) = line.protocol {
            self.protocol = Some(protocol);
        }
        if let Some(metadata) = line.meta_data {
            self.metadata = Some(metadata);
        }
        if let Some(add) = line.add {
            self.files.insert(add.path.clone(), add);
        }
        if let Some(remove) = line.remove {
            self.files.remove(&remove.path);
        }
        if let Some(txn) = line.txn {
            self.app_transactions.insert(txn.app_id, txn.version);
        }
    }
}

/// Result of trying to write one commit file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAttempt {
    Committed(i64),
    /// Another writer already owns this version.
    Conflict(i64),
}

#[derive(Debug, Clone)]
pub struct DeltaTable {
    location: StorageLocation,
}

impl DeltaTable {
    pub fn new(location: StorageLocation) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Replay the JSON commits in `_delta_log/`.
    pub async fn snapshot(&self) -> Result<TableSnapshot> {
        let versions = self.commit_versions().await?;

        if let Some(first) = versions.first().copied().filter(|first| *first != 0) {
            return Err(self.unsupported(format!(
                "log starts at version {first}; replaying from a checkpoint is not supported"
            )));
        }
        if let Some(gap) = versions
            .iter()
            .zip(versions.iter().skip(1))
            .find(|(previous, next)| **next != **previous + 1)
        {
            return Err(self.unsupported(format!(
                "missing commits between versions {} and {}",
                gap.0, gap.1
            )));
        }

        let commits: Vec<Vec<LogLine>> = stream::iter(versions.iter().copied())
            .map(|version| self.read_commit(version))
            .buffered(REPLAY_CONCURRENCY)
            .try_collect()
            .await?;

        let mut snapshot = TableSnapshot {
            version: versions.last().copied(),
            ..Default::default()
        };
        for line in commits.into_iter().flatten() {
            snapshot.apply(line);
        }

        debug!(
            table = self.location.url(),
            version = snapshot.version,
            files = snapshot.files.len(),
            "Loaded table snapshot"
        );
        Ok(snapshot)
    }

    /// Write `actions` as commit `version`, unless some other writer got there first.
    pub async fn try_commit(&self, version: i64, actions: &[Action]) -> Result<CommitAttempt> {
        let body = to_commit_bytes(actions)?;
        let path = self.location.path(&commit_file(version));
        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };

        match self
            .location
            .store()
            .put_opts(&path, PutPayload::from(body), options)
            .await
        {
            Ok(_) => Ok(CommitAttempt::Committed(version)),
            Err(object_store::Error::AlreadyExists { .. }) => {
                warn!(table = self.location.url(), version, "Commit version already taken");
                Ok(CommitAttempt::Conflict(version))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn commit_versions(&self) -> Result<Vec<i64>> {
        let log = self.location.join(DELTA_LOG_DIR);
        let listing = self
            .location
            .store()
            .list_with_delimiter(Some(log.root()))
            .await?;

        let mut versions: Vec<i64> = listing
            .objects
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(parse_commit_file)
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_commit(&self, version: i64) -> Result<Vec<LogLine>> {
        let path = self.location.path(&commit_file(version));
        let bytes = self.location.store().get(&path).await?.bytes().await?;

        let text = String::from_utf8_lossy(&bytes);
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(IngestError::from))
            .collect()
    }

    fn unsupported(&self, reason: String) -> IngestError {
        IngestError::UnsupportedLog {
            location: self.location.url().to_string(),
            reason,
        }
    }
}

fn commit_file(version: i64) -> String {
    format!("{DELTA_LOG_DIR}/{version:020}.json")
}

fn parse_commit_file(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".json")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[derive(Deserialize)]
struct StructType {
    fields: Vec<StructField>,
}

#[derive(Deserialize)]
struct StructField {
    name: String,
    #[serde(rename = "type")]
    data_type: serde_json::Value,
    #[serde(default = "nullable_by_default")]
    nullable: bool,
}

fn nullable_by_default() -> bool {
    true
}

const COLUMN_MAPPING_MODE: &str = "delta.columnMapping.mode";

/// Whether this writer may append to the table as replayed: the protocol must be one
/// it implements and the metadata must accept click rows.
pub fn check_writable(snapshot: &TableSnapshot, location: &str) -> Result<()> {
    if let Some(protocol) = &snapshot.protocol {
        check_protocol(protocol, location)?;
    }
    if let Some(metadata) = &snapshot.metadata {
        check_schema(metadata, location)?;
    }
    Ok(())
}

/// Reader and writer versions above (1, 2) bring features such as deletion vectors,
/// column mapping or invariants that this writer does not honour.
pub fn check_protocol(protocol: &Protocol, location: &str) -> Result<()> {
    if protocol.min_reader_version > MIN_READER_VERSION
        || protocol.min_writer_version > MIN_WRITER_VERSION
    {
        return Err(IngestError::UnsupportedLog {
            location: location.to_string(),
            reason: format!(
                "protocol requires reader version {} and writer version {}, supported are {} and {}",
                protocol.min_reader_version,
                protocol.min_writer_version,
                MIN_READER_VERSION,
                MIN_WRITER_VERSION
            ),
        });
    }
    Ok(())
}

/// Every click event column must exist in the table with the same type. Extra table
/// columns are fine as long as they are nullable: rows written here leave them null.
pub fn check_schema(metadata: &Metadata, location: &str) -> Result<()> {
    let mismatch = |reason: String| IngestError::SchemaMismatch {
        location: location.to_string(),
        reason,
    };

    if !metadata.partition_columns.is_empty() {
        return Err(mismatch(format!(
            "table is partitioned by {:?}",
            metadata.partition_columns
        )));
    }

    // Physical column names would differ from the logical ones written here.
    if let Some(mode) = metadata.configuration.get(COLUMN_MAPPING_MODE) {
        if mode != "none" {
            return Err(mismatch(format!("column mapping mode {mode} is not supported")));
        }
    }

    let table: StructType = serde_json::from_str(&metadata.schema_string)
        .map_err(|e| mismatch(format!("unreadable schema: {e}")))?;

    if let Some(field) = table.fields.iter().find(|f| !f.nullable) {
        return Err(mismatch(format!(
            "column {} is not nullable but decoded clicks may leave it null",
            field.name
        )));
    }

    for (name, field_type) in FIELDS {
        let Some(existing) = table.fields.iter().find(|f| f.name == name) else {
            return Err(mismatch(format!("column {name} is missing")));
        };
        if existing.data_type.as_str() != Some(field_type.type_name()) {
            return Err(mismatch(format!(
                "column {name} has type {}, expected {}",
                existing.data_type,
                field_type.type_name()
            )));
        }
    }
    Ok(())
}
