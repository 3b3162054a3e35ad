//! An in-memory topic for driving queries without a broker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common_kafka::{OffsetRange, RawMessage, SourceError, Watermarks};
use serde_json::Value;

use crate::source::OffsetSource;

#[derive(Debug, Default)]
struct Partition {
    low: i64,
    // Index equals offset; entries below `low` are treated as deleted.
    messages: Vec<RawMessage>,
}

#[derive(Debug)]
pub struct MemorySource {
    topic: String,
    partitions: Mutex<BTreeMap<i32, Partition>>,
    failing_fetches: AtomicUsize,
    stalled: AtomicBool,
    fetches: AtomicUsize,
}

impl MemorySource {
    /// A topic with a single empty partition.
    pub fn new(topic: &str) -> Self {
        Self::with_partitions(topic, 1)
    }

    pub fn with_partitions(topic: &str, count: i32) -> Self {
        Self {
            topic: topic.to_string(),
            partitions: Mutex::new((0..count).map(|p| (p, Partition::default())).collect()),
            failing_fetches: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Append a message, returning its offset. Unknown partitions are created.
    pub fn push(&self, partition: i32, payload: Option<&[u8]>) -> i64 {
        let mut partitions = self.lock();
        let log = partitions.entry(partition).or_default();
        let offset = i64::try_from(log.messages.len()).unwrap_or(i64::MAX);
        log.messages.push(RawMessage {
            partition,
            offset,
            timestamp_ms: None,
            key: None,
            payload: payload.map(<[u8]>::to_vec),
        });
        offset
    }

    pub fn push_json(&self, partition: i32, value: &Value) -> i64 {
        self.push(partition, Some(value.to_string().as_bytes()))
    }

    /// Drop everything below `offset`, like retention would.
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        if let Some(log) = self.lock().get_mut(&partition) {
            log.low = log.low.max(offset);
        }
    }

    /// Make the next `count` fetches fail with a timeout.
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    /// While set, fetches never complete, like a broker that stopped answering.
    pub fn stall_fetches(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Fetch calls so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, Partition>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OffsetSource for MemorySource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn watermarks(&self) -> Result<BTreeMap<i32, Watermarks>, SourceError> {
        let partitions = self.lock();
        if partitions.is_empty() {
            return Err(SourceError::UnknownTopic(self.topic.clone()));
        }

        Ok(partitions
            .iter()
            .map(|(partition, log)| {
                let high = i64::try_from(log.messages.len()).unwrap_or(i64::MAX);
                (*partition, Watermarks { low: log.low, high })
            })
            .collect())
    }

    async fn fetch(
        &self,
        ranges: &BTreeMap<i32, OffsetRange>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            return Err(SourceError::Timeout {
                operation: "recv",
                partition: ranges.keys().next().copied(),
            });
        }

        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let partitions = self.lock();
        let mut messages = Vec::new();
        for (partition, range) in ranges {
            let Some(log) = partitions.get(partition) else {
                continue;
            };
            // Consumers never reset on their own: reading removed offsets is an error.
            if !range.is_empty() && range.start < log.low {
                return Err(SourceError::OffsetOutOfRange {
                    topic: self.topic.clone(),
                });
            }
            messages.extend(
                log.messages
                    .iter()
                    .filter(|m| m.offset >= range.start && m.offset < range.end)
                    .cloned(),
            );
        }
        Ok(messages)
    }
}
