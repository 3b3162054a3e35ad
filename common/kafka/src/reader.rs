//! Bounded reads of a single topic.
//!
//! `TopicReader` answers two questions: which offsets are currently available on each
//! partition, and what messages lie in a given `[start, end)` range. It never joins a
//! consumer group, so the caller owns progress tracking entirely.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while reading from the topic.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to create consumer: {0}")]
    ConsumerCreation(#[source] KafkaError),

    #[error("failed to assign partitions: {0}")]
    PartitionAssignment(#[source] KafkaError),

    #[error("topic {0} does not exist or has no partitions")]
    UnknownTopic(String),

    #[error("broker reported {reason} for topic {topic}")]
    TopicMetadata { topic: String, reason: String },

    #[error("timeout during {operation} for partition {partition:?}")]
    Timeout {
        operation: &'static str,
        partition: Option<i32>,
    },

    #[error("requested offsets of topic {topic} are outside the partition log")]
    OffsetOutOfRange { topic: String },

    #[error("kafka error during {operation} for partition {partition:?}: {source}")]
    Kafka {
        operation: &'static str,
        partition: Option<i32>,
        #[source]
        source: KafkaError,
    },

    #[error("blocking kafka task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl SourceError {
    fn kafka(operation: &'static str, partition: Option<i32>, source: KafkaError) -> Self {
        SourceError::Kafka {
            operation,
            partition,
            source,
        }
    }

    /// Returns the error type tag for logging
    pub fn error_type(&self) -> &'static str {
        match self {
            SourceError::ConsumerCreation(_) => "consumer_creation",
            SourceError::PartitionAssignment(_) => "partition_assignment",
            SourceError::UnknownTopic(_) => "unknown_topic",
            SourceError::TopicMetadata { .. } => "topic_metadata",
            SourceError::Timeout { .. } => "timeout",
            SourceError::OffsetOutOfRange { .. } => "offset_out_of_range",
            SourceError::Kafka { .. } => "kafka_error",
            SourceError::Blocking(_) => "blocking_task",
        }
    }
}

/// Low and high watermark of one partition. `high` is the offset the next
/// produced message will get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

/// Half-open offset range `[start, end)` of a single partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    pub start: i64,
    pub end: i64,
}

impl OffsetRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn len(&self) -> u64 {
        u64::try_from(self.end - self.start).unwrap_or(0)
    }
}

/// An owned copy of a consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl RawMessage {
    fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        Self {
            partition: message.partition(),
            offset: message.offset(),
            timestamp_ms: message.timestamp().to_millis(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
        }
    }
}

#[derive(Clone)]
pub struct TopicReader {
    config: ClientConfig,
    topic: String,
    timeout: Duration,
}

impl TopicReader {
    /// `config` should come from `ConsumerConfigBuilder::for_assign_only`. The timeout
    /// applies to each metadata/watermark query and to each wait for the next message.
    pub fn new(config: ClientConfig, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            config,
            topic: topic.into(),
            timeout,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Query the broker for the current watermarks of every partition of the topic.
    ///
    /// Runs on the blocking pool: metadata and watermark queries are synchronous in rdkafka.
    pub async fn watermarks(&self) -> Result<BTreeMap<i32, Watermarks>, SourceError> {
        let config = self.config.clone();
        let topic = self.topic.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || fetch_watermarks(&config, &topic, timeout)).await?
    }

    /// Read every message in the given ranges.
    ///
    /// A partition is done once a message at or past `end - 1` is seen, or when the
    /// broker reports end-of-partition (the tail of a range can be transaction
    /// markers that are never delivered).
    pub async fn fetch(
        &self,
        ranges: &BTreeMap<i32, OffsetRange>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let mut pending: BTreeMap<i32, i64> = ranges
            .iter()
            .filter(|(_, range)| !range.is_empty())
            .map(|(partition, range)| (*partition, range.end))
            .collect();

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut config = self.config.clone();
        config.set("enable.partition.eof", "true");
        let consumer: StreamConsumer = config.create().map_err(SourceError::ConsumerCreation)?;

        let mut assignment = TopicPartitionList::new();
        for (partition, range) in ranges.iter().filter(|(_, range)| !range.is_empty()) {
            assignment
                .add_partition_offset(&self.topic, *partition, Offset::Offset(range.start))
                .map_err(SourceError::PartitionAssignment)?;
        }
        consumer
            .assign(&assignment)
            .map_err(SourceError::PartitionAssignment)?;

        let expected: u64 = ranges.values().map(OffsetRange::len).sum();
        let mut messages = Vec::with_capacity(usize::try_from(expected).unwrap_or(0));

        while let Some(&waiting_on) = pending.keys().next() {
            let received = match tokio::time::timeout(self.timeout, consumer.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        topic = %self.topic,
                        partition = waiting_on,
                        "Timed out waiting for messages"
                    );
                    return Err(SourceError::Timeout {
                        operation: "recv",
                        partition: Some(waiting_on),
                    });
                }
            };

            match received {
                Ok(message) => {
                    let partition = message.partition();
                    let Some(&end) = pending.get(&partition) else {
                        continue;
                    };
                    if message.offset() < end {
                        messages.push(RawMessage::from_borrowed(&message));
                    }
                    if message.offset() >= end - 1 {
                        pending.remove(&partition);
                    }
                }
                Err(KafkaError::PartitionEOF(partition)) => {
                    if pending.remove(&partition).is_some() {
                        debug!(topic = %self.topic, partition, "Reached end of partition");
                    }
                }
                Err(KafkaError::MessageConsumption(RDKafkaErrorCode::AutoOffsetReset)) => {
                    warn!(topic = %self.topic, "Assigned offset is outside the partition log");
                    return Err(SourceError::OffsetOutOfRange {
                        topic: self.topic.clone(),
                    });
                }
                Err(e) => return Err(SourceError::kafka("recv", None, e)),
            }
        }

        info!(
            topic = %self.topic,
            messages = messages.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fetched offset ranges"
        );

        Ok(messages)
    }
}

fn fetch_watermarks(
    config: &ClientConfig,
    topic: &str,
    timeout: Duration,
) -> Result<BTreeMap<i32, Watermarks>, SourceError> {
    let consumer: BaseConsumer = config.create().map_err(SourceError::ConsumerCreation)?;

    let metadata = consumer
        .fetch_metadata(Some(topic), timeout)
        .map_err(|e| SourceError::kafka("fetch_metadata", None, e))?;

    let topic_metadata = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .ok_or_else(|| SourceError::UnknownTopic(topic.to_string()))?;

    if let Some(code) = topic_metadata.error() {
        return Err(SourceError::TopicMetadata {
            topic: topic.to_string(),
            reason: format!("{code:?}"),
        });
    }
    if topic_metadata.partitions().is_empty() {
        return Err(SourceError::UnknownTopic(topic.to_string()));
    }

    let mut watermarks = BTreeMap::new();
    for partition in topic_metadata.partitions().iter().map(|p| p.id()) {
        let (low, high) = consumer
            .fetch_watermarks(topic, partition, timeout)
            .map_err(|e| SourceError::kafka("fetch_watermarks", Some(partition), e))?;
        watermarks.insert(partition, Watermarks { low, high });
    }

    debug!(topic, partitions = watermarks.len(), "Fetched watermarks");
    Ok(watermarks)
}
