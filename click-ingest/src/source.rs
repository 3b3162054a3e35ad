use std::collections::BTreeMap;

use async_trait::async_trait;
use common_kafka::{OffsetRange, RawMessage, SourceError, TopicReader, Watermarks};

/// Where the query reads from: a topic whose partitions can be asked for their
/// available offsets and read by offset range.
#[async_trait]
pub trait OffsetSource: Send + Sync {
    fn topic(&self) -> &str;

    async fn watermarks(&self) -> Result<BTreeMap<i32, Watermarks>, SourceError>;

    async fn fetch(
        &self,
        ranges: &BTreeMap<i32, OffsetRange>,
    ) -> Result<Vec<RawMessage>, SourceError>;

    async fn partitions(&self) -> Result<Vec<i32>, SourceError> {
        Ok(self.watermarks().await?.into_keys().collect())
    }

    async fn earliest_offsets(&self) -> Result<BTreeMap<i32, i64>, SourceError> {
        Ok(self
            .watermarks()
            .await?
            .into_iter()
            .map(|(partition, marks)| (partition, marks.low))
            .collect())
    }

    async fn latest_offsets(&self) -> Result<BTreeMap<i32, i64>, SourceError> {
        Ok(self
            .watermarks()
            .await?
            .into_iter()
            .map(|(partition, marks)| (partition, marks.high))
            .collect())
    }
}

#[async_trait]
impl OffsetSource for TopicReader {
    fn topic(&self) -> &str {
        TopicReader::topic(self)
    }

    async fn watermarks(&self) -> Result<BTreeMap<i32, Watermarks>, SourceError> {
        TopicReader::watermarks(self).await
    }

    async fn fetch(
        &self,
        ranges: &BTreeMap<i32, OffsetRange>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        TopicReader::fetch(self, ranges).await
    }
}

#[async_trait]
impl<'a, T: OffsetSource + ?Sized> OffsetSource for &'a T {
    fn topic(&self) -> &str {
        (**self).topic()
    }

    async fn watermarks(&self) -> Result<BTreeMap<i32, Watermarks>, SourceError> {
        (**self).watermarks().await
    }

    async fn fetch(
        &self,
        ranges: &BTreeMap<i32, OffsetRange>,
    ) -> Result<Vec<RawMessage>, SourceError> {
        (**self).fetch(ranges).await
    }
}
