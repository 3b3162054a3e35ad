pub mod config;
pub mod consumer_config;
pub mod credentials;
pub mod reader;

pub use config::KafkaConfig;
pub use consumer_config::ConsumerConfigBuilder;
pub use credentials::{SaslCredentials, Secret};
pub use reader::{OffsetRange, RawMessage, SourceError, TopicReader, Watermarks};
