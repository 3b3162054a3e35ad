use std::num::NonZeroU64;

use common_kafka::KafkaConfig;
use envconfig::Envconfig;

use crate::delta::ParquetCompression;
use crate::query::QueryOptions;
use crate::storage::StorageOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}")),
        }
    }
}

/// Engine tunables. Everything job-specific, credentials included, comes from the
/// command line instead.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "KafkaReader")]
    pub app_name: String,

    #[envconfig(default = "true")]
    pub stop_gracefully_on_shutdown: bool,

    pub max_offsets_per_batch: Option<NonZeroU64>,

    #[envconfig(default = "true")]
    pub fail_on_data_loss: bool,

    #[envconfig(default = "snappy")]
    pub parquet_compression: ParquetCompression,

    pub aws_region: Option<String>,

    // Set for MinIO and other S3-compatible stores
    pub s3_endpoint: Option<String>,

    #[envconfig(default = "false")]
    pub s3_force_path_style: bool,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,
}

impl Config {
    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            max_offsets_per_batch: self.max_offsets_per_batch,
            fail_on_data_loss: self.fail_on_data_loss,
            stop_gracefully: self.stop_gracefully_on_shutdown,
        }
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            aws_region: self.aws_region.clone(),
            s3_endpoint: self.s3_endpoint.clone(),
            s3_force_path_style: self.s3_force_path_style,
        }
    }
}
