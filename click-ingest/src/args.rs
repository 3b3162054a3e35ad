use clap::Parser;
use common_kafka::{SaslCredentials, Secret};

/// Stream click events from a Kafka topic into a Delta table, processing whatever is
/// available at start, then exit.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct JobArgs {
    /// Bucket holding both the checkpoint and the table
    #[arg(long = "output_s3_bucket", value_parser = non_empty)]
    pub output_s3_bucket: String,

    /// Topic to read click events from
    #[arg(long = "kafka_topic", value_parser = non_empty)]
    pub kafka_topic: String,

    /// SASL username
    #[arg(long = "api_key", value_parser = non_empty)]
    pub api_key: String,

    /// SASL password
    #[arg(long = "api_secret")]
    pub api_secret: Secret,

    /// Name given to the run by the job scheduler
    #[arg(long = "JOB_NAME")]
    pub job_name: Option<String>,
}

/// Where a job keeps its state and its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub checkpoint: String,
    pub table: String,
}

impl JobArgs {
    pub fn credentials(&self) -> SaslCredentials {
        SaslCredentials::new(&self.api_key, self.api_secret.clone())
    }

    pub fn paths(&self) -> JobPaths {
        JobPaths {
            checkpoint: format!("s3a://{}/checkpoint", self.output_s3_bucket),
            table: format!(
                "s3a://{}/delta-lake/{}",
                self.output_s3_bucket, self.kafka_topic
            ),
        }
    }
}

fn non_empty(value: &str) -> Result<String, String> {
    if value.is_empty() {
        Err("value must not be empty".to_string())
    } else {
        Ok(value.to_string())
    }
}
