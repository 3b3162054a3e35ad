use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use common_kafka::{ConsumerConfigBuilder, TopicReader};
use envconfig::Envconfig;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use click_ingest::args::JobArgs;
use click_ingest::config::{Config, LogFormat};
use click_ingest::event;
use click_ingest::session::Session;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(Level::INFO).into())
        .from_env_lossy();

    let log_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Argument errors exit here, before anything connects
    let args = JobArgs::parse();

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    init_tracing(config.log_format);

    info!(
        job_name = args.job_name.as_deref().unwrap_or("<none>"),
        topic = %args.kafka_topic,
        bucket = %args.output_s3_bucket,
        "Starting click ingest"
    );
    info!("Click event schema:\n{}", event::schema_tree());

    let session = Session::from_config(&config);
    session.install_signal_handlers();

    let group_id = format!("{}-{}", session.app_name(), args.kafka_topic);
    let client_config = ConsumerConfigBuilder::for_assign_only(&config.kafka.kafka_hosts, &group_id)
        .with_security(&config.kafka)
        .with_credentials(&args.credentials())
        .build();
    let reader = TopicReader::new(
        client_config,
        &args.kafka_topic,
        Duration::from_millis(config.kafka.kafka_operation_timeout_ms),
    );

    let mut query = session
        .start_query(reader, &args.paths(), config.query_options())
        .context("Failed to set up streaming query")?;

    let progress = query
        .await_termination()
        .await
        .context("Streaming query failed")?;

    info!(
        query_id = %progress.query_id,
        batches = progress.batches,
        rows = progress.rows_written,
        "Click ingest finished"
    );

    Ok(())
}
