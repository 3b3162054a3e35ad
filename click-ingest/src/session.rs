use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::JobPaths;
use crate::config::Config;
use crate::delta::{DeltaSink, DeltaTable, ParquetCompression};
use crate::error::Result;
use crate::query::{QueryOptions, StreamingQuery};
use crate::source::OffsetSource;
use crate::storage::{StorageLocation, StorageOptions};

/// Process-wide context for starting queries: naming, storage resolution and the
/// shutdown signal every query listens to.
#[derive(Debug, Clone)]
pub struct Session {
    app_name: String,
    storage: StorageOptions,
    compression: ParquetCompression,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(
        app_name: impl Into<String>,
        storage: StorageOptions,
        compression: ParquetCompression,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            storage,
            compression,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.app_name,
            config.storage_options(),
            config.parquet_compression,
        )
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn resolve(&self, location: &str) -> Result<StorageLocation> {
        self.storage.resolve(location)
    }

    /// Cancel the session on SIGINT or SIGTERM.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            shutdown.cancel();
        });
    }

    pub fn start_query<S: OffsetSource>(
        &self,
        source: S,
        paths: &JobPaths,
        options: QueryOptions,
    ) -> Result<StreamingQuery<S>> {
        let checkpoint = self.resolve(&paths.checkpoint)?;
        let table = DeltaTable::new(self.resolve(&paths.table)?);

        info!(
            app = %self.app_name,
            checkpoint = %paths.checkpoint,
            table = %paths.table,
            "Resolved query locations"
        );

        Ok(StreamingQuery::new(
            format!("{}-{}", self.app_name, source.topic()),
            source,
            checkpoint,
            DeltaSink::new(table, self.compression),
            options,
            self.shutdown.child_token(),
        ))
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler, listening for SIGINT only");
            if ctrl_c.await.is_ok() {
                info!("Received SIGINT");
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received SIGINT");
    }
}
