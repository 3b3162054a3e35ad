//! Resolution of `s3a://`-style locations into object stores.
//!
//! Credentials follow the usual AWS chain (env vars, IRSA, instance profile); only
//! the region and endpoint can be overridden, for local MinIO runs.

use std::sync::Arc;

use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::{debug, info};
use url::Url;

use crate::error::{IngestError, Result};

/// A directory-like prefix inside an object store.
#[derive(Debug, Clone)]
pub struct StorageLocation {
    store: Arc<dyn ObjectStore>,
    root: Path,
    url: String,
}

impl StorageLocation {
    pub fn new(store: Arc<dyn ObjectStore>, root: Path, url: impl Into<String>) -> Self {
        Self {
            store,
            root,
            url: url.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Path of an object relative to this location, e.g. `offsets/3`.
    pub fn path(&self, relative: &str) -> Path {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.child(part))
    }

    /// A nested location sharing the same store.
    pub fn join(&self, relative: &str) -> StorageLocation {
        StorageLocation {
            store: Arc::clone(&self.store),
            root: self.path(relative),
            url: format!("{}/{}", self.url.trim_end_matches('/'), relative),
        }
    }

    /// Object name relative to this location, or `None` when `path` lies elsewhere.
    pub fn relative_name(&self, path: &Path) -> Option<String> {
        let mut parts = path.prefix_match(&self.root)?;
        let first = parts.next()?;
        let name = parts.fold(first.as_ref().to_string(), |name, part| {
            format!("{name}/{}", part.as_ref())
        });
        Some(name)
    }
}

/// Object store settings that are not part of a location URL.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub aws_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_force_path_style: bool,
}

impl StorageOptions {
    pub fn resolve(&self, location: &str) -> Result<StorageLocation> {
        let url = Url::parse(location).map_err(|e| IngestError::InvalidLocation {
            location: location.to_string(),
            reason: e.to_string(),
        })?;

        let root = Path::from(url.path());

        let store: Arc<dyn ObjectStore> = match url.scheme() {
            "s3" | "s3a" | "s3n" => {
                let bucket = url.host_str().ok_or_else(|| IngestError::InvalidLocation {
                    location: location.to_string(),
                    reason: "missing bucket name".to_string(),
                })?;
                Arc::new(self.s3_store(bucket)?)
            }
            "file" => {
                let directory = url
                    .to_file_path()
                    .map_err(|_| IngestError::InvalidLocation {
                        location: location.to_string(),
                        reason: "not a local path".to_string(),
                    })?;
                std::fs::create_dir_all(&directory).map_err(|e| IngestError::InvalidLocation {
                    location: location.to_string(),
                    reason: e.to_string(),
                })?;
                let store = LocalFileSystem::new_with_prefix(&directory)?;
                debug!(?directory, "Using local filesystem store");
                return Ok(StorageLocation::new(Arc::new(store), Path::default(), location));
            }
            "memory" => Arc::new(InMemory::new()),
            scheme => {
                return Err(IngestError::InvalidLocation {
                    location: location.to_string(),
                    reason: format!("unsupported scheme {scheme}"),
                })
            }
        };

        Ok(StorageLocation::new(store, root, location))
    }

    fn s3_store(&self, bucket: &str) -> Result<impl ObjectStore> {
        // Start with from_env() to pick up AWS_* vars including IRSA credentials
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            // Commits rely on put-if-absent
            .with_conditional_put(S3ConditionalPut::ETagMatch);

        if let Some(ref region) = self.aws_region {
            builder = builder.with_region(region);
        }

        if let Some(ref endpoint) = self.s3_endpoint {
            builder = builder.with_endpoint(endpoint);
            if endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }

        if self.s3_force_path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }

        let store = builder.build()?;
        info!(bucket, "Created S3 object store");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3a_location_splits_bucket_and_prefix() {
        let options = StorageOptions {
            aws_region: Some("us-east-1".to_string()),
            ..Default::default()
        };

        let location = options
            .resolve("s3a://clicks-bucket/delta-lake/clicks")
            .unwrap();

        assert_eq!(location.root().as_ref(), "delta-lake/clicks");
        assert_eq!(location.url(), "s3a://clicks-bucket/delta-lake/clicks");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = StorageOptions::default()
            .resolve("hdfs://namenode/data")
            .unwrap_err();

        assert!(matches!(err, IngestError::InvalidLocation { .. }));
    }

    #[test]
    fn garbage_location_is_rejected() {
        let err = StorageOptions::default().resolve("not a url").unwrap_err();

        assert!(matches!(err, IngestError::InvalidLocation { .. }));
    }

    #[test]
    fn paths_and_nested_locations() {
        let location = StorageOptions::default()
            .resolve("memory://bucket/checkpoint")
            .unwrap();

        assert_eq!(location.path("offsets/3").as_ref(), "checkpoint/offsets/3");

        let offsets = location.join("offsets");
        assert_eq!(offsets.root().as_ref(), "checkpoint/offsets");
        assert_eq!(offsets.url(), "memory://bucket/checkpoint/offsets");
        assert_eq!(
            offsets.relative_name(&Path::from("checkpoint/offsets/12")),
            Some("12".to_string())
        );
        assert_eq!(offsets.relative_name(&Path::from("elsewhere/12")), None);
    }

    #[test]
    fn local_directory_is_created() {
        let directory = std::env::temp_dir().join(format!("click-ingest-{}", uuid::Uuid::new_v4()));
        let url = Url::from_directory_path(&directory).unwrap();

        let location = StorageOptions::default().resolve(url.as_str()).unwrap();

        assert!(directory.is_dir());
        assert_eq!(location.root().as_ref(), "");
        std::fs::remove_dir_all(&directory).unwrap();
    }
}
