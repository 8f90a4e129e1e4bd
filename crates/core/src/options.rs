//! Options consumed by bucket operations and decorators

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::traits::Bucket;

/// Local root and remote prefix of a Push or Pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub local: PathBuf,
    pub remote: String,
    /// Glob matched against each file's path relative to the sync root;
    /// matching files are skipped
    pub exclude: Option<String>,
}

impl SyncOptions {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            exclude: None,
        }
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }

    /// Compile the exclusion pattern, if any
    pub(crate) fn exclude_pattern(&self) -> Result<Option<glob::Pattern>> {
        self.exclude
            .as_deref()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::Config(format!("invalid exclude pattern '{p}': {e}")))
            })
            .transpose()
    }
}

/// Source and destination of a [`Bucket::copy`]
#[derive(Clone)]
pub struct CopyOptions {
    pub source_key: String,
    pub destination_key: String,
    /// May be a different bucket, or a different backend entirely
    pub destination_bucket: Arc<dyn Bucket>,
}

impl CopyOptions {
    pub fn new(
        source_key: impl Into<String>,
        destination_key: impl Into<String>,
        destination_bucket: Arc<dyn Bucket>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            destination_key: destination_key.into(),
            destination_bucket,
        }
    }
}

impl fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("source_key", &self.source_key)
            .field("destination_key", &self.destination_key)
            .field("destination_bucket", &self.destination_bucket.name())
            .finish()
    }
}

/// Configuration of the parallel sync decorator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelBucketOptions {
    /// Number of worker tasks; zero means one per available CPU
    pub workers: usize,
    /// Log what would be transferred or deleted without doing it
    pub dry_run: bool,
    /// Remove the source side of a sync once the transfer finished
    pub delete_on_sync: bool,
}

impl Default for ParallelBucketOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            dry_run: false,
            delete_on_sync: false,
        }
    }
}

impl ParallelBucketOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(format!("parallel bucket options: {e}")))
    }

    /// Worker count with the zero default resolved
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            default_workers()
        } else {
            self.workers
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
