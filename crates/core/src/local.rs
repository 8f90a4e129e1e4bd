//! Local filesystem bucket
//!
//! Keys map onto files under `root/prefix`. Writers stream into a temporary
//! sibling file that is moved into place on close.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::cancel::ensure_active;
use crate::error::{Error, ErrorCollector, Result};
use crate::fsutil::{temp_sibling, walk_local_tree};
use crate::key::{join_key, key_to_path, path_to_key};
use crate::traits::{
    Bucket, BucketItem, BucketIterator, DEFAULT_BATCH_SIZE, ItemsIterator, ObjectReader,
    ObjectWriter,
};

/// Construction options for [`LocalBucket`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOptions {
    /// Root directory of the bucket
    pub path: PathBuf,
    pub prefix: String,
    /// Reject writes to keys that already exist
    pub if_not_exists: bool,
    pub batch_size: usize,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            prefix: String::new(),
            if_not_exists: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl LocalOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Bucket backed by a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
    prefix: String,
    name: String,
    if_not_exists: bool,
    batch_size: usize,
}

impl LocalBucket {
    pub fn new(options: LocalOptions) -> Result<Self> {
        if options.path.as_os_str().is_empty() {
            return Err(Error::Config("local bucket requires a path".to_string()));
        }
        if options.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        Ok(Self {
            name: options.path.display().to_string(),
            root: options.path,
            prefix: options.prefix,
            if_not_exists: options.if_not_exists,
            batch_size: options.batch_size,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn normalize_key(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(key_to_path(&join_key(&self.prefix, key))?))
    }

    /// Directory holding every key of this bucket
    fn base_dir(&self) -> PathBuf {
        match key_to_path(&self.prefix) {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.clone(),
        }
    }
}

struct LocalWriter {
    key: String,
    dest: PathBuf,
    tmp: PathBuf,
    file: tokio::fs::File,
    if_not_exists: bool,
}

impl LocalWriter {
    async fn commit(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if self.if_not_exists {
            // hard_link refuses to replace an existing file
            match tokio::fs::hard_link(&self.tmp, &self.dest).await {
                Ok(()) => {
                    tokio::fs::remove_file(&self.tmp).await?;
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(Error::AlreadyExists(self.key.clone()))
                }
                Err(e) => Err(e.into()),
            }
        } else {
            tokio::fs::rename(&self.tmp, &self.dest).await?;
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.file.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let result = this.commit().await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&this.tmp).await;
        }
        result
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        ensure_active(ctx)?;
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| Error::from(e).context(format!("bucket '{}'", self.name)))?;
        if !meta.is_dir() {
            return Err(Error::Config(format!("'{}' is not a directory", self.name)));
        }
        Ok(())
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        ensure_active(ctx)?;
        let path = self.normalize_key(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        ensure_active(ctx)?;
        let dest = self.normalize_key(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(&dest);
        let file = tokio::fs::File::create(&tmp).await?;
        Ok(Box::new(LocalWriter {
            key: key.to_string(),
            dest,
            tmp,
            file,
            if_not_exists: self.if_not_exists,
        }))
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        ensure_active(ctx)?;
        let path = self.normalize_key(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<Box<dyn BucketIterator>> {
        let base = self.base_dir();
        let files = match tokio::fs::metadata(&base).await {
            Ok(meta) if meta.is_dir() => walk_local_tree(ctx, &base).await?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        for rel in files {
            let key = path_to_key(&rel)?;
            if !key.starts_with(prefix) || is_partial(&key) {
                continue;
            }
            let meta = tokio::fs::metadata(base.join(&rel)).await?;
            items.push(BucketItem {
                bucket: self.name.clone(),
                key,
                size: meta.len(),
                last_modified: meta.modified().ok().and_then(|t| Timestamp::try_from(t).ok()),
                hash: None,
            });
        }
        Ok(Box::new(ItemsIterator::new(items)))
    }

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        ensure_active(ctx)?;
        let path = self.normalize_key(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).context(format!("removing '{key}'"))),
        }
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        let collector = ErrorCollector::new();
        for key in keys {
            collector.check(self.remove(ctx, key).await);
        }
        collector.resolve()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// In-flight writer files are not part of the listing
fn is_partial(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".partial"))
}
