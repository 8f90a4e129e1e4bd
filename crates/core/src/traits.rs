//! Bucket contract
//!
//! [`Bucket`] is the capability interface every backend implements and every
//! decorator wraps. The sync engine and the batch mover are written purely
//! against it, so decorators compose freely.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::error::{Error, Result};
use crate::options::{CopyOptions, SyncOptions};

/// Readable object body returned by [`Bucket::get`]
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Default number of keys handled per batched request
pub const DEFAULT_BATCH_SIZE: usize = 40;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// One entry of a bucket listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketItem {
    /// Name of the bucket the item was listed from
    pub bucket: String,
    /// Key relative to the bucket prefix
    pub key: String,
    pub size: u64,
    pub last_modified: Option<Timestamp>,
    /// Backend content hash (the ETag for S3), when known
    pub hash: Option<String>,
}

impl BucketItem {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size,
            last_modified: None,
            hash: None,
        }
    }
}

/// Physical location of a key, used to decide whether a copy can stay
/// inside the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    /// Identity of the store, e.g. `s3:us-east-1` or `local:/data`
    pub store: String,
    /// Bucket or root directory within the store
    pub container: String,
    /// Fully normalized key
    pub key: String,
    /// Whether bytes at rest are gzip-compressed by the bucket
    pub compressed: bool,
}

impl ObjectLocation {
    /// Two locations can be copied server-side when they live in the same
    /// store and use the same encoding at rest
    pub fn is_compatible(&self, other: &ObjectLocation) -> bool {
        self.store == other.store && self.compressed == other.compressed
    }
}

/// Scoped sequential write handle
///
/// Bytes are not durable until [`ObjectWriter::close`] returns; close
/// performs the remote commit and consumes the handle.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Cursor over a listing
///
/// Iterators are lazy and not restartable; a fresh [`Bucket::list`] call is
/// needed to iterate again. `next` returning `None` means the listing ended,
/// either exhausted or failed; check [`BucketIterator::err`] to tell which.
#[async_trait]
pub trait BucketIterator: Send {
    async fn next(&mut self, ctx: &CancellationToken) -> Option<BucketItem>;

    fn err(&self) -> Option<&Error>;

    fn take_err(&mut self) -> Option<Error>;
}

/// Iterator over an already materialized listing
#[derive(Debug)]
pub struct ItemsIterator {
    items: std::vec::IntoIter<BucketItem>,
    err: Option<Error>,
}

impl ItemsIterator {
    pub fn new(items: Vec<BucketItem>) -> Self {
        Self {
            items: items.into_iter(),
            err: None,
        }
    }
}

#[async_trait]
impl BucketIterator for ItemsIterator {
    async fn next(&mut self, ctx: &CancellationToken) -> Option<BucketItem> {
        if self.err.is_some() {
            return None;
        }
        if ctx.is_cancelled() {
            self.err = Some(Error::Canceled);
            return None;
        }
        self.items.next()
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }
}

/// Drain an iterator, failing with its terminal error if it has one
pub async fn collect_items(
    iter: &mut dyn BucketIterator,
    ctx: &CancellationToken,
) -> Result<Vec<BucketItem>> {
    let mut items = Vec::new();
    while let Some(item) = iter.next(ctx).await {
        items.push(item);
    }
    match iter.take_err() {
        Some(e) => Err(e),
        None => Ok(items),
    }
}

/// Stream `reader` into `writer` without closing it; returns bytes copied
pub async fn copy_to_writer(
    ctx: &CancellationToken,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    writer: &mut dyn ObjectWriter,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = cancellable(ctx, async { Ok(reader.read(&mut buf).await?) }).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Unified storage capability contract
///
/// Keys are always relative to the bucket's prefix; implementations root
/// them exactly once before touching the backing store.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Logical bucket name
    fn name(&self) -> &str;

    /// Lightweight reachability and permission probe
    async fn check(&self, ctx: &CancellationToken) -> Result<()>;

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool>;

    /// Open a scoped write handle; the object is committed on close
    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Open the object for reading; fails with [`Error::NotFound`] if absent
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader>;

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<Box<dyn BucketIterator>>;

    /// Remove one key; removing an absent key succeeds
    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()>;

    /// Remove many keys, aggregating per-key failures
    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()>;

    /// Write `body` to `key` through a [`Bucket::writer`]
    async fn put(&self, ctx: &CancellationToken, key: &str, mut body: ObjectReader) -> Result<()> {
        let mut writer = self.writer(ctx, key).await?;
        copy_to_writer(ctx, &mut body, writer.as_mut()).await?;
        writer.close().await
    }

    /// Upload the file at `path` to `key`
    async fn upload(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::from(e).context(format!("opening '{}'", path.display())))?;
        let mut writer = self.writer(ctx, key).await?;
        copy_to_writer(ctx, &mut file, writer.as_mut())
            .await
            .map_err(|e| e.context(format!("uploading '{}'", path.display())))?;
        writer.close().await
    }

    /// Download `key` into the file at `path`, creating parent directories
    ///
    /// An existing file with identical content is left untouched, so its
    /// modification time survives repeated pulls.
    async fn download(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        let reader = self.get(ctx, key).await?;
        crate::fsutil::write_file_if_changed(ctx, reader, path)
            .await
            .map(|_| ())
            .map_err(|e| e.context(format!("downloading '{key}'")))
    }

    /// Copy an object, possibly into another bucket
    ///
    /// The default streams the bytes through this process; backends that can
    /// copy inside the store override it.
    async fn copy(&self, ctx: &CancellationToken, options: CopyOptions) -> Result<()> {
        crate::batch::stream_copy(self, ctx, &options).await
    }

    /// Remove every key under `prefix`
    async fn remove_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()> {
        let mut iter = self.list(ctx, prefix).await?;
        let keys: Vec<String> = collect_items(iter.as_mut(), ctx)
            .await?
            .into_iter()
            .map(|item| item.key)
            .collect();
        self.remove_many(ctx, &keys).await
    }

    /// Upload a local tree under a remote prefix
    async fn push(&self, ctx: &CancellationToken, options: SyncOptions) -> Result<()> {
        crate::sync::push_sequential(self, ctx, &options).await
    }

    /// Download everything under a remote prefix into a local tree
    async fn pull(&self, ctx: &CancellationToken, options: SyncOptions) -> Result<()> {
        crate::sync::pull_sequential(self, ctx, &options).await
    }

    /// Copy each source key to the matching destination key in `destination`,
    /// then remove the sources, one batch at a time
    async fn move_objects(
        &self,
        ctx: &CancellationToken,
        destination: Arc<dyn Bucket>,
        source_keys: &[String],
        destination_keys: &[String],
    ) -> Result<()> {
        crate::batch::move_objects(self, ctx, destination, source_keys, destination_keys).await
    }

    /// Number of keys handled per batched request
    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }

    /// Physical location of `key`, if the backend supports in-store copies
    fn locate(&self, _key: &str) -> Option<ObjectLocation> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecWriter {
        data: Vec<u8>,
    }

    #[async_trait]
    impl ObjectWriter for VecWriter {
        async fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_copy_to_writer_counts_bytes() {
        let ctx = CancellationToken::new();
        let payload = vec![7u8; COPY_BUFFER_SIZE * 2 + 3];
        let mut reader = std::io::Cursor::new(payload.clone());
        let mut writer = VecWriter { data: Vec::new() };

        let n = copy_to_writer(&ctx, &mut reader, &mut writer).await.unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(writer.data, payload);
    }

    #[tokio::test]
    async fn test_items_iterator_stops_on_cancel() {
        let ctx = CancellationToken::new();
        let mut iter = ItemsIterator::new(vec![
            BucketItem::new("b", "a", 1),
            BucketItem::new("b", "c", 2),
        ]);

        assert_eq!(iter.next(&ctx).await.unwrap().key, "a");
        ctx.cancel();
        assert!(iter.next(&ctx).await.is_none());
        assert!(matches!(iter.err(), Some(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_collect_items() {
        let ctx = CancellationToken::new();
        let mut iter = ItemsIterator::new(vec![BucketItem::new("b", "k", 3)]);
        let items = collect_items(&mut iter, &ctx).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size, 3);
    }

    #[test]
    fn test_location_compatibility() {
        let a = ObjectLocation {
            store: "s3:us-east-1".to_string(),
            container: "one".to_string(),
            key: "k".to_string(),
            compressed: false,
        };
        let mut b = a.clone();
        b.container = "two".to_string();
        assert!(a.is_compatible(&b));

        b.compressed = true;
        assert!(!a.is_compatible(&b));
    }
}
