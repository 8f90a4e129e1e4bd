//! Parallel sync decorator
//!
//! [`ParallelSyncBucket`] wraps any [`Bucket`] and replaces its Push and Pull
//! with worker-pool versions. Every other operation is forwarded untouched.
//!
//! Push fills a bounded queue with every local file up front and lets exactly
//! `workers` tasks drain it. Pull is a pipeline:
//!
//! ```text
//! list -> producer --items--> consumers (download) --to_delete--> collector
//! ```
//!
//! Both channels are rendezvous channels, and every send races the
//! cancellation token, so a canceled Pull never leaves a task blocked.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorCollector, Result};
use crate::fsutil::walk_local_tree;
use crate::options::{CopyOptions, ParallelBucketOptions, SyncOptions};
use crate::sync::{is_excluded, local_path_for, pull_prefix, remote_key_for};
use crate::traits::{Bucket, BucketItem, BucketIterator, ObjectLocation, ObjectReader, ObjectWriter};

/// Bucket decorator running Push and Pull with a pool of worker tasks
pub struct ParallelSyncBucket {
    inner: Arc<dyn Bucket>,
    workers: usize,
    dry_run: bool,
    delete_on_sync: bool,
}

impl ParallelSyncBucket {
    pub fn new(options: ParallelBucketOptions, inner: Arc<dyn Bucket>) -> Self {
        Self {
            workers: options.effective_workers(),
            dry_run: options.dry_run,
            delete_on_sync: options.delete_on_sync,
            inner,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn inner(&self) -> &Arc<dyn Bucket> {
        &self.inner
    }

    async fn parallel_push(&self, ctx: &CancellationToken, options: SyncOptions) -> Result<()> {
        let exclude = options.exclude_pattern()?;
        let files: Vec<_> = walk_local_tree(ctx, &options.local)
            .await?
            .into_iter()
            .filter(|rel| !is_excluded(exclude.as_ref(), rel))
            .collect();

        let (queue_tx, queue_rx) = flume::bounded(files.len().max(1));
        for rel in files {
            // capacity covers every file, so this never blocks
            let _ = queue_tx.send_async(rel).await;
        }
        drop(queue_tx);

        let options = Arc::new(options);
        let collector = ErrorCollector::new();
        let mut tasks = JoinSet::new();
        for worker in 0..self.workers {
            let queue = queue_rx.clone();
            let inner = self.inner.clone();
            let options = options.clone();
            let collector = collector.clone();
            let ctx = ctx.clone();
            let dry_run = self.dry_run;

            tasks.spawn(async move {
                loop {
                    let rel = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        next = queue.recv_async() => match next {
                            Ok(rel) => rel,
                            Err(_) => break,
                        },
                    };
                    if dry_run {
                        tracing::info!(worker, file = %rel.display(), "dry run: skipping upload");
                        continue;
                    }
                    let result = match remote_key_for(&options, &rel) {
                        Ok(key) => inner.upload(&ctx, &key, &options.local.join(&rel)).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        tracing::error!(worker, file = %rel.display(), error = %e, "push failed");
                        record(&collector, e);
                    }
                }
            });
        }
        join_workers(&mut tasks, &collector).await;

        if ctx.is_cancelled() {
            collector.add(Error::Canceled);
        } else if self.delete_on_sync && !self.dry_run {
            if collector.has_errors() {
                tracing::warn!(
                    local = %options.local.display(),
                    failed = collector.len(),
                    "push incomplete, keeping local tree"
                );
            } else if let Err(e) = remove_local_tree(&options.local).await {
                collector.add(e);
            }
        }

        collector.resolve()
    }

    async fn parallel_pull(&self, ctx: &CancellationToken, options: SyncOptions) -> Result<()> {
        let exclude = options.exclude_pattern()?;
        let iter = self.inner.list(ctx, &pull_prefix(&options)).await?;

        let collector = ErrorCollector::new();
        let (items_tx, items_rx) = flume::bounded::<BucketItem>(0);
        let (delete_tx, delete_rx) = flume::bounded::<String>(0);

        tokio::spawn(produce_items(iter, items_tx, ctx.clone(), collector.clone()));

        let options = Arc::new(options);
        let mut consumers = JoinSet::new();
        for worker in 0..self.workers {
            let items = items_rx.clone();
            let to_delete = delete_tx.clone();
            let inner = self.inner.clone();
            let options = options.clone();
            let exclude = exclude.clone();
            let collector = collector.clone();
            let ctx = ctx.clone();

            consumers.spawn(async move {
                while let Ok(item) = items.recv_async().await {
                    let path = match local_path_for(&options, exclude.as_ref(), &item) {
                        Ok(Some(path)) => path,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::error!(worker, key = %item.key, error = %e, "pull failed");
                            record(&collector, e);
                            continue;
                        }
                    };
                    if let Err(e) = inner.download(&ctx, &item.key, &path).await {
                        tracing::error!(worker, key = %item.key, error = %e, "pull failed");
                        record(&collector, e);
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => break,
                        sent = to_delete.send_async(item.key) => if sent.is_err() { break },
                    }
                }
            });
        }
        drop(items_rx);

        // closer: the to_delete channel ends once every consumer is done
        let closer_collector = collector.clone();
        tokio::spawn(async move {
            join_workers(&mut consumers, &closer_collector).await;
            drop(delete_tx);
        });

        let deletion = tokio::spawn(collect_and_delete(
            delete_rx,
            self.inner.clone(),
            ctx.clone(),
            collector.clone(),
            self.delete_on_sync,
            self.dry_run,
            options.remote.clone(),
        ));

        tokio::select! {
            _ = ctx.cancelled() => collector.add(Error::Canceled),
            joined = deletion => {
                if let Err(e) = joined {
                    collector.add(Error::Transfer(format!("pull deletion task failed: {e}")));
                }
                if ctx.is_cancelled() {
                    collector.add(Error::Canceled);
                }
            }
        }

        collector.resolve()
    }
}

/// Feed a listing into the items channel until it ends or `ctx` is canceled
async fn produce_items(
    mut iter: Box<dyn BucketIterator>,
    items: flume::Sender<BucketItem>,
    ctx: CancellationToken,
    collector: ErrorCollector,
) {
    while let Some(item) = iter.next(&ctx).await {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            sent = items.send_async(item) => if sent.is_err() { return },
        }
    }
    if let Some(e) = iter.take_err() {
        tracing::error!(error = %e, "listing failed during pull");
        record(&collector, e.context("iterating bucket"));
    }
}

/// Gather downloaded keys and remove them from the bucket when asked to
async fn collect_and_delete(
    to_delete: flume::Receiver<String>,
    bucket: Arc<dyn Bucket>,
    ctx: CancellationToken,
    collector: ErrorCollector,
    delete_on_sync: bool,
    dry_run: bool,
    remote: String,
) {
    let mut keys = Vec::new();
    while let Ok(key) = to_delete.recv_async().await {
        keys.push(key);
    }
    if !delete_on_sync || keys.is_empty() {
        return;
    }
    if dry_run {
        tracing::info!(remote = %remote, keys = ?keys, "dry run: would delete after pull");
        return;
    }
    if let Err(e) = bucket.remove_many(&ctx, &keys).await {
        record(&collector, e.context(format!("removing '{remote}' after pull")));
    }
}

/// Record a failure; cancellation is reported once by the caller instead
fn record(collector: &ErrorCollector, e: Error) {
    if !e.is_canceled() {
        collector.add(e);
    }
}

async fn join_workers(tasks: &mut JoinSet<()>, collector: &ErrorCollector) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            collector.add(Error::Transfer(format!("sync worker failed: {e}")));
        }
    }
}

async fn remove_local_tree(local: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(local).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::from(e)
            .context(format!("removing '{}' after push", local.display()))),
    }
}

#[async_trait]
impl Bucket for ParallelSyncBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        self.inner.check(ctx).await
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        self.inner.exists(ctx, key).await
    }

    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        self.inner.writer(ctx, key).await
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.inner.get(ctx, key).await
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<Box<dyn BucketIterator>> {
        self.inner.list(ctx, prefix).await
    }

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        self.inner.remove(ctx, key).await
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        self.inner.remove_many(ctx, keys).await
    }

    async fn put(&self, ctx: &CancellationToken, key: &str, body: ObjectReader) -> Result<()> {
        self.inner.put(ctx, key, body).await
    }

    async fn upload(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        self.inner.upload(ctx, key, path).await
    }

    async fn download(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        self.inner.download(ctx, key, path).await
    }

    async fn copy(&self, ctx: &CancellationToken, options: CopyOptions) -> Result<()> {
        self.inner.copy(ctx, options).await
    }

    async fn remove_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()> {
        self.inner.remove_prefix(ctx, prefix).await
    }

    async fn push(&self, ctx: &CancellationToken, options: SyncOptions) -> Result<()> {
        self.parallel_push(ctx, options).await
    }

    async fn pull(&self, ctx: &CancellationToken, options: SyncOptions) -> Result<()> {
        self.parallel_pull(ctx, options).await
    }

    async fn move_objects(
        &self,
        ctx: &CancellationToken,
        destination: Arc<dyn Bucket>,
        source_keys: &[String],
        destination_keys: &[String],
    ) -> Result<()> {
        self.inner
            .move_objects(ctx, destination, source_keys, destination_keys)
            .await
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    fn locate(&self, key: &str) -> Option<ObjectLocation> {
        self.inner.locate(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalBucket, LocalOptions};
    use crate::traits::collect_items;
    use std::time::Duration;
    use tempfile::TempDir;

    fn local(dir: &TempDir) -> Arc<dyn Bucket> {
        Arc::new(LocalBucket::new(LocalOptions::new(dir.path())).unwrap())
    }

    fn parallel(inner: Arc<dyn Bucket>, dry_run: bool, delete_on_sync: bool) -> ParallelSyncBucket {
        ParallelSyncBucket::new(
            ParallelBucketOptions {
                workers: 3,
                dry_run,
                delete_on_sync,
            },
            inner,
        )
    }

    fn seed_tree(dir: &Path, count: usize) {
        for i in 0..count {
            let path = dir.join(format!("d{}/file-{i}.txt", i % 3));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, format!("content {i}")).unwrap();
        }
    }

    async fn keys(bucket: &dyn Bucket, prefix: &str) -> Vec<String> {
        let ctx = CancellationToken::new();
        let mut iter = bucket.list(&ctx, prefix).await.unwrap();
        collect_items(iter.as_mut(), &ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key)
            .collect()
    }

    #[tokio::test]
    async fn test_push_uploads_every_file() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        seed_tree(src.path(), 10);

        let bucket = parallel(local(&store), false, false);
        let ctx = CancellationToken::new();
        bucket
            .push(&ctx, SyncOptions::new(src.path(), "up"))
            .await
            .unwrap();

        assert_eq!(keys(&bucket, "up/").await.len(), 10);
        assert!(src.path().join("d0/file-0.txt").exists());
    }

    #[tokio::test]
    async fn test_push_dry_run_uploads_nothing() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        seed_tree(src.path(), 4);

        let bucket = parallel(local(&store), true, true);
        let ctx = CancellationToken::new();
        bucket
            .push(&ctx, SyncOptions::new(src.path(), "up"))
            .await
            .unwrap();

        assert!(keys(&bucket, "").await.is_empty());
        assert!(src.path().join("d1/file-1.txt").exists());
    }

    #[tokio::test]
    async fn test_push_delete_on_sync_removes_local_tree() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let tree = src.path().join("tree");
        seed_tree(&tree, 5);

        let bucket = parallel(local(&store), false, true);
        let ctx = CancellationToken::new();
        bucket.push(&ctx, SyncOptions::new(&tree, "up")).await.unwrap();

        assert_eq!(keys(&bucket, "up/").await.len(), 5);
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_push_respects_exclude() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        std::fs::write(src.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(src.path().join("skip.tmp"), b"s").unwrap();

        let bucket = parallel(local(&store), false, false);
        let ctx = CancellationToken::new();
        bucket
            .push(&ctx, SyncOptions::new(src.path(), "").exclude("*.tmp"))
            .await
            .unwrap();

        assert_eq!(keys(&bucket, "").await, vec!["keep.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_pull_delete_on_sync_removes_remote() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_tree(src.path(), 6);

        let ctx = CancellationToken::new();
        let plain = parallel(local(&store), false, false);
        plain.push(&ctx, SyncOptions::new(src.path(), "r")).await.unwrap();

        let deleting = parallel(local(&store), false, true);
        deleting
            .pull(&ctx, SyncOptions::new(dest.path(), "r"))
            .await
            .unwrap();

        assert_eq!(std::fs::read(dest.path().join("d2/file-5.txt")).unwrap(), b"content 5");
        assert!(keys(&deleting, "r/").await.is_empty());
    }

    #[tokio::test]
    async fn test_pull_dry_run_keeps_remote() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_tree(src.path(), 3);

        let ctx = CancellationToken::new();
        let bucket = parallel(local(&store), true, true);
        bucket.inner().push(&ctx, SyncOptions::new(src.path(), "r")).await.unwrap();
        bucket
            .pull(&ctx, SyncOptions::new(dest.path(), "r"))
            .await
            .unwrap();

        assert_eq!(keys(&bucket, "r/").await.len(), 3);
        assert!(dest.path().join("d0/file-0.txt").exists());
    }

    /// Local bucket whose downloads hang until the context is canceled
    struct StallingBucket(LocalBucket);

    #[async_trait]
    impl Bucket for StallingBucket {
        fn name(&self) -> &str {
            self.0.name()
        }
        async fn check(&self, ctx: &CancellationToken) -> Result<()> {
            self.0.check(ctx).await
        }
        async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
            self.0.exists(ctx, key).await
        }
        async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
            self.0.writer(ctx, key).await
        }
        async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
            self.0.get(ctx, key).await
        }
        async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<Box<dyn BucketIterator>> {
            self.0.list(ctx, prefix).await
        }
        async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
            self.0.remove(ctx, key).await
        }
        async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
            self.0.remove_many(ctx, keys).await
        }
        async fn download(&self, ctx: &CancellationToken, _key: &str, _path: &Path) -> Result<()> {
            ctx.cancelled().await;
            Err(Error::Canceled)
        }
    }

    /// Local bucket that fails every transfer of one key
    struct FailingKeyBucket {
        inner: LocalBucket,
        fail_key: String,
    }

    impl FailingKeyBucket {
        fn new(dir: &TempDir, fail_key: &str) -> Self {
            Self {
                inner: LocalBucket::new(LocalOptions::new(dir.path())).unwrap(),
                fail_key: fail_key.to_string(),
            }
        }

        fn fail_if_selected(&self, key: &str) -> Result<()> {
            if key == self.fail_key {
                Err(Error::Transfer(format!("injected failure for '{key}'")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Bucket for FailingKeyBucket {
        fn name(&self) -> &str {
            self.inner.name()
        }
        async fn check(&self, ctx: &CancellationToken) -> Result<()> {
            self.inner.check(ctx).await
        }
        async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
            self.inner.exists(ctx, key).await
        }
        async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
            self.inner.writer(ctx, key).await
        }
        async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
            self.inner.get(ctx, key).await
        }
        async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<Box<dyn BucketIterator>> {
            self.inner.list(ctx, prefix).await
        }
        async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
            self.inner.remove(ctx, key).await
        }
        async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
            self.inner.remove_many(ctx, keys).await
        }
        async fn upload(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
            self.fail_if_selected(key)?;
            self.inner.upload(ctx, key, path).await
        }
        async fn download(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
            self.fail_if_selected(key)?;
            self.inner.download(ctx, key, path).await
        }
    }

    #[tokio::test]
    async fn test_pull_keeps_remote_object_of_failed_download() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_tree(src.path(), 6);

        let ctx = CancellationToken::new();
        let failing = FailingKeyBucket::new(&store, "r/d1/file-1.txt");
        failing
            .inner
            .push(&ctx, SyncOptions::new(src.path(), "r"))
            .await
            .unwrap();

        let bucket = parallel(Arc::new(failing), false, true);
        let err = bucket
            .pull(&ctx, SyncOptions::new(dest.path(), "r"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transfer(_)));
        assert!(err.to_string().contains("r/d1/file-1.txt"));
        assert_eq!(keys(&bucket, "r/").await, vec!["r/d1/file-1.txt".to_string()]);
        assert!(!dest.path().join("d1/file-1.txt").exists());
        assert_eq!(std::fs::read(dest.path().join("d1/file-4.txt")).unwrap(), b"content 4");
    }

    #[tokio::test]
    async fn test_push_failure_is_reported_and_keeps_local_tree() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let tree = src.path().join("tree");
        seed_tree(&tree, 6);

        let bucket = parallel(
            Arc::new(FailingKeyBucket::new(&store, "up/d2/file-2.txt")),
            false,
            true,
        );
        let ctx = CancellationToken::new();
        let err = bucket
            .push(&ctx, SyncOptions::new(&tree, "up"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("up/d2/file-2.txt"));
        let mut uploaded = keys(&bucket, "up/").await;
        uploaded.sort();
        assert_eq!(uploaded.len(), 5);
        assert!(!uploaded.contains(&"up/d2/file-2.txt".to_string()));
        assert!(tree.join("d2/file-2.txt").exists());
    }

    #[tokio::test]
    async fn test_pull_cancellation_does_not_deadlock() {
        let src = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        seed_tree(src.path(), 20);

        let ctx = CancellationToken::new();
        let stalling = StallingBucket(LocalBucket::new(LocalOptions::new(store.path())).unwrap());
        stalling.push(&ctx, SyncOptions::new(src.path(), "r")).await.unwrap();

        let bucket = parallel(Arc::new(stalling), false, true);
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            bucket.pull(&ctx, SyncOptions::new(dest.path(), "r")),
        )
        .await
        .expect("pull did not return after cancellation");

        assert!(result.unwrap_err().is_canceled());
        assert_eq!(keys(&bucket, "r/").await.len(), 20);
    }

    #[test]
    fn test_zero_workers_normalized() {
        let store = TempDir::new().unwrap();
        let bucket = ParallelSyncBucket::new(
            ParallelBucketOptions {
                workers: 0,
                ..Default::default()
            },
            local(&store),
        );
        assert!(bucket.workers() >= 1);
    }
}
