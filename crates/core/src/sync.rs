//! Sequential Push and Pull
//!
//! These are the default [`Bucket::push`] and [`Bucket::pull`]
//! implementations. They are correct but do one transfer at a time; wrap a
//! bucket in [`crate::ParallelSyncBucket`] for concurrency.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorCollector, Result};
use crate::fsutil::walk_local_tree;
use crate::key::{dir_prefix, join_key, key_to_path, path_to_key, relative_key};
use crate::options::SyncOptions;
use crate::traits::{Bucket, BucketItem};

/// Remote key a local file (relative to the sync root) is pushed to
pub(crate) fn remote_key_for(options: &SyncOptions, rel: &Path) -> Result<String> {
    Ok(join_key(&options.remote, &path_to_key(rel)?))
}

/// Local path a listed item is pulled to, or `None` when it is excluded
pub(crate) fn local_path_for(
    options: &SyncOptions,
    exclude: Option<&glob::Pattern>,
    item: &BucketItem,
) -> Result<Option<PathBuf>> {
    let rel = relative_key(&options.remote, &item.key)?;
    if exclude.is_some_and(|p| p.matches(&rel)) {
        return Ok(None);
    }
    Ok(Some(options.local.join(key_to_path(&rel)?)))
}

/// Whether a local file (relative to the sync root) is excluded from a push
pub(crate) fn is_excluded(exclude: Option<&glob::Pattern>, rel: &Path) -> bool {
    exclude.is_some_and(|p| p.matches_path(rel))
}

/// Listing prefix used by Pull for a remote directory
pub(crate) fn pull_prefix(options: &SyncOptions) -> String {
    dir_prefix(&options.remote)
}

pub async fn push_sequential<B: Bucket + ?Sized>(
    bucket: &B,
    ctx: &CancellationToken,
    options: &SyncOptions,
) -> Result<()> {
    let exclude = options.exclude_pattern()?;
    let files = walk_local_tree(ctx, &options.local).await?;
    let collector = ErrorCollector::new();

    for rel in files {
        if is_excluded(exclude.as_ref(), &rel) {
            continue;
        }
        let result = match remote_key_for(options, &rel) {
            Ok(key) => bucket.upload(ctx, &key, &options.local.join(&rel)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let canceled = matches!(e, Error::Canceled);
            tracing::error!(file = %rel.display(), error = %e, "push failed");
            collector.add(e);
            if canceled {
                break;
            }
        }
    }

    collector.resolve()
}

pub async fn pull_sequential<B: Bucket + ?Sized>(
    bucket: &B,
    ctx: &CancellationToken,
    options: &SyncOptions,
) -> Result<()> {
    let exclude = options.exclude_pattern()?;
    let mut iter = bucket.list(ctx, &pull_prefix(options)).await?;
    let collector = ErrorCollector::new();

    while let Some(item) = iter.next(ctx).await {
        let path = match local_path_for(options, exclude.as_ref(), &item) {
            Ok(Some(path)) => path,
            Ok(None) => continue,
            Err(e) => {
                collector.add(e);
                continue;
            }
        };
        if let Err(e) = bucket.download(ctx, &item.key, &path).await {
            let canceled = matches!(e, Error::Canceled);
            tracing::error!(key = %item.key, error = %e, "pull failed");
            collector.add(e);
            if canceled {
                break;
            }
        }
    }
    if let Some(e) = iter.take_err() {
        collector.add(e.context("iterating bucket"));
    }

    collector.resolve()
}
