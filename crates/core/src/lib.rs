//! bucketry-core: Backend-independent bucket abstraction
//!
//! This crate provides:
//! - The [`Bucket`] contract every storage backend implements
//! - Error taxonomy, error aggregation and retry with backoff
//! - Key normalization and gzip compression helpers
//! - A local filesystem bucket
//! - [`ParallelSyncBucket`], a decorator that runs Push and Pull with a
//!   worker pool, and the batched move used by [`Bucket::move_objects`]
//!
//! Nothing here depends on a particular object store SDK; the S3 engines live
//! in `bucketry-s3`.

pub mod batch;
pub mod cancel;
pub mod compress;
pub mod error;
pub mod fsutil;
pub mod key;
pub mod local;
pub mod options;
pub mod parallel;
pub mod retry;
pub mod sync;
pub mod traits;

pub use cancel::{cancellable, ensure_active};
pub use compress::{CompressingWriter, maybe_compress, maybe_decompress};
pub use error::{Error, ErrorCollector, MultiError, Result};
pub use key::{dir_prefix, join_key, strip_key_prefix};
pub use local::{LocalBucket, LocalOptions};
pub use options::{CopyOptions, ParallelBucketOptions, SyncOptions};
pub use parallel::ParallelSyncBucket;
pub use retry::{RetryBuilder, RetryConfig, is_retryable_error, retry_with_backoff};
pub use traits::{
    Bucket, BucketItem, BucketIterator, DEFAULT_BATCH_SIZE, ItemsIterator, ObjectLocation,
    ObjectReader, ObjectWriter, collect_items, copy_to_writer,
};

pub use tokio_util::sync::CancellationToken;
