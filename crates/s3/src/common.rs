//! Plumbing shared by the small and large engines

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bucketry_core::{
    BucketItem, BucketIterator, CopyOptions, Error, ErrorCollector, ObjectLocation, ObjectReader,
    Result, RetryConfig, cancellable, dir_prefix, is_retryable_error, join_key, maybe_decompress,
    retry_with_backoff, strip_key_prefix,
};
use tokio_util::sync::CancellationToken;

use crate::api::{CopyObjectRequest, GetObjectResponse, ListPage, ListedObject, S3Api};
use crate::options::{S3Options, S3Permissions};

/// Immutable per-bucket state, cheap to clone into writers and iterators
#[derive(Clone)]
pub(crate) struct S3Core {
    pub(crate) api: Arc<dyn S3Api>,
    pub(crate) bucket: String,
    prefix: String,
    store: String,
    pub(crate) content_type: String,
    acl: S3Permissions,
    pub(crate) compress: bool,
    pub(crate) upload_checksum: bool,
    pub(crate) verify_checksum: bool,
    pub(crate) if_not_exists: bool,
    retry: RetryConfig,
    batch_size: usize,
}

impl S3Core {
    pub(crate) fn new(
        options: &S3Options,
        api: Arc<dyn S3Api>,
        default_content_type: &str,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            api,
            bucket: options.name.clone(),
            prefix: options.prefix.clone(),
            store: options.store_id(),
            content_type: options
                .content_type
                .clone()
                .unwrap_or_else(|| default_content_type.to_string()),
            acl: options.permissions,
            compress: options.compress,
            upload_checksum: options.upload_checksum,
            verify_checksum: options.verify_checksum,
            if_not_exists: options.if_not_exists,
            retry: options.retry_config(),
            batch_size: options.batch_size,
        })
    }

    /// Root a caller key under the bucket prefix
    pub(crate) fn normalize_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    /// ACL sent with writes; the private default is left to the bucket
    pub(crate) fn acl(&self) -> Option<S3Permissions> {
        (self.acl != S3Permissions::Private).then_some(self.acl)
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run an idempotent remote call with retries, racing `ctx`
    pub(crate) async fn retry<T, F, Fut>(&self, ctx: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        cancellable(ctx, retry_with_backoff(&self.retry, operation, is_retryable_error)).await
    }

    /// Run a write that commits an object
    ///
    /// With if-not-exists the write is conditional and therefore not
    /// idempotent: a retry after a lost response would see our own object and
    /// report it as already existing. Conditional writes get one attempt.
    pub(crate) async fn commit<T, F, Fut>(&self, ctx: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if self.if_not_exists {
            cancellable(ctx, operation()).await
        } else {
            self.retry(ctx, operation).await
        }
    }

    /// Succeeds when the bucket exists, even if these credentials may not
    /// inspect it; a missing bucket fails
    pub(crate) async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        match self.retry(ctx, || self.api.head_bucket(&self.bucket)).await {
            Err(Error::PermissionDenied(msg)) => {
                tracing::debug!(bucket = %self.bucket, reason = %msg, "bucket exists but access is denied");
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        let key = self.normalize_key(key);
        match self.retry(ctx, || self.api.head_object(&self.bucket, &key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn get_object(
        &self,
        ctx: &CancellationToken,
        key: &str,
        checksum_mode: bool,
    ) -> Result<GetObjectResponse> {
        let key = self.normalize_key(key);
        self.retry(ctx, || self.api.get_object(&self.bucket, &key, checksum_mode))
            .await
    }

    /// Undo write-side compression on a stored body
    pub(crate) async fn decode(&self, body: ObjectReader) -> Result<ObjectReader> {
        if self.compress {
            maybe_decompress(body).await
        } else {
            Ok(body)
        }
    }

    pub(crate) fn list(&self, prefix: &str) -> Box<dyn BucketIterator> {
        let full_prefix = if self.prefix.is_empty() {
            prefix.to_string()
        } else if prefix.is_empty() {
            dir_prefix(&self.prefix)
        } else {
            join_key(&self.prefix, prefix)
        };
        Box::new(S3Iterator {
            core: self.clone(),
            prefix: full_prefix,
            token: None,
            buffer: VecDeque::new(),
            exhausted: false,
            err: None,
        })
    }

    async fn list_page(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
        token: Option<String>,
    ) -> Result<ListPage> {
        self.retry(ctx, || {
            self.api.list_objects(&self.bucket, prefix, token.clone())
        })
        .await
    }

    fn to_item(&self, object: ListedObject) -> BucketItem {
        BucketItem {
            bucket: self.bucket.clone(),
            key: strip_key_prefix(&self.prefix, &object.key),
            size: object.size,
            last_modified: object.last_modified,
            hash: object.etag,
        }
    }

    pub(crate) async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        let collector = ErrorCollector::new();
        for chunk in keys.chunks(self.batch_size.max(1)) {
            let full: Vec<String> = chunk.iter().map(|k| self.normalize_key(k)).collect();
            let deleted = self
                .retry(ctx, || self.api.delete_objects(&self.bucket, full.clone()))
                .await;
            match deleted {
                Ok(failures) => {
                    for failure in failures {
                        tracing::warn!(key = %failure.key, "failed to delete object");
                        collector.add(Error::Transfer(format!(
                            "deleting '{}': {}",
                            failure.key, failure.message
                        )));
                    }
                }
                Err(e) if e.is_canceled() => {
                    collector.add(e);
                    break;
                }
                Err(e) => {
                    collector.add(e.context(format!("deleting {} objects", full.len())));
                }
            }
        }
        collector.resolve()
    }

    pub(crate) fn locate(&self, key: &str) -> ObjectLocation {
        ObjectLocation {
            store: self.store.clone(),
            container: self.bucket.clone(),
            key: self.normalize_key(key),
            compressed: self.compress,
        }
    }

    /// Copy inside the store when the destination shares it
    ///
    /// Returns `false` without doing anything when the destination cannot be
    /// reached server-side; the caller then streams the object instead.
    pub(crate) async fn try_server_copy(
        &self,
        ctx: &CancellationToken,
        options: &CopyOptions,
    ) -> Result<bool> {
        let source = self.locate(&options.source_key);
        let Some(destination) = options.destination_bucket.locate(&options.destination_key) else {
            return Ok(false);
        };
        if !source.is_compatible(&destination) {
            return Ok(false);
        }

        let request = CopyObjectRequest {
            source_bucket: source.container,
            source_key: source.key,
            bucket: destination.container,
            key: destination.key,
            acl: self.acl(),
        };
        tracing::debug!(
            from = %request.source_key,
            to = %request.key,
            "copying object server-side"
        );
        self.retry(ctx, || self.api.copy_object(request.clone())).await?;
        Ok(true)
    }
}

/// Lazy ListObjectsV2 pagination
struct S3Iterator {
    core: S3Core,
    prefix: String,
    token: Option<String>,
    buffer: VecDeque<ListedObject>,
    exhausted: bool,
    err: Option<Error>,
}

#[async_trait]
impl BucketIterator for S3Iterator {
    async fn next(&mut self, ctx: &CancellationToken) -> Option<BucketItem> {
        loop {
            if self.err.is_some() {
                return None;
            }
            if let Some(object) = self.buffer.pop_front() {
                return Some(self.core.to_item(object));
            }
            if self.exhausted {
                return None;
            }

            match self.core.list_page(ctx, &self.prefix, self.token.take()).await {
                Ok(page) => {
                    self.exhausted = page.next_token.is_none();
                    self.token = page.next_token;
                    self.buffer.extend(page.objects);
                }
                Err(e) => self.err = Some(e),
            }
        }
    }

    fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }
}
