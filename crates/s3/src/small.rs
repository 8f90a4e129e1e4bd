//! Single-request transfer engine
//!
//! Writers buffer the whole object in memory and upload it with one
//! PutObject on close. Suited to objects well below the multipart threshold,
//! and the only engine that can store and verify SHA-256 checksums.

use std::sync::Arc;

use async_trait::async_trait;
use bucketry_core::{
    Bucket, BucketIterator, CopyOptions, ObjectLocation, ObjectReader, ObjectWriter, Result,
    batch, cancellable, maybe_compress,
};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::api::{PutObjectRequest, S3Api};
use crate::checksum::{sha256_base64, verify_sha256};
use crate::client::build_client;
use crate::common::S3Core;
use crate::options::S3Options;
use crate::sdk::SdkApi;

pub const SMALL_DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// S3 bucket that uploads each object in a single request
#[derive(Clone)]
pub struct S3SmallBucket {
    core: S3Core,
}

impl S3SmallBucket {
    /// Build an SDK client from `options` and wrap it
    pub async fn new(options: S3Options) -> Result<Self> {
        let client = build_client(&options).await?;
        Self::with_api(options, Arc::new(SdkApi::new(client)))
    }

    /// Use an existing [`S3Api`] implementation
    pub fn with_api(options: S3Options, api: Arc<dyn S3Api>) -> Result<Self> {
        Ok(Self {
            core: S3Core::new(&options, api, SMALL_DEFAULT_CONTENT_TYPE)?,
        })
    }

    /// Stream an object into `sink`, returning the bytes written
    ///
    /// The checksum is verified before the first byte reaches the sink, so a
    /// failed verification leaves it untouched. The sink is flushed but not
    /// shut down.
    pub async fn get_to_writer(
        &self,
        ctx: &CancellationToken,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut body = self.fetch(ctx, key).await?;
        cancellable(ctx, async {
            let written = tokio::io::copy(&mut body, sink).await?;
            sink.flush().await?;
            Ok(written)
        })
        .await
    }

    /// Read a whole object, enforce its checksum if configured and undo
    /// compression
    async fn fetch(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        let verify = self.core.verify_checksum;
        let mut response = self.core.get_object(ctx, key, verify).await?;

        let mut data = Vec::with_capacity(response.content_length.unwrap_or(0) as usize);
        cancellable(ctx, async {
            response.body.read_to_end(&mut data).await?;
            Ok(())
        })
        .await?;

        if verify {
            verify_sha256(
                &self.core.normalize_key(key),
                response.checksum_sha256.as_deref(),
                &data,
            )?;
        }
        self.core.decode(Box::pin(std::io::Cursor::new(data))).await
    }
}

struct SmallWriter {
    core: S3Core,
    ctx: CancellationToken,
    key: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for SmallWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        let body = Bytes::from(this.buffer);
        let request = PutObjectRequest {
            bucket: this.core.bucket.clone(),
            key: this.key.clone(),
            checksum_sha256: this.core.upload_checksum.then(|| sha256_base64(&body)),
            body,
            content_type: this.core.content_type.clone(),
            acl: this.core.acl(),
            if_none_match: this.core.if_not_exists,
        };

        tracing::debug!(key = %this.key, size = request.body.len(), "putting object");
        let core = &this.core;
        core.commit(&this.ctx, || core.api.put_object(request.clone()))
            .await
    }
}

#[async_trait]
impl Bucket for S3SmallBucket {
    fn name(&self) -> &str {
        &self.core.bucket
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        self.core.check(ctx).await
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        self.core.exists(ctx, key).await
    }

    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        let writer = SmallWriter {
            core: self.core.clone(),
            ctx: ctx.clone(),
            key: self.core.normalize_key(key),
            buffer: Vec::new(),
        };
        Ok(maybe_compress(Box::new(writer), self.core.compress))
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.fetch(ctx, key).await
    }

    async fn list(&self, _ctx: &CancellationToken, prefix: &str) -> Result<Box<dyn BucketIterator>> {
        Ok(self.core.list(prefix))
    }

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        self.core.remove_many(ctx, &[key.to_string()]).await
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        self.core.remove_many(ctx, keys).await
    }

    async fn copy(&self, ctx: &CancellationToken, options: CopyOptions) -> Result<()> {
        if self.core.try_server_copy(ctx, &options).await? {
            return Ok(());
        }
        batch::stream_copy(self, ctx, &options).await
    }

    fn batch_size(&self) -> usize {
        self.core.batch_size()
    }

    fn locate(&self, key: &str) -> Option<ObjectLocation> {
        Some(self.core.locate(key))
    }
}
