//! Multipart transfer engine
//!
//! Writers cut the stream into fixed-size parts. The multipart upload is
//! created when the first part is ready, each full part is uploaded as soon
//! as it accumulates, and close uploads the remainder and completes the
//! upload. A failure at any step aborts the upload so no orphaned parts are
//! left behind.

use std::sync::Arc;

use async_trait::async_trait;
use bucketry_core::{
    Bucket, BucketIterator, CopyOptions, Error, ObjectLocation, ObjectReader, ObjectWriter, Result,
    batch, cancellable, maybe_compress,
};
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::api::{CompleteMultipartRequest, CompletedPart, CreateMultipartRequest, S3Api};
use crate::client::build_client;
use crate::common::S3Core;
use crate::options::S3Options;
use crate::sdk::SdkApi;

pub const LARGE_DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// S3 bucket that writes every object with a multipart upload
#[derive(Clone)]
pub struct S3LargeBucket {
    core: S3Core,
    part_size: usize,
}

impl S3LargeBucket {
    /// Build an SDK client from `options` and wrap it
    pub async fn new(options: S3Options) -> Result<Self> {
        let client = build_client(&options).await?;
        Self::with_api(options, Arc::new(SdkApi::new(client)))
    }

    /// Use an existing [`S3Api`] implementation
    ///
    /// Multipart objects carry no whole-object SHA-256, so checksum upload
    /// and verification are rejected rather than silently skipped.
    pub fn with_api(options: S3Options, api: Arc<dyn S3Api>) -> Result<Self> {
        if options.upload_checksum || options.verify_checksum {
            return Err(Error::Config(
                "SHA-256 checksums are only supported by the single-request S3 engine".to_string(),
            ));
        }
        Ok(Self {
            core: S3Core::new(&options, api, LARGE_DEFAULT_CONTENT_TYPE)?,
            part_size: options.part_size,
        })
    }

    /// Stream an object straight into `sink`, returning the bytes written
    ///
    /// Skips the intermediate reader handed out by [`Bucket::get`]; the sink
    /// is flushed but not shut down.
    pub async fn get_to_writer(
        &self,
        ctx: &CancellationToken,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let response = self.core.get_object(ctx, key, false).await?;
        let mut body = self.core.decode(response.body).await?;
        cancellable(ctx, async {
            let written = tokio::io::copy(&mut body, sink).await?;
            sink.flush().await?;
            Ok(written)
        })
        .await
    }
}

struct LargeWriter {
    core: S3Core,
    ctx: CancellationToken,
    key: String,
    part_size: usize,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    failed: bool,
}

impl LargeWriter {
    async fn ensure_upload(&mut self) -> Result<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let request = CreateMultipartRequest {
            bucket: self.core.bucket.clone(),
            key: self.key.clone(),
            content_type: self.core.content_type.clone(),
            acl: self.core.acl(),
        };
        let core = &self.core;
        let id = core
            .retry(&self.ctx, || core.api.create_multipart_upload(request.clone()))
            .await?;
        tracing::debug!(key = %self.key, upload_id = %id, "started multipart upload");
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn upload_part(&mut self, body: Bytes) -> Result<()> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;
        let core = &self.core;
        let key = &self.key;
        let etag = core
            .retry(&self.ctx, || {
                core.api
                    .upload_part(&core.bucket, key, &upload_id, part_number, body.clone())
            })
            .await?;
        self.parts.push(CompletedPart { part_number, etag });
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        let remainder = Bytes::from(std::mem::take(&mut self.buffer));
        if !remainder.is_empty() || self.parts.is_empty() {
            self.upload_part(remainder).await?;
        }

        let request = CompleteMultipartRequest {
            bucket: self.core.bucket.clone(),
            key: self.key.clone(),
            upload_id: self.ensure_upload().await?,
            parts: self.parts.clone(),
            if_none_match: self.core.if_not_exists,
        };
        let core = &self.core;
        core.commit(&self.ctx, || core.api.complete_multipart_upload(request.clone()))
            .await
    }

    /// Abort the upload, if one was started; the original error is what the
    /// caller sees
    async fn abort(&mut self, cause: &Error) {
        self.failed = true;
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        tracing::warn!(key = %self.key, upload_id = %upload_id, error = %cause, "aborting multipart upload");
        // not raced against ctx: a canceled writer must still clean up
        if let Err(e) = self
            .core
            .api
            .abort_multipart_upload(&self.core.bucket, &self.key, &upload_id)
            .await
        {
            tracing::error!(key = %self.key, upload_id = %upload_id, error = %e, "abort failed");
        }
    }
}

#[async_trait]
impl ObjectWriter for LargeWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.failed {
            return Err(Error::Transfer(format!(
                "multipart upload of '{}' was aborted",
                self.key
            )));
        }
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = Bytes::from(std::mem::replace(&mut self.buffer, rest));
            if let Err(e) = self.upload_part(part).await {
                self.abort(&e).await;
                return Err(e);
            }
        }
        Ok(buf.len())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if this.failed {
            return Err(Error::Transfer(format!(
                "multipart upload of '{}' was aborted",
                this.key
            )));
        }
        match this.complete().await {
            Ok(()) => Ok(()),
            Err(e) => {
                this.abort(&e).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Bucket for S3LargeBucket {
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
        let writer = LargeWriter {
            core: self.core.clone(),
            ctx: ctx.clone(),
            key: self.core.normalize_key(key),
            part_size: self.part_size,
            buffer: Vec::new(),
            upload_id: None,
            parts: Vec::new(),
            failed: false,
        };
        Ok(maybe_compress(Box::new(writer), self.core.compress))
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        let response = self.core.get_object(ctx, key, false).await?;
        self.core.decode(response.body).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockS3Api;
    use crate::options::MIN_PART_SIZE;
    use crate::testing::MemoryApi;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn options() -> S3Options {
        S3Options {
            prefix: "pre".to_string(),
            max_retries: 0,
            ..S3Options::new("us-east-1", "bucket")
        }
    }

    fn bucket(api: Arc<dyn S3Api>, options: S3Options) -> S3LargeBucket {
        S3LargeBucket::with_api(options, api).unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn put(bucket: &dyn Bucket, key: &str, data: &[u8]) -> Result<()> {
        let ctx = CancellationToken::new();
        let mut writer = bucket.writer(&ctx, key).await?;
        for chunk in data.chunks(1024 * 1024) {
            writer.write(chunk).await?;
        }
        writer.close().await
    }

    async fn read(bucket: &dyn Bucket, key: &str) -> Vec<u8> {
        let ctx = CancellationToken::new();
        let mut out = Vec::new();
        bucket
            .get(&ctx, key)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_round_trip_splits_parts() {
        let api = Arc::new(MemoryApi::new());
        let b = bucket(api.clone(), options());
        let data = payload(MIN_PART_SIZE * 2 + 123);

        put(&b, "big", &data).await.unwrap();

        assert_eq!(api.completed_part_counts(), vec![3]);
        assert_eq!(read(&b, "big").await, data);
        let stored = api.object("bucket", "pre/big").unwrap();
        assert_eq!(stored.content_type, LARGE_DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_small_and_empty_objects() {
        let api = Arc::new(MemoryApi::new());
        let b = bucket(api.clone(), options());

        put(&b, "tiny", b"hello").await.unwrap();
        put(&b, "empty", b"").await.unwrap();

        assert_eq!(read(&b, "tiny").await, b"hello");
        assert!(read(&b, "empty").await.is_empty());
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let api = Arc::new(MemoryApi::new());
        let b = bucket(api.clone(), S3Options { compress: true, ..options() });
        let data = b"large and repetitive ".repeat(500_000);

        put(&b, "packed", &data).await.unwrap();
        let stored = api.object("bucket", "pre/packed").unwrap();
        assert_eq!(&stored.data[..2], &[0x1f, 0x8b]);
        assert_eq!(read(&b, "packed").await, data);
    }

    #[tokio::test]
    async fn test_if_not_exists_aborts_second_upload() {
        let api = Arc::new(MemoryApi::new());
        let b = bucket(api.clone(), S3Options { if_not_exists: true, ..options() });

        put(&b, "key", b"hello world").await.unwrap();
        let err = put(&b, "key", b"hello world 2").await.unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(api.aborted_uploads().len(), 1);
        assert_eq!(api.open_uploads(), 0);
        assert_eq!(read(&b, "key").await, b"hello world");
    }

    #[tokio::test]
    async fn test_part_failure_aborts_upload() {
        let mut mock = MockS3Api::new();
        mock.expect_create_multipart_upload()
            .times(1)
            .returning(|_| Ok("upload-1".to_string()));
        mock.expect_upload_part()
            .returning(|_, _, _, _, _| Err(Error::Transfer("part rejected".to_string())));
        mock.expect_abort_multipart_upload()
            .with(eq("bucket"), eq("pre/k"), eq("upload-1"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_complete_multipart_upload().never();

        let b = bucket(Arc::new(mock), options());
        let ctx = CancellationToken::new();
        let mut writer = b.writer(&ctx, "k").await.unwrap();

        let err = writer.write(&payload(MIN_PART_SIZE + 1)).await.unwrap_err();
        assert!(err.to_string().contains("part rejected"));

        // the writer is dead after an abort
        assert!(writer.write(b"more").await.is_err());
        assert!(writer.close().await.is_err());
    }

    #[tokio::test]
    async fn test_complete_failure_aborts_upload() {
        let mut mock = MockS3Api::new();
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-2".to_string()));
        mock.expect_upload_part()
            .returning(|_, _, _, n, _| Ok(format!("etag-{n}")));
        mock.expect_complete_multipart_upload()
            .withf(|req| req.parts.len() == 1 && req.parts[0].etag == "etag-1")
            .returning(|_| Err(Error::Transfer("complete rejected".to_string())));
        mock.expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let b = bucket(Arc::new(mock), options());
        assert!(put(&b, "k", b"data").await.is_err());
    }

    #[tokio::test]
    async fn test_conditional_complete_is_not_retried() {
        let completes = Arc::new(AtomicUsize::new(0));
        let counter = completes.clone();

        let mut mock = MockS3Api::new();
        mock.expect_create_multipart_upload()
            .returning(|_| Ok("upload-3".to_string()));
        mock.expect_upload_part()
            .returning(|_, _, _, n, _| Ok(format!("etag-{n}")));
        mock.expect_complete_multipart_upload().returning(move |req| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Network("connection reset".to_string()))
            } else {
                Err(Error::AlreadyExists(req.key))
            }
        });
        mock.expect_abort_multipart_upload()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let b = bucket(
            Arc::new(mock),
            S3Options {
                if_not_exists: true,
                max_retries: 3,
                ..options()
            },
        );
        let err = put(&b, "k", b"data").await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_checksum_options_are_rejected() {
        for options in [
            S3Options { upload_checksum: true, ..options() },
            S3Options { verify_checksum: true, ..options() },
        ] {
            let api: Arc<dyn S3Api> = Arc::new(MemoryApi::new());
            let err = S3LargeBucket::with_api(options, api).err().unwrap();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains("single-request"));
        }
    }

    #[tokio::test]
    async fn test_get_to_writer() {
        let api = Arc::new(MemoryApi::new());
        let b = bucket(api.clone(), S3Options { compress: true, ..options() });
        let data = payload(300_000);
        put(&b, "obj", &data).await.unwrap();

        let ctx = CancellationToken::new();
        let mut sink: Vec<u8> = Vec::new();
        let written = b.get_to_writer(&ctx, "obj", &mut sink).await.unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_get_to_writer_missing_key() {
        let api = Arc::new(MemoryApi::new());
        let b = bucket(api, options());
        let ctx = CancellationToken::new();
        let mut sink: Vec<u8> = Vec::new();
        let err = b.get_to_writer(&ctx, "missing", &mut sink).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
