//! Remote API seam
//!
//! The transfer engines talk to S3 only through [`S3Api`]. The production
//! implementation is [`crate::sdk::SdkApi`]; tests substitute an in-memory
//! store or a mock.

use async_trait::async_trait;
use bucketry_core::{ObjectReader, Result};
use bytes::Bytes;
use jiff::Timestamp;

use crate::options::S3Permissions;

/// Single-request object upload
#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    pub acl: Option<S3Permissions>,
    /// Base64 SHA-256 of `body`, stored by the server alongside the object
    pub checksum_sha256: Option<String>,
    /// Fail instead of replacing an existing object
    pub if_none_match: bool,
}

pub struct GetObjectResponse {
    pub body: ObjectReader,
    pub content_length: Option<u64>,
    /// Stored checksum; only requested when checksum mode is on
    pub checksum_sha256: Option<String>,
}

impl std::fmt::Debug for GetObjectResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectResponse")
            .field("content_length", &self.content_length)
            .field("checksum_sha256", &self.checksum_sha256)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    /// Full key, including the bucket prefix
    pub key: String,
    pub size: u64,
    pub last_modified: Option<Timestamp>,
    pub etag: Option<String>,
}

/// One page of a ListObjectsV2 listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ListedObject>,
    /// Token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Per-key failure reported by a batch delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CopyObjectRequest {
    pub source_bucket: String,
    pub source_key: String,
    pub bucket: String,
    pub key: String,
    pub acl: Option<S3Permissions>,
}

#[derive(Debug, Clone)]
pub struct CreateMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub acl: Option<S3Permissions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct CompleteMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub if_none_match: bool,
}

/// The subset of the S3 API the engines use
///
/// Implementations map failures onto [`bucketry_core::Error`]: a missing key
/// or bucket is `NotFound`, a refused request is `PermissionDenied`, a
/// failed `If-None-Match` is `AlreadyExists` and transient transport
/// failures are `Network`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait S3Api: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> Result<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead>;

    async fn put_object(&self, request: PutObjectRequest) -> Result<()>;

    async fn get_object(&self, bucket: &str, key: &str, checksum_mode: bool)
    -> Result<GetObjectResponse>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage>;

    /// Delete up to 1000 keys; returns the keys the server refused
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<DeleteFailure>>;

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<()>;

    /// Returns the upload id
    async fn create_multipart_upload(&self, request: CreateMultipartRequest) -> Result<String>;

    /// Returns the part's ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String>;

    async fn complete_multipart_upload(&self, request: CompleteMultipartRequest) -> Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}
