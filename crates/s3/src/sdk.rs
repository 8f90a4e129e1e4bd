//! [`S3Api`] over aws-sdk-s3

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    ChecksumMode, CompletedMultipartUpload, Delete, ObjectCannedAcl, ObjectIdentifier,
};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_types::DateTime;
use bucketry_core::{Error, Result};
use bytes::Bytes;
use jiff::Timestamp;

use crate::api::{
    CompleteMultipartRequest, CopyObjectRequest, CreateMultipartRequest, DeleteFailure,
    GetObjectResponse, ListPage, ListedObject, ObjectHead, PutObjectRequest, S3Api,
};
use crate::options::S3Permissions;

/// Production [`S3Api`] backed by an `aws_sdk_s3::Client`
#[derive(Debug, Clone)]
pub struct SdkApi {
    client: aws_sdk_s3::Client,
}

impl SdkApi {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.client
    }
}

impl S3Permissions {
    fn canned_acl(self) -> ObjectCannedAcl {
        match self {
            S3Permissions::Private => ObjectCannedAcl::Private,
            S3Permissions::PublicRead => ObjectCannedAcl::PublicRead,
            S3Permissions::PublicReadWrite => ObjectCannedAcl::PublicReadWrite,
            S3Permissions::AuthenticatedRead => ObjectCannedAcl::AuthenticatedRead,
            S3Permissions::AwsExecRead => ObjectCannedAcl::AwsExecRead,
            S3Permissions::BucketOwnerRead => ObjectCannedAcl::BucketOwnerRead,
            S3Permissions::BucketOwnerFullControl => ObjectCannedAcl::BucketOwnerFullControl,
        }
    }
}

/// Format AWS SDK error into a detailed error message
fn format_sdk_error<E>(error: &SdkError<E, HttpResponse>) -> String
where
    E: ProvideErrorMetadata + std::fmt::Display,
{
    match error {
        SdkError::ServiceError(service_err) => {
            let err = service_err.err();
            let mut msg = format!("Service error: {err}");
            if let Some(code) = err.code() {
                msg.push_str(&format!(" (code: {code})"));
            }
            if let Some(detail) = err.message()
                && !msg.contains(detail)
            {
                msg.push_str(&format!(": {detail}"));
            }
            msg
        }
        SdkError::ConstructionFailure(err) => format!("Request construction failed: {err:?}"),
        SdkError::TimeoutError(_) => "Request timeout".to_string(),
        SdkError::DispatchFailure(err) => format!("Network dispatch error: {err:?}"),
        SdkError::ResponseError(err) => format!("Response error: {err:?}"),
        _ => error.to_string(),
    }
}

/// Map an SDK failure onto the bucket error taxonomy
///
/// `what` names the object or bucket involved and prefixes the message.
fn classify<E>(what: &str, error: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Display,
{
    let msg = format!("{what}: {}", format_sdk_error(&error));
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Error::Network(msg)
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            match (status, service_err.err().code()) {
                (404, _) | (_, Some("NoSuchKey" | "NoSuchBucket" | "NotFound")) => {
                    Error::NotFound(what.to_string())
                }
                (403, _) | (_, Some("AccessDenied")) => Error::PermissionDenied(msg),
                (412, _) | (_, Some("PreconditionFailed" | "ConditionalRequestConflict")) => {
                    Error::AlreadyExists(what.to_string())
                }
                (500..=599, _)
                | (_, Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable")) => {
                    Error::Network(msg)
                }
                _ => Error::Transfer(msg),
            }
        }
        _ => Error::Transfer(msg),
    }
}

/// `bucket/key` with each key segment URL-encoded, as CopyObject expects
fn copy_source(bucket: &str, key: &str) -> String {
    let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
    format!("{bucket}/{}", encoded.join("/"))
}

fn to_timestamp(dt: &DateTime) -> Option<Timestamp> {
    Timestamp::new(dt.secs(), dt.subsec_nanos() as i32).ok()
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[async_trait]
impl S3Api for SdkApi {
    async fn head_bucket(&self, bucket: &str) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| classify(&format!("bucket '{bucket}'"), e))?;
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(key, e))?;

        Ok(ObjectHead {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            etag: response.e_tag().map(trim_etag),
        })
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<()> {
        let mut builder = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .body(ByteStream::from(request.body));

        if let Some(acl) = request.acl {
            builder = builder.acl(acl.canned_acl());
        }
        if let Some(checksum) = request.checksum_sha256 {
            builder = builder.checksum_sha256(checksum);
        }
        if request.if_none_match {
            builder = builder.if_none_match("*");
        }

        builder
            .send()
            .await
            .map_err(|e| classify(&request.key, e))?;
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        checksum_mode: bool,
    ) -> Result<GetObjectResponse> {
        let mut builder = self.client.get_object().bucket(bucket).key(key);
        if checksum_mode {
            builder = builder.checksum_mode(ChecksumMode::Enabled);
        }

        let response = builder.send().await.map_err(|e| classify(key, e))?;
        let content_length = response.content_length().map(|n| n.max(0) as u64);
        let checksum_sha256 = response.checksum_sha256().map(str::to_string);

        Ok(GetObjectResponse {
            body: Box::pin(response.body.into_async_read()),
            content_length,
            checksum_sha256,
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage> {
        let mut builder = self.client.list_objects_v2().bucket(bucket);
        if !prefix.is_empty() {
            builder = builder.prefix(prefix);
        }

        let response = builder
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| classify(&format!("bucket '{bucket}'"), e))?;

        let objects = response
            .contents()
            .iter()
            .map(|object| ListedObject {
                key: object.key().unwrap_or_default().to_string(),
                size: object.size().unwrap_or(0).max(0) as u64,
                last_modified: object.last_modified().and_then(to_timestamp),
                etag: object.e_tag().map(trim_etag),
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<DeleteFailure>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let objects = keys
            .iter()
            .map(|k| {
                ObjectIdentifier::builder()
                    .key(k)
                    .build()
                    .map_err(|e| Error::InvalidKey(format!("{k}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| Error::Transfer(format!("building delete request: {e}")))?;

        let response = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| classify(&format!("bucket '{bucket}'"), e))?;

        Ok(response
            .errors()
            .iter()
            .map(|e| DeleteFailure {
                key: e.key().unwrap_or_default().to_string(),
                message: format!(
                    "{} ({})",
                    e.message().unwrap_or("delete failed"),
                    e.code().unwrap_or("unknown")
                ),
            })
            .collect())
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<()> {
        let mut builder = self
            .client
            .copy_object()
            .copy_source(copy_source(&request.source_bucket, &request.source_key))
            .bucket(&request.bucket)
            .key(&request.key);
        if let Some(acl) = request.acl {
            builder = builder.acl(acl.canned_acl());
        }

        builder
            .send()
            .await
            .map_err(|e| classify(&request.source_key, e))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, request: CreateMultipartRequest) -> Result<String> {
        let mut builder = self
            .client
            .create_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .content_type(&request.content_type);
        if let Some(acl) = request.acl {
            builder = builder.acl(acl.canned_acl());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify(&request.key, e))?;
        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Transfer(format!("{}: no upload id returned", request.key)))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let response = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify(&format!("{key} part {part_number}"), e))?;

        response
            .e_tag()
            .map(trim_etag)
            .ok_or_else(|| Error::Transfer(format!("{key} part {part_number}: no ETag returned")))
    }

    async fn complete_multipart_upload(&self, request: CompleteMultipartRequest) -> Result<()> {
        let parts = request
            .parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        let mut builder = self
            .client
            .complete_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .multipart_upload(upload);
        if request.if_none_match {
            builder = builder.if_none_match("*");
        }

        builder
            .send()
            .await
            .map_err(|e| classify(&request.key, e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encodes_segments() {
        assert_eq!(copy_source("b", "a/b c/d+e"), "b/a/b%20c/d%2Be");
        assert_eq!(copy_source("b", "plain"), "b/plain");
    }

    #[test]
    fn test_trim_etag() {
        assert_eq!(trim_etag("\"abc\""), "abc");
    }

    #[test]
    fn test_to_timestamp_keeps_subseconds() {
        let ts = to_timestamp(&DateTime::from_secs_and_nanos(1_700_000_000, 500_000_000)).unwrap();
        assert_eq!(ts.as_second(), 1_700_000_000);
        assert_eq!(ts.subsec_millisecond(), 500);
    }

    #[test]
    fn test_canned_acl_mapping() {
        assert_eq!(S3Permissions::PublicRead.canned_acl(), ObjectCannedAcl::PublicRead);
        assert_eq!(
            S3Permissions::BucketOwnerFullControl.canned_acl(),
            ObjectCannedAcl::BucketOwnerFullControl
        );
    }
}
