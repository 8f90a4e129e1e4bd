//! bucketry-s3: S3 backends for bucketry
//!
//! This crate provides two [`bucketry_core::Bucket`] implementations over
//! S3-compatible storage:
//! - [`S3SmallBucket`] buffers each object and writes it with one PutObject
//! - [`S3LargeBucket`] streams objects through multipart uploads
//!
//! Both share client construction, credential caching and retry handling.
//! Remote calls go through the [`S3Api`] trait so engines can be exercised
//! without a live endpoint.

pub mod api;
pub mod checksum;
pub mod client;
mod common;
pub mod credentials;
pub mod large;
pub mod options;
pub mod sdk;
pub mod small;

#[cfg(test)]
mod testing;

pub use api::S3Api;
pub use client::{build_client, credential_cache_key};
pub use credentials::{
    CredentialCache, DEFAULT_MINIMUM_LIFETIME, SeededCredentialsProvider, assume_role_cache_key,
    assume_role_credentials, static_credentials, with_seed,
};
pub use large::{LARGE_DEFAULT_CONTENT_TYPE, S3LargeBucket};
pub use options::{
    AssumeRole, DEFAULT_MAX_RETRIES, MAX_DELETE_BATCH, MIN_PART_SIZE, S3Options, S3Permissions,
    StaticCredentials,
};
pub use sdk::SdkApi;
pub use small::{S3SmallBucket, SMALL_DEFAULT_CONTENT_TYPE};
