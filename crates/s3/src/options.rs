//! S3 bucket construction options

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use aws_credential_types::provider::SharedCredentialsProvider;
use bucketry_core::{DEFAULT_BATCH_SIZE, Error, Result, RetryBuilder, RetryConfig};
use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialCache, DEFAULT_MINIMUM_LIFETIME};

/// S3 rejects larger DeleteObjects batches
pub const MAX_DELETE_BATCH: usize = 1000;

/// Smallest part S3 accepts for every part but the last
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Canned ACL applied to written objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum S3Permissions {
    #[default]
    Private,
    PublicRead,
    PublicReadWrite,
    AuthenticatedRead,
    AwsExecRead,
    BucketOwnerRead,
    BucketOwnerFullControl,
}

impl fmt::Display for S3Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            S3Permissions::Private => "private",
            S3Permissions::PublicRead => "public-read",
            S3Permissions::PublicReadWrite => "public-read-write",
            S3Permissions::AuthenticatedRead => "authenticated-read",
            S3Permissions::AwsExecRead => "aws-exec-read",
            S3Permissions::BucketOwnerRead => "bucket-owner-read",
            S3Permissions::BucketOwnerFullControl => "bucket-owner-full-control",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for S3Permissions {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(S3Permissions::Private),
            "public-read" => Ok(S3Permissions::PublicRead),
            "public-read-write" => Ok(S3Permissions::PublicReadWrite),
            "authenticated-read" => Ok(S3Permissions::AuthenticatedRead),
            "aws-exec-read" => Ok(S3Permissions::AwsExecRead),
            "bucket-owner-read" => Ok(S3Permissions::BucketOwnerRead),
            "bucket-owner-full-control" => Ok(S3Permissions::BucketOwnerFullControl),
            _ => Err(format!("Invalid permissions: {s}")),
        }
    }
}

/// Access key pair
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticCredentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"** redacted **")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumeRole {
    pub role_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// Options shared by the small and large S3 engines
///
/// Serializable fields can come from TOML; the credentials provider and the
/// credential cache are live objects and must be set in code.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Options {
    pub region: String,
    /// Bucket name
    pub name: String,
    /// Prefix every key is rooted under
    pub prefix: String,
    /// Endpoint of an S3-compatible service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub force_path_style: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<StaticCredentials>,
    /// Profile in the shared credentials file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_credentials_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_credentials_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assume_role: Option<AssumeRole>,
    #[serde(skip)]
    pub credentials_provider: Option<SharedCredentialsProvider>,
    #[serde(skip)]
    pub credential_cache: Option<CredentialCache>,
    /// Identity of the credentials in a shared cache; required with an
    /// explicit provider, derived from the other sources otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_cache_key: Option<String>,
    /// Cached credentials closer than this to expiry are refreshed
    pub minimum_credential_lifetime_secs: u64,

    /// Content type for writes; each engine has its own default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub permissions: S3Permissions,
    pub compress: bool,
    /// Send a SHA-256 checksum with every single-request upload
    pub upload_checksum: bool,
    /// Require and check the stored SHA-256 checksum on every read
    pub verify_checksum: bool,
    /// Never replace existing objects
    pub if_not_exists: bool,
    /// Retries after the first attempt of an idempotent call
    pub max_retries: u32,
    /// Backoff before the first retry, doubled for each further one
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub batch_size: usize,
    /// Multipart part size used by the large engine
    pub part_size: usize,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            region: String::new(),
            name: String::new(),
            prefix: String::new(),
            endpoint: None,
            force_path_style: false,
            credentials: None,
            shared_credentials_profile: None,
            shared_credentials_file: None,
            assume_role: None,
            credentials_provider: None,
            credential_cache: None,
            credential_cache_key: None,
            minimum_credential_lifetime_secs: DEFAULT_MINIMUM_LIFETIME.as_secs(),
            content_type: None,
            permissions: S3Permissions::Private,
            compress: false,
            upload_checksum: false,
            verify_checksum: false,
            if_not_exists: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: RetryConfig::default().base_delay_ms,
            retry_max_delay_ms: RetryConfig::default().max_delay_ms,
            batch_size: DEFAULT_BATCH_SIZE,
            part_size: MIN_PART_SIZE,
        }
    }
}

impl fmt::Debug for S3Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Options")
            .field("region", &self.region)
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("assume_role", &self.assume_role)
            .field("credentials_provider", &self.credentials_provider.is_some())
            .field("credential_cache", &self.credential_cache.is_some())
            .field("credential_cache_key", &self.credential_cache_key)
            .field("permissions", &self.permissions)
            .field("compress", &self.compress)
            .field("verify_checksum", &self.verify_checksum)
            .field("if_not_exists", &self.if_not_exists)
            .field("batch_size", &self.batch_size)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl S3Options {
    pub fn new(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(s).map_err(|e| Error::Config(format!("s3 options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject inconsistent options before any client is built
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("bucket name is required".to_string()));
        }
        if self.region.is_empty() && self.endpoint.is_none() {
            return Err(Error::Config(
                "a region is required unless an endpoint is set".to_string(),
            ));
        }
        if self.batch_size == 0 || self.batch_size > MAX_DELETE_BATCH {
            return Err(Error::Config(format!(
                "batch size must be between 1 and {MAX_DELETE_BATCH}, got {}",
                self.batch_size
            )));
        }
        if self.part_size < MIN_PART_SIZE {
            return Err(Error::Config(format!(
                "part size must be at least {MIN_PART_SIZE} bytes, got {}",
                self.part_size
            )));
        }

        let shared_file = self.shared_credentials_profile.is_some()
            || self.shared_credentials_file.is_some();
        let sources = [
            self.credentials_provider.is_some(),
            self.credentials.is_some(),
            shared_file,
        ];
        if sources.iter().filter(|set| **set).count() > 1 {
            return Err(Error::Config(
                "only one of credentials provider, static credentials and shared credentials may be set"
                    .to_string(),
            ));
        }
        if self.credentials_provider.is_some()
            && self.credential_cache.is_some()
            && self.credential_cache_key.is_none()
        {
            return Err(Error::Config(
                "a credential cache key is required to cache an explicit credentials provider"
                    .to_string(),
            ));
        }
        if self.credential_cache_key.as_deref() == Some("") {
            return Err(Error::Config("credential cache key must not be empty".to_string()));
        }
        if let Some(creds) = &self.credentials
            && (creds.access_key.is_empty() || creds.secret_key.is_empty())
        {
            return Err(Error::Config(
                "static credentials need both an access key and a secret key".to_string(),
            ));
        }
        if let Some(role) = &self.assume_role
            && role.role_arn.is_empty()
        {
            return Err(Error::Config("assume role requires a role ARN".to_string()));
        }
        Ok(())
    }

    pub fn minimum_credential_lifetime(&self) -> Duration {
        Duration::from_secs(self.minimum_credential_lifetime_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryBuilder::new()
            .retries(self.max_retries)
            .base_delay_ms(self.retry_base_delay_ms)
            .max_delay_ms(self.retry_max_delay_ms)
            .build()
    }

    /// Identity the store is addressed by; buckets with equal stores can
    /// copy objects between each other server-side
    pub fn store_id(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("s3:{endpoint}"),
            None => format!("s3:{}", self.region),
        }
    }
}
