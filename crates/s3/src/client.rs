//! S3 client construction
//!
//! Builds an `aws_sdk_s3::Client` from [`S3Options`]: credentials, region,
//! endpoint and addressing style. The SDK's retry layer is disabled because
//! the engines retry idempotent calls themselves.

use aws_config::profile::ProfileFileCredentialsProvider;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::SharedCredentialsProvider;
use bucketry_core::{Error, Result};

use crate::credentials::{
    assume_role_cache_key, assume_role_credentials, static_credentials, with_seed,
};
use crate::options::S3Options;

/// Create an S3 client for the given options
pub async fn build_client(options: &S3Options) -> Result<aws_sdk_s3::Client> {
    options.validate()?;

    let region = (!options.region.is_empty()).then(|| Region::new(options.region.clone()));
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .retry_config(RetryConfig::disabled());
    if let Some(region) = &region {
        loader = loader.region(region.clone());
    }
    if let Some(endpoint) = &options.endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    if let Some(provider) = base_credentials(options) {
        loader = loader.credentials_provider(provider);
    }
    let config = loader.load().await;

    let mut provider = config.credentials_provider();
    if let Some(role) = &options.assume_role {
        let base = provider.ok_or_else(|| {
            Error::Config("assuming a role requires base credentials".to_string())
        })?;
        let assumed = assume_role_credentials(
            &role.role_arn,
            role.external_id.as_deref(),
            region.clone(),
            base,
        )
        .await;
        provider = Some(SharedCredentialsProvider::new(assumed));
    }
    if let (Some(cache), Some(inner)) = (&options.credential_cache, provider.clone()) {
        let seeded = with_seed(
            inner,
            credential_cache_key(options),
            options.minimum_credential_lifetime(),
            cache,
        );
        provider = Some(SharedCredentialsProvider::new(seeded));
    }

    let mut s3_config =
        aws_sdk_s3::config::Builder::from(&config).force_path_style(options.force_path_style);
    if let Some(provider) = provider {
        s3_config = s3_config.credentials_provider(provider);
    }

    tracing::debug!(
        bucket = %options.name,
        store = %options.store_id(),
        "created S3 client"
    );
    Ok(aws_sdk_s3::Client::from_conf(s3_config.build()))
}

/// Credentials configured directly in the options, if any; `None` falls back
/// to the SDK's default chain
fn base_credentials(options: &S3Options) -> Option<SharedCredentialsProvider> {
    if let Some(provider) = &options.credentials_provider {
        return Some(provider.clone());
    }
    if let Some(creds) = &options.credentials {
        return Some(SharedCredentialsProvider::new(static_credentials(
            creds.access_key.clone(),
            creds.secret_key.clone(),
            creds.session_token.clone(),
        )));
    }
    if options.shared_credentials_profile.is_none() && options.shared_credentials_file.is_none() {
        return None;
    }

    let mut builder = ProfileFileCredentialsProvider::builder();
    if let Some(profile) = &options.shared_credentials_profile {
        builder = builder.profile_name(profile);
    }
    if let Some(path) = &options.shared_credentials_file {
        let files = ProfileFiles::builder()
            .with_file(ProfileFileKind::Credentials, path)
            .build();
        builder = builder.profile_files(files);
    }
    Some(SharedCredentialsProvider::new(builder.build()))
}

/// Key identifying the credentials these options resolve to in a shared
/// cache
///
/// An explicit [`S3Options::credential_cache_key`] always wins. Explicit
/// providers are opaque, so [`S3Options::validate`] requires one for them.
pub fn credential_cache_key(options: &S3Options) -> String {
    if let Some(key) = &options.credential_cache_key {
        return key.clone();
    }
    if let Some(role) = &options.assume_role {
        return assume_role_cache_key(&role.role_arn, role.external_id.as_deref());
    }
    if let Some(creds) = &options.credentials {
        return format!("static:{}", creds.access_key);
    }
    match (&options.shared_credentials_file, &options.shared_credentials_profile) {
        (None, None) => "default".to_string(),
        (file, profile) => format!(
            "profile:{}:{}",
            file.as_deref().map(|f| f.display().to_string()).unwrap_or_default(),
            profile.as_deref().unwrap_or("default")
        ),
    }
}
