//! Credential caching shared across S3 clients
//!
//! A [`CredentialCache`] is created by the caller and handed to every client
//! that should share credentials. Entries are refreshed lazily on retrieval;
//! nothing runs in the background.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use aws_config::Region;
use aws_config::sts::AssumeRoleProvider;
use aws_credential_types::Credentials;
use aws_credential_types::provider::{self, ProvideCredentials, SharedCredentialsProvider, future};
use tokio::sync::Mutex;

/// Default headroom before a cached credential's expiry at which it is
/// refreshed
pub const DEFAULT_MINIMUM_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Credentials keyed by identity, shared by cloning
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    entries: Arc<Mutex<HashMap<String, Credentials>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every cached entry
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Seed the cache, replacing any entry under `key`
    pub async fn insert(&self, key: impl Into<String>, credentials: Credentials) {
        self.entries.lock().await.insert(key.into(), credentials);
    }

    pub async fn get(&self, key: &str) -> Option<Credentials> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Credentials provider that consults a [`CredentialCache`] before the
/// provider it wraps
///
/// `minimum_lifetime` belongs to the provider rather than the cache, so
/// clients sharing a cache can each demand their own headroom.
#[derive(Debug, Clone)]
pub struct SeededCredentialsProvider {
    provider: SharedCredentialsProvider,
    cache_key: String,
    minimum_lifetime: Duration,
    cache: CredentialCache,
}

/// Wrap `provider` with the cache entry named `cache_key`
pub fn with_seed(
    provider: impl ProvideCredentials + 'static,
    cache_key: impl Into<String>,
    minimum_lifetime: Duration,
    cache: &CredentialCache,
) -> SeededCredentialsProvider {
    SeededCredentialsProvider {
        provider: SharedCredentialsProvider::new(provider),
        cache_key: cache_key.into(),
        minimum_lifetime,
        cache: cache.clone(),
    }
}

impl SeededCredentialsProvider {
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    async fn retrieve(&self) -> provider::Result {
        // held across the wrapped call so concurrent refreshes collapse into one
        let mut entries = self.cache.entries.lock().await;
        let now = SystemTime::now();

        if let Some(cached) = entries.get(&self.cache_key) {
            let fresh = match cached.expiry() {
                Some(expiry) => expiry > now + self.minimum_lifetime,
                None => true,
            };
            if fresh {
                return Ok(cached.clone());
            }
        }

        match self.provider.provide_credentials().await {
            Ok(credentials) => {
                entries.insert(self.cache_key.clone(), credentials.clone());
                Ok(credentials)
            }
            Err(e) => {
                if let Some(cached) = entries.get(&self.cache_key)
                    && cached.expiry().is_none_or(|expiry| expiry > now)
                {
                    tracing::warn!(
                        cache_key = %self.cache_key,
                        error = %e,
                        "credential refresh failed, using cached credentials"
                    );
                    return Ok(cached.clone());
                }
                entries.remove(&self.cache_key);
                Err(e)
            }
        }
    }
}

impl ProvideCredentials for SeededCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(self.retrieve())
    }
}

/// Fixed access key credentials
pub fn static_credentials(
    access_key: impl Into<String>,
    secret_key: impl Into<String>,
    session_token: Option<String>,
) -> Credentials {
    Credentials::new(
        access_key,
        secret_key,
        session_token,
        None,
        "bucketry-static-credentials",
    )
}

/// Provider that assumes `role_arn` using `base` credentials
pub async fn assume_role_credentials(
    role_arn: &str,
    external_id: Option<&str>,
    region: Option<Region>,
    base: impl ProvideCredentials + 'static,
) -> AssumeRoleProvider {
    let mut builder = AssumeRoleProvider::builder(role_arn).session_name("bucketry");
    if let Some(id) = external_id {
        builder = builder.external_id(id);
    }
    if let Some(region) = region {
        builder = builder.region(region);
    }
    builder.build_from_provider(base).await
}

/// Cache key for an assumed role; `|` cannot appear in an ARN
pub fn assume_role_cache_key(role_arn: &str, external_id: Option<&str>) -> String {
    match external_id {
        Some(id) => format!("{role_arn}|{id}"),
        None => role_arn.to_string(),
    }
}
