//! Remote cache tier over HTTP.
//!
//! Speaks the minimal artifact verb set:
//!
//! - `GET /artifacts/{hex}` — 200 with bytes, 404 missing, 401/403 auth.
//! - `PUT /artifacts/{hex}` — 200 or 201.
//! - `HEAD /artifacts/{hex}` — 200 or 404.
//! - `DELETE /artifacts/{hex}` — 200 or 404.
//!
//! Authentication is a bearer token. Transport failures are
//! `NetworkError` (retryable, bounded); auth failures are
//! `CacheUnauthorized`; a missing object is `CacheNotFound`, which the
//! tiered store converts into a plain miss. The local tier stays
//! authoritative: nothing here is trusted without digest verification.

use std::time::Duration;

use derive_more::Debug;
use reqwest::StatusCode;
use tracing::{instrument, trace, warn};
use url::Url;

use crate::{
    error::{BuildError, BuildErrorKind, Result},
    hash::{Digest, hash_bytes},
};

use super::ObjectStore;

/// Configuration for the remote tier.
#[derive(Clone, Debug, bon::Builder)]
pub struct RemoteConfig {
    /// Base URL of the artifact service.
    pub base_url: Url,
    /// Bearer token, if the service requires auth. Never rendered.
    #[debug(skip)]
    pub token: Option<String>,
    /// Per-request timeout.
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    /// Maximum concurrent in-flight requests.
    #[builder(default = 8)]
    pub pool_size: usize,
    /// Total attempts per request (first try plus retries).
    #[builder(default = 3)]
    pub attempts: u32,
    /// Base delay for exponential backoff between retries.
    #[builder(default = Duration::from_millis(100))]
    pub retry_base_delay: Duration,
}

/// The remote cache store tier.
///
/// Cheaply cloneable; clones share the HTTP connection pool and the
/// request permit pool.
#[derive(Clone, Debug)]
pub struct RemoteStore {
    config: RemoteConfig,
    http: reqwest::blocking::Client,
    permits: (flume::Sender<()>, flume::Receiver<()>),
}

impl RemoteStore {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| BuildError::network(format!("build http client: {err}")))?;

        let permits = flume::bounded(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            // Filling a freshly created bounded channel cannot fail.
            let _ = permits.0.send(());
        }

        Ok(Self {
            config,
            http,
            permits,
        })
    }

    fn artifact_url(&self, digest: &Digest) -> Result<Url> {
        self.config
            .base_url
            .join(&format!("artifacts/{}", digest.to_hex()))
            .map_err(|err| BuildError::network(format!("build artifact url: {err}")))
    }

    /// Block until a request slot frees up. The permit is returned to the
    /// pool on drop.
    fn acquire(&self) -> Result<Permit> {
        self.permits
            .1
            .recv()
            .map_err(|_| BuildError::internal("remote permit pool closed"))?;
        Ok(Permit {
            pool: self.permits.0.clone(),
        })
    }

    /// Run a request closure with bounded retries on transient failures.
    fn with_retries<T>(&self, op: &str, mut run: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = self.config.retry_base_delay;
        let mut last = None;
        for attempt in 1..=self.config.attempts.max(1) {
            match run() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.attempts => {
                    warn!(op, attempt, %err, "transient remote failure; backing off");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| BuildError::internal("retry loop exhausted without error")))
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn classify(status: StatusCode, op: &str) -> BuildError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                BuildError::new(BuildErrorKind::CacheUnauthorized)
            }
            StatusCode::NOT_FOUND => BuildError::new(BuildErrorKind::CacheNotFound),
            status => BuildError::network(format!("{op}: unexpected status {status}")),
        }
    }
}

impl ObjectStore for RemoteStore {
    #[instrument(skip(self, bytes))]
    fn put(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = hash_bytes(bytes);
        let url = self.artifact_url(&digest)?;
        let _permit = self.acquire()?;

        self.with_retries("put artifact", || {
            let response = self
                .authorize(self.http.put(url.clone()).body(bytes.to_vec()))
                .send()
                .map_err(|err| BuildError::network(&err).with_source(err))?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    trace!(%digest, bytes = bytes.len(), "uploaded artifact");
                    Ok(digest)
                }
                status => Err(Self::classify(status, "put artifact")),
            }
        })
    }

    #[instrument(skip(self))]
    fn get(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let url = self.artifact_url(digest)?;
        let _permit = self.acquire()?;

        let fetched = self.with_retries("get artifact", || {
            let response = self
                .authorize(self.http.get(url.clone()))
                .send()
                .map_err(|err| BuildError::network(&err).with_source(err))?;
            match response.status() {
                StatusCode::OK => {
                    let bytes = response
                        .bytes()
                        .map_err(|err| BuildError::network(format!("read body: {err}")))?;
                    Ok(Some(bytes.to_vec()))
                }
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::classify(status, "get artifact")),
            }
        })?;

        let Some(bytes) = fetched else {
            return Ok(None);
        };
        // The remote tier is untrusted: verify content-addressing before
        // handing bytes to anyone.
        if hash_bytes(&bytes) != *digest {
            return Err(BuildError::new(BuildErrorKind::CacheCorrupted {
                detail: format!("remote artifact {digest} failed digest verification"),
            }));
        }
        Ok(Some(bytes))
    }

    #[instrument(skip(self))]
    fn has(&self, digest: &Digest) -> Result<bool> {
        let url = self.artifact_url(digest)?;
        let _permit = self.acquire()?;

        self.with_retries("head artifact", || {
            let response = self
                .authorize(self.http.head(url.clone()))
                .send()
                .map_err(|err| BuildError::network(&err).with_source(err))?;
            match response.status() {
                StatusCode::OK => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                status => Err(Self::classify(status, "head artifact")),
            }
        })
    }

    #[instrument(skip(self))]
    fn delete(&self, digest: &Digest) -> Result<()> {
        let url = self.artifact_url(digest)?;
        let _permit = self.acquire()?;

        self.with_retries("delete artifact", || {
            let response = self
                .authorize(self.http.delete(url.clone()))
                .send()
                .map_err(|err| BuildError::network(&err).with_source(err))?;
            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
                status => Err(Self::classify(status, "delete artifact")),
            }
        })
    }
}

/// Permit from the bounded request pool; returns itself on drop.
struct Permit {
    pool: flume::Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.pool.send(());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn artifact_urls_are_hex_addressed() {
        let config = RemoteConfig::builder()
            .base_url(Url::parse("https://cache.example.com/").unwrap())
            .build();
        let store = RemoteStore::new(config).unwrap();
        let digest = hash_bytes(b"artifact");
        let url = store.artifact_url(&digest).unwrap();
        assert_eq!(
            url.as_str(),
            format!("https://cache.example.com/artifacts/{}", digest.to_hex()),
        );
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            RemoteStore::classify(StatusCode::UNAUTHORIZED, "get").kind(),
            BuildErrorKind::CacheUnauthorized,
        ));
        assert!(matches!(
            RemoteStore::classify(StatusCode::NOT_FOUND, "get").kind(),
            BuildErrorKind::CacheNotFound,
        ));
        assert!(matches!(
            RemoteStore::classify(StatusCode::INTERNAL_SERVER_ERROR, "get").kind(),
            BuildErrorKind::NetworkError { .. },
        ));
    }
}
