use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Refresh this far before the server-declared expiry.
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Timeout for the token endpoint request.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Response from the client-credentials grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Lifetime in seconds, as declared by the server.
    pub expires_in: u64,
}

/// The client-credentials endpoint, behind a trait so the cache is
/// testable without a live platform.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn fetch(&self) -> Result<TokenResponse>;
}

/// Production endpoint: POSTs the client-credentials grant over HTTPS.
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenEndpoint {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn fetch(&self) -> Result<TokenResponse> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .timeout(TOKEN_TIMEOUT)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Auth(format!("invalid token response: {e}")))
    }
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Caches the short-lived access credential and refreshes it before
/// expiry. The refresh happens while holding the cache lock, so
/// concurrent callers during a refresh collapse into one request
/// instead of racing.
pub struct TokenCache {
    endpoint: Box<dyn TokenEndpoint>,
    state: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(endpoint: Box<dyn TokenEndpoint>) -> Self {
        Self {
            endpoint,
            state: Mutex::new(None),
        }
    }

    /// The cached token if it has more than the safety margin left,
    /// otherwise a freshly fetched one. Never returns a stale token on
    /// endpoint failure.
    pub async fn token(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.as_ref() {
            let remaining = cached.expires_at - Utc::now();
            if remaining.num_seconds() > REFRESH_MARGIN_SECS {
                return Ok(cached.token.clone());
            }
        }

        let response = self.endpoint.fetch().await?;
        let expires_at = Utc::now() + chrono::Duration::seconds(response.expires_in as i64);
        log::debug!(
            "refreshed access token, valid for {}s",
            response.expires_in
        );
        *state = Some(CachedToken {
            token: response.access_token.clone(),
            expires_at,
        });
        Ok(response.access_token)
    }

    /// Drop the cached token so the next call fetches a fresh one.
    /// Used by the API client when the platform rejects the token.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingEndpoint {
        calls: Arc<AtomicU32>,
        expires_in: u64,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn fetch(&self) -> Result<TokenResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TokenResponse {
                access_token: format!("token-{n}"),
                expires_in: self.expires_in,
            })
        }
    }

    struct FailingEndpoint;

    #[async_trait]
    impl TokenEndpoint for FailingEndpoint {
        async fn fetch(&self) -> Result<TokenResponse> {
            Err(Error::Auth("token endpoint returned 500".into()))
        }
    }

    fn counting_cache(expires_in: u64) -> (TokenCache, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let cache = TokenCache::new(Box::new(CountingEndpoint {
            calls: calls.clone(),
            expires_in,
        }));
        (cache, calls)
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let (cache, calls) = counting_cache(3600);
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_within_safety_margin() {
        // 60s lifetime is inside the 5-minute margin, so every call refreshes.
        let (cache, calls) = counting_cache(60);
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(cache.token().await.unwrap(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let (cache, calls) = counting_cache(3600);
        cache.token().await.unwrap();
        cache.invalidate().await;
        assert_eq!(cache.token().await.unwrap(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_single_flight() {
        let (cache, calls) = counting_cache(3600);
        let cache = Arc::new(cache);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_endpoint_failure_surfaces_auth_error() {
        let cache = TokenCache::new(Box::new(FailingEndpoint));
        let err = cache.token().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
