//! Single-flight token cache shared across a run's workers.
//!
//! Guarantees, regardless of request concurrency:
//! - at most one in-flight STS request per (insurer, account) key — racing
//!   workers park on the key's flight lock and reuse the fresh result;
//! - a token within the refresh margin of expiry is never handed out.
//!
//! The fast path is a sync mutex read on the cached slot; the slow path
//! takes the per-key async flight lock, re-checks under it (double-checked
//! pattern) and only then talks to the STS.

use crate::config::{TOKEN_ISSUE_RETRIES, TOKEN_ISSUE_RETRY_DELAYS};
use crate::error::FetchError;
use crate::token::credential::Credential;
use crate::token::token::{SecurityToken, TokenKey};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// The operation that actually talks to the STS. Implemented by the
/// protocol connector; mocked in tests.
pub trait TokenIssuer: Send + Sync {
    fn request_token(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<SecurityToken, FetchError>> + Send;
}

/// Per-key cache slot. `cached` is read on the fast path without awaiting;
/// `flight` serialises issuance so duplicates never reach the STS.
#[derive(Default)]
struct Entry {
    cached: StdMutex<Option<SecurityToken>>,
    flight: AsyncMutex<()>,
}

/// Token cache for one run. Create once, share via `Arc` with every worker.
pub struct TokenStore<I> {
    issuer: Arc<I>,
    refresh_margin: Duration,
    entries: RwLock<HashMap<TokenKey, Arc<Entry>>>,
}

impl<I: TokenIssuer> TokenStore<I> {
    pub fn new(issuer: Arc<I>, refresh_margin: Duration) -> Self {
        Self {
            issuer,
            refresh_margin,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return a token for the credential's key, issuing a fresh one if the
    /// cache is empty or the cached token is inside the refresh margin.
    ///
    /// Errors surface as [`FetchError::Auth`] once issuance retries are
    /// exhausted; the caller treats that as fatal for the run.
    pub async fn get_token(&self, credential: &Credential) -> Result<SecurityToken, FetchError> {
        let key = TokenKey::new(credential.insurer.clone(), credential.username.clone());
        let entry = self.entry(&key);

        // Fast path: no flight lock needed for a fresh cached token.
        if let Some(token) = self.fresh_cached(&entry) {
            return Ok(token);
        }

        // Slow path: serialise issuance per key.
        let _flight = entry.flight.lock().await;

        // Re-check under the lock; a racing worker may have refreshed the
        // slot while we were parked.
        if let Some(token) = self.fresh_cached(&entry) {
            debug!(insurer = %key.insurer, "token refreshed by concurrent worker");
            return Ok(token);
        }

        let token = self.issue_with_retries(credential).await?;
        info!(
            insurer = %key.insurer,
            expires_at = %token.expires_at,
            "security token issued"
        );

        if let Ok(mut slot) = entry.cached.lock() {
            *slot = Some(token.clone());
        }
        Ok(token)
    }

    /// Drop the cached token for a key, forcing re-issuance on next use.
    /// Called when a server rejects a token mid-run.
    pub fn invalidate(&self, key: &TokenKey) {
        if let Ok(map) = self.entries.read() {
            if let Some(entry) = map.get(key) {
                if let Ok(mut slot) = entry.cached.lock() {
                    *slot = None;
                }
            }
        }
        debug!(insurer = %key.insurer, "token invalidated");
    }

    fn entry(&self, key: &TokenKey) -> Arc<Entry> {
        if let Ok(map) = self.entries.read() {
            if let Some(entry) = map.get(key) {
                return Arc::clone(entry);
            }
        }
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key.clone()).or_default())
    }

    fn fresh_cached(&self, entry: &Entry) -> Option<SecurityToken> {
        let slot = entry.cached.lock().ok()?;
        match slot.as_ref() {
            Some(token) if !token.expires_within(self.refresh_margin) => Some(token.clone()),
            _ => None,
        }
    }

    /// Issue a token, retrying transient transport failures a few times
    /// before escalating to a run-fatal auth error.
    async fn issue_with_retries(
        &self,
        credential: &Credential,
    ) -> Result<SecurityToken, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.issuer.request_token(credential).await {
                Ok(token) => return Ok(token),
                Err(err) if err.is_retryable() && attempt < TOKEN_ISSUE_RETRIES => {
                    let delay = TOKEN_ISSUE_RETRY_DELAYS
                        [(attempt as usize).min(TOKEN_ISSUE_RETRY_DELAYS.len() - 1)];
                    warn!(
                        insurer = %credential.insurer,
                        attempt,
                        delay_secs = delay,
                        error = %err,
                        "token request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(FetchError::Auth { insurer, detail }) => {
                    return Err(FetchError::Auth { insurer, detail });
                }
                Err(err) => {
                    return Err(FetchError::Auth {
                        insurer: credential.insurer.clone(),
                        detail: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InsurerId, TransportKind};
    use crate::token::credential::AuthKind;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credential() -> Credential {
        Credential {
            insurer: InsurerId::from("degenia"),
            auth_kind: AuthKind::UsernamePassword,
            username: "broker-1".into(),
            secret: "pw".into(),
            cert_ref: None,
        }
    }

    fn token_living(secs: i64, serial: usize) -> SecurityToken {
        let now = Utc::now();
        SecurityToken {
            value: format!("tok-{serial}"),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(secs),
            key: TokenKey::new(InsurerId::from("degenia"), "broker-1"),
        }
    }

    /// Issuer that counts calls and simulates STS latency, so concurrent
    /// callers genuinely overlap.
    struct CountingIssuer {
        calls: AtomicUsize,
        /// Lifetime (seconds) of the token returned on the n-th call.
        lifetimes: Vec<i64>,
    }

    impl CountingIssuer {
        fn new(lifetimes: Vec<i64>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                lifetimes,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenIssuer for CountingIssuer {
        async fn request_token(&self, _: &Credential) -> Result<SecurityToken, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            let secs = *self.lifetimes.get(n).unwrap_or(&1800);
            Ok(token_living(secs, n))
        }
    }

    struct FlakyIssuer {
        calls: AtomicUsize,
        failures: usize,
    }

    impl TokenIssuer for FlakyIssuer {
        async fn request_token(&self, cred: &Credential) -> Result<SecurityToken, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(FetchError::Transport {
                    insurer: cred.insurer.clone(),
                    kind: TransportKind::Timeout,
                    detail: "read timed out".into(),
                });
            }
            Ok(token_living(1800, n))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_under_concurrency() {
        let issuer = Arc::new(CountingIssuer::new(vec![1800]));
        let store = Arc::new(TokenStore::new(
            Arc::clone(&issuer),
            Duration::from_secs(120),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_token(&credential()).await.unwrap().value
            }));
        }

        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap());
        }

        // Exactly one STS round-trip; every caller saw the same token.
        assert_eq!(issuer.calls(), 1);
        assert!(values.iter().all(|v| v == &values[0]));
    }

    #[tokio::test]
    async fn test_fresh_token_is_cached() {
        let issuer = Arc::new(CountingIssuer::new(vec![1800]));
        let store = TokenStore::new(Arc::clone(&issuer), Duration::from_secs(120));

        let first = store.get_token(&credential()).await.unwrap();
        let second = store.get_token(&credential()).await.unwrap();
        assert_eq!(issuer.calls(), 1);
        assert_eq!(first.value, second.value);
    }

    #[tokio::test]
    async fn test_token_in_margin_is_refreshed() {
        // First token lives 60s, inside the 120s margin: the second call
        // must fetch a fresh one rather than hand out the stale token.
        let issuer = Arc::new(CountingIssuer::new(vec![60, 1800]));
        let store = TokenStore::new(Arc::clone(&issuer), Duration::from_secs(120));

        let first = store.get_token(&credential()).await.unwrap();
        let second = store.get_token(&credential()).await.unwrap();
        assert_eq!(issuer.calls(), 2);
        assert_ne!(first.value, second.value);
        assert!(!second.expires_within(Duration::from_secs(120)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_transport_failures_are_retried() {
        let issuer = Arc::new(FlakyIssuer {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let store = TokenStore::new(Arc::clone(&issuer), Duration::from_secs(120));

        let token = store.get_token(&credential()).await.unwrap();
        assert_eq!(token.value, "tok-2");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_become_auth_error() {
        let issuer = Arc::new(FlakyIssuer {
            calls: AtomicUsize::new(0),
            failures: 99,
        });
        let store = TokenStore::new(issuer, Duration::from_secs(120));

        let err = store.get_token(&credential()).await.unwrap_err();
        assert!(err.is_run_fatal());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reissue() {
        let issuer = Arc::new(CountingIssuer::new(vec![1800, 1800]));
        let store = TokenStore::new(Arc::clone(&issuer), Duration::from_secs(120));

        let first = store.get_token(&credential()).await.unwrap();
        store.invalidate(&first.key);
        let second = store.get_token(&credential()).await.unwrap();
        assert_eq!(issuer.calls(), 2);
        assert_ne!(first.value, second.value);
    }
}
