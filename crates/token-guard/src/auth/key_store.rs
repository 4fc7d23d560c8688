//! Cached signing key set with refresh-on-miss.
//!
//! The store holds one immutable snapshot of the identity provider's key set.
//! Lookups read the snapshot without locking. A lookup that cannot be answered
//! (no snapshot yet, snapshot past its TTL, or unknown `kid`) triggers a
//! refresh, which is:
//!
//! - single-flight: one fetch at a time; callers that queued behind a refresh
//!   reuse its outcome instead of fetching again
//! - rate limited: every real fetch takes a permit from [`FetchRateLimiter`];
//!   when none is left the lookup fails with `RateLimited` without waiting
//!
//! A failed refresh never clears the current snapshot.

use crate::auth::jwks::{KeySource, SigningKey};
use crate::auth::rate_limit::FetchRateLimiter;
use crate::errors::KeyStoreError;
use crate::observability::metrics::{record_jwks_cache, record_jwks_rate_limited};
use arc_swap::ArcSwapOption;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

/// Key store tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStoreConfig {
    /// How long a fetched key set is trusted. `None` keeps it until a lookup
    /// for an unknown `kid` forces a re-check.
    pub cache_ttl: Option<Duration>,

    /// Answer from an expired snapshot when its refresh fails.
    pub serve_stale_on_error: bool,
}

/// One fetched key set. Replaced wholesale, never mutated.
#[derive(Debug)]
struct KeySetSnapshot {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Instant,
    expires_at: Option<Instant>,
}

impl KeySetSnapshot {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Refresh bookkeeping, guarded by the single-flight lock.
#[derive(Debug)]
struct RefreshState {
    /// Epoch of the last finished refresh attempt.
    completed: u64,
    /// Outcome of that attempt, handed to callers that waited on it.
    last_outcome: Result<(), KeyStoreError>,
}

/// Shared cache of signing keys for one JWKS endpoint.
///
/// Construct once and share through `Arc`.
pub struct KeyStore {
    source: Arc<dyn KeySource>,
    limiter: FetchRateLimiter,
    config: KeyStoreConfig,
    snapshot: ArcSwapOption<KeySetSnapshot>,
    /// Mirrors `RefreshState::completed`; read before the snapshot so a
    /// caller can tell whether a refresh finished after it looked.
    refresh_epoch: AtomicU64,
    refresh: Mutex<RefreshState>,
}

impl KeyStore {
    pub fn new(
        source: Arc<dyn KeySource>,
        limiter: FetchRateLimiter,
        config: KeyStoreConfig,
    ) -> Self {
        Self {
            source,
            limiter,
            config,
            snapshot: ArcSwapOption::empty(),
            refresh_epoch: AtomicU64::new(0),
            refresh: Mutex::new(RefreshState {
                completed: 0,
                last_outcome: Ok(()),
            }),
        }
    }

    pub fn config(&self) -> &KeyStoreConfig {
        &self.config
    }

    /// JWKS URL behind this store, when the source is URL-backed.
    ///
    /// A store serves exactly one endpoint; policies naming another one are
    /// refused by the verifier.
    pub fn jwks_endpoint(&self) -> Option<&Url> {
        self.source.endpoint()
    }

    /// Resolve a signing key by `kid`.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if the key is absent after a refresh
    /// - `RateLimited` if a refresh was needed but the fetch budget is spent
    /// - `FetchFailed` if the refresh could not fetch the key set
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn get_key(&self, kid: &str) -> Result<Arc<SigningKey>, KeyStoreError> {
        let observed = self.refresh_epoch.load(Ordering::Acquire);
        let current = self.snapshot.load_full();

        if let Some(snapshot) = current.as_deref() {
            if snapshot.is_fresh(Instant::now()) {
                if let Some(key) = snapshot.keys.get(kid) {
                    tracing::debug!(target: "tg.auth.key_store", kid = %kid, "JWKS cache hit");
                    record_jwks_cache("hit");
                    return Ok(Arc::clone(key));
                }
                tracing::debug!(target: "tg.auth.key_store", kid = %kid, "Key not in cached JWKS");
            } else {
                tracing::debug!(target: "tg.auth.key_store", "Cached JWKS expired");
            }
        }
        record_jwks_cache("miss");

        if let Err(err) = self.refresh_after(observed).await {
            return self.stale_or(current.as_deref(), kid, err);
        }

        let refreshed = self.snapshot.load();
        match refreshed.as_deref().and_then(|s| s.keys.get(kid)) {
            Some(key) => Ok(Arc::clone(key)),
            None => {
                tracing::warn!(target: "tg.auth.key_store", kid = %kid, "Key not found in JWKS after refresh");
                Err(KeyStoreError::KeyNotFound)
            }
        }
    }

    /// Fetch the key set now, ignoring the cached snapshot.
    ///
    /// Still subject to the fetch rate limiter. Returns the number of keys
    /// in the new snapshot.
    ///
    /// # Errors
    ///
    /// `RateLimited` or `FetchFailed`; the previous snapshot is kept.
    #[instrument(skip(self))]
    pub async fn force_refresh(&self) -> Result<usize, KeyStoreError> {
        let mut state = self.refresh.lock().await;
        self.refresh_locked(&mut state).await?;
        Ok(self.snapshot.load().as_deref().map_or(0, |s| s.keys.len()))
    }

    /// Key ids in the current snapshot, sorted. Empty before the first fetch.
    pub fn cached_key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .snapshot
            .load()
            .as_deref()
            .map(|s| s.keys.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// When the current snapshot was fetched.
    pub fn last_fetched_at(&self) -> Option<Instant> {
        self.snapshot.load().as_deref().map(|s| s.fetched_at)
    }

    /// Refresh unless another caller already finished one after `observed`.
    async fn refresh_after(&self, observed: u64) -> Result<(), KeyStoreError> {
        let mut state = self.refresh.lock().await;

        if state.completed != observed {
            tracing::debug!(
                target: "tg.auth.key_store",
                epoch = state.completed,
                "Reusing outcome of concurrent JWKS refresh"
            );
            return state.last_outcome.clone();
        }

        self.refresh_locked(&mut state).await
    }

    /// Perform one refresh attempt. Caller holds the refresh lock.
    async fn refresh_locked(&self, state: &mut RefreshState) -> Result<(), KeyStoreError> {
        let outcome = self.fetch_and_swap().await;

        state.completed = state.completed.wrapping_add(1);
        state.last_outcome = outcome.clone();
        self.refresh_epoch.store(state.completed, Ordering::Release);

        outcome
    }

    async fn fetch_and_swap(&self) -> Result<(), KeyStoreError> {
        if !self.limiter.try_acquire() {
            tracing::warn!(
                target: "tg.auth.key_store",
                source = %self.source.describe(),
                "JWKS refresh rate limited"
            );
            record_jwks_rate_limited();
            return Err(KeyStoreError::RateLimited);
        }

        let keys = self.source.fetch().await.map_err(|e| {
            tracing::error!(
                target: "tg.auth.key_store",
                source = %self.source.describe(),
                error = %e,
                "JWKS refresh failed"
            );
            KeyStoreError::FetchFailed(e)
        })?;

        let fetched_at = Instant::now();
        let expires_at = self
            .config
            .cache_ttl
            .and_then(|ttl| fetched_at.checked_add(ttl));

        let mut by_kid = HashMap::with_capacity(keys.len());
        for key in keys {
            if by_kid.contains_key(key.key_id()) {
                tracing::warn!(target: "tg.auth.key_store", kid = %key.key_id(), "Duplicate kid in JWKS, keeping first");
                continue;
            }
            by_kid.insert(key.key_id().to_string(), Arc::new(key));
        }

        tracing::info!(
            target: "tg.auth.key_store",
            key_count = by_kid.len(),
            "JWKS cache refreshed"
        );

        self.snapshot.store(Some(Arc::new(KeySetSnapshot {
            keys: by_kid,
            fetched_at,
            expires_at,
        })));

        Ok(())
    }

    /// On refresh failure, fall back to an expired snapshot when allowed.
    fn stale_or(
        &self,
        stale: Option<&KeySetSnapshot>,
        kid: &str,
        err: KeyStoreError,
    ) -> Result<Arc<SigningKey>, KeyStoreError> {
        if self.config.serve_stale_on_error {
            if let Some(key) = stale.and_then(|s| s.keys.get(kid)) {
                tracing::warn!(
                    target: "tg.auth.key_store",
                    kid = %kid,
                    error = %err,
                    "Serving key from expired JWKS after failed refresh"
                );
                return Ok(Arc::clone(key));
            }
        }
        Err(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::jwks::Jwk;
    use crate::errors::FetchError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    // RFC 7517 appendix A.1 example RSA modulus.
    const RSA_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    fn key(kid: &str) -> SigningKey {
        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "RSA", "kid": kid, "alg": "RS256", "use": "sig", "n": RSA_N, "e": "AQAB"
        }))
        .unwrap();
        SigningKey::from_jwk(&jwk).unwrap()
    }

    /// In-memory key source that counts fetches and can be re-pointed.
    struct MockSource {
        kids: std::sync::Mutex<Vec<&'static str>>,
        fail: std::sync::atomic::AtomicBool,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl MockSource {
        fn new(kids: &[&'static str]) -> Arc<Self> {
            Self::with_delay(kids, Duration::ZERO)
        }

        fn with_delay(kids: &[&'static str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kids: std::sync::Mutex::new(kids.to_vec()),
                fail: std::sync::atomic::AtomicBool::new(false),
                fetches: AtomicUsize::new(0),
                delay,
            })
        }

        fn set_kids(&self, kids: &[&'static str]) {
            *self.kids.lock().unwrap() = kids.to_vec();
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySource for MockSource {
        async fn fetch(&self) -> Result<Vec<SigningKey>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Network("connection refused".to_string()));
            }
            let kids = self.kids.lock().unwrap().clone();
            Ok(kids.into_iter().map(key).collect())
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    fn store(source: &Arc<MockSource>, config: KeyStoreConfig) -> KeyStore {
        KeyStore::new(source.clone(), FetchRateLimiter::default(), config)
    }

    #[tokio::test]
    async fn test_first_lookup_fetches_then_hits_cache() {
        let source = MockSource::new(&["abc"]);
        let store = store(&source, KeyStoreConfig::default());

        assert!(store.cached_key_ids().is_empty());
        assert!(store.last_fetched_at().is_none());

        for _ in 0..10 {
            let key = store.get_key("abc").await.unwrap();
            assert_eq!(key.key_id(), "abc");
        }

        assert_eq!(source.fetches(), 1);
        assert_eq!(store.cached_key_ids(), vec!["abc".to_string()]);
        assert!(store.last_fetched_at().is_some());
    }

    #[tokio::test]
    async fn test_unknown_kid_refreshes_once_then_not_found() {
        let source = MockSource::new(&["abc"]);
        let store = store(&source, KeyStoreConfig::default());

        store.get_key("abc").await.unwrap();
        let result = store.get_key("zzz").await;

        assert_eq!(result.unwrap_err(), KeyStoreError::KeyNotFound);
        assert_eq!(source.fetches(), 2, "exactly one refresh for the unknown kid");
    }

    #[tokio::test]
    async fn test_rotation_picked_up_on_miss() {
        let source = MockSource::new(&["old"]);
        let store = store(&source, KeyStoreConfig::default());

        store.get_key("old").await.unwrap();
        source.set_kids(&["new"]);

        assert_eq!(store.get_key("new").await.unwrap().key_id(), "new");
        assert_eq!(store.cached_key_ids(), vec!["new".to_string()]);
        assert_eq!(
            store.get_key("old").await.unwrap_err(),
            KeyStoreError::KeyNotFound
        );
    }

    #[tokio::test]
    async fn test_distinct_unknown_kids_exhaust_fetch_budget() {
        let source = MockSource::new(&["abc"]);
        let store = KeyStore::new(
            source.clone(),
            FetchRateLimiter::per_minute(3),
            KeyStoreConfig::default(),
        );

        for kid in ["u1", "u2", "u3"] {
            assert_eq!(
                store.get_key(kid).await.unwrap_err(),
                KeyStoreError::KeyNotFound
            );
        }
        assert_eq!(
            store.get_key("u4").await.unwrap_err(),
            KeyStoreError::RateLimited
        );
        assert_eq!(source.fetches(), 3);

        // Cached keys are still served while limited
        assert!(store.get_key("abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let source = MockSource::with_delay(&["abc"], Duration::from_millis(50));
        let store = Arc::new(store(&source, KeyStoreConfig::default()));

        let lookups = (0..100).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.get_key("abc").await })
        });

        for handle in futures::future::join_all(lookups).await {
            assert_eq!(handle.unwrap().unwrap().key_id(), "abc");
        }
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_unknown_kid_misses_share_one_fetch() {
        let source = MockSource::with_delay(&["abc"], Duration::from_millis(50));
        let store = Arc::new(store(&source, KeyStoreConfig::default()));
        store.get_key("abc").await.unwrap();

        let lookups = (0..100).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.get_key("missing").await })
        });

        for handle in futures::future::join_all(lookups).await {
            assert_eq!(handle.unwrap().unwrap_err(), KeyStoreError::KeyNotFound);
        }
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_and_keeps_snapshot() {
        let source = MockSource::new(&["abc"]);
        let store = store(&source, KeyStoreConfig::default());
        store.get_key("abc").await.unwrap();

        source.set_failing(true);
        assert!(matches!(
            store.get_key("other").await,
            Err(KeyStoreError::FetchFailed(FetchError::Network(_)))
        ));

        assert_eq!(store.cached_key_ids(), vec!["abc".to_string()]);
        assert!(store.get_key("abc").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_forces_refresh() {
        let source = MockSource::new(&["abc"]);
        let store = store(
            &source,
            KeyStoreConfig {
                cache_ttl: Some(Duration::from_secs(300)),
                serve_stale_on_error: false,
            },
        );

        store.get_key("abc").await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        store.get_key("abc").await.unwrap();
        assert_eq!(source.fetches(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        store.get_key("abc").await.unwrap();
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_snapshot_not_served_when_refresh_fails() {
        let source = MockSource::new(&["abc"]);
        let store = store(
            &source,
            KeyStoreConfig {
                cache_ttl: Some(Duration::from_secs(60)),
                serve_stale_on_error: false,
            },
        );
        store.get_key("abc").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        source.set_failing(true);

        assert!(matches!(
            store.get_key("abc").await,
            Err(KeyStoreError::FetchFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_stale_on_error_opt_in() {
        let source = MockSource::new(&["abc"]);
        let store = store(
            &source,
            KeyStoreConfig {
                cache_ttl: Some(Duration::from_secs(60)),
                serve_stale_on_error: true,
            },
        );
        store.get_key("abc").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        source.set_failing(true);

        assert_eq!(store.get_key("abc").await.unwrap().key_id(), "abc");
        assert!(matches!(
            store.get_key("zzz").await,
            Err(KeyStoreError::FetchFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_force_refresh() {
        let source = MockSource::new(&["a", "b"]);
        let store = store(&source, KeyStoreConfig::default());

        assert_eq!(store.force_refresh().await.unwrap(), 2);
        assert_eq!(
            store.cached_key_ids(),
            vec!["a".to_string(), "b".to_string()]
        );

        source.set_failing(true);
        assert!(store.force_refresh().await.is_err());
        assert_eq!(store.cached_key_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_kids_keep_first() {
        let source = MockSource::new(&["dup", "dup"]);
        let store = store(&source, KeyStoreConfig::default());

        assert_eq!(store.force_refresh().await.unwrap(), 1);
    }
}
