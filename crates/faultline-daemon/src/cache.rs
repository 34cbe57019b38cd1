//! Shared-state cache for the safety fabric.
//!
//! Rate-limiter windows and breaker snapshots must be visible across
//! daemon instances. This module defines the [`SharedStateCache`] trait
//! abstracting those distributed primitives, plus the in-memory
//! implementation used by single-instance deployments and tests.
//!
//! # Async Pattern
//!
//! All trait methods return `BoxFuture` to support async execution while
//! maintaining object safety, so components hold `Arc<dyn SharedStateCache>`
//! and backends are swappable.
//!
//! # Degraded mode
//!
//! Implementations surface unavailability as [`CacheError::Unavailable`];
//! the *call sites* decide the bias. Breaker checks fail closed (treat the
//! vendor as `Open`), rate-limit checks fail open (admit) with a recorded
//! degraded-mode flag. That split protects vendors while keeping ingest
//! available.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use faultline_core::breaker::BreakerSnapshot;
use faultline_core::classifier::BoxFuture;
use faultline_core::ratelimit::{RateDecision, SlidingWindow};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Maximum number of distinct window keys tracked in memory.
pub const MAX_WINDOW_KEYS: usize = 100_000;

/// Cache backend errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// The backend is unreachable or refused the operation.
    #[error("cache unavailable: {message}")]
    Unavailable {
        /// Backend-reported detail.
        message: String,
    },
}

/// Distributed counters and breaker state, shared across instances.
pub trait SharedStateCache: Send + Sync {
    /// Atomically checks and, if admitted, records a request under `key`
    /// for a sliding window.
    fn admit_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> BoxFuture<'a, Result<RateDecision, CacheError>>;

    /// Records an occurrence under `key` without an admission check
    /// (budget counters).
    fn record_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Counts occurrences under `key` within the trailing window.
    fn count_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'a, Result<u64, CacheError>>;

    /// Loads the breaker snapshot for a vendor, if one is cached.
    fn load_breaker<'a>(
        &'a self,
        vendor: &'a str,
    ) -> BoxFuture<'a, Result<Option<BreakerSnapshot>, CacheError>>;

    /// Stores the breaker snapshot for a vendor.
    fn store_breaker<'a>(
        &'a self,
        vendor: &'a str,
        snapshot: BreakerSnapshot,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

// =============================================================================
// InMemoryCache
// =============================================================================

/// Process-local cache implementation.
///
/// Correct for a single instance; multi-instance deployments swap in a
/// backend with the same atomicity guarantees. Window maps are bounded by
/// [`MAX_WINDOW_KEYS`]; empty windows are dropped opportunistically.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    windows: RwLock<HashMap<String, SlidingWindow>>,
    breakers: RwLock<HashMap<String, BreakerSnapshot>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_window<T>(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        op: impl FnOnce(&mut SlidingWindow) -> T,
    ) -> T {
        let mut windows = self.windows.write().await;
        if windows.len() >= MAX_WINDOW_KEYS && !windows.contains_key(key) {
            // drop windows with nothing left in them before admitting a new key
            windows.retain(|_, win| win.count(now, window) > 0);
        }
        let win = windows.entry(key.to_string()).or_default();
        let out = op(win);
        if win.is_empty() {
            windows.remove(key);
        }
        out
    }
}

impl SharedStateCache for InMemoryCache {
    fn admit_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> BoxFuture<'a, Result<RateDecision, CacheError>> {
        Box::pin(async move {
            let decision = self
                .with_window(key, now, window, |win| win.admit(now, window, limit))
                .await;
            trace!(key = %key, allowed = decision.allowed, "window admission");
            Ok(decision)
        })
    }

    fn record_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.with_window(key, now, window, |win| win.record(now, window))
                .await;
            Ok(())
        })
    }

    fn count_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'a, Result<u64, CacheError>> {
        Box::pin(async move {
            let count = self
                .with_window(key, now, window, |win| win.count(now, window))
                .await;
            Ok(count)
        })
    }

    fn load_breaker<'a>(
        &'a self,
        vendor: &'a str,
    ) -> BoxFuture<'a, Result<Option<BreakerSnapshot>, CacheError>> {
        Box::pin(async move { Ok(self.breakers.read().await.get(vendor).cloned()) })
    }

    fn store_breaker<'a>(
        &'a self,
        vendor: &'a str,
        snapshot: BreakerSnapshot,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.breakers
                .write()
                .await
                .insert(vendor.to_string(), snapshot);
            Ok(())
        })
    }
}

// =============================================================================
// FlakyCache (test support)
// =============================================================================

/// Wrapper that can be switched into an unavailable state, for exercising
/// degraded-mode behavior in tests.
#[derive(Debug)]
pub struct FlakyCache<C> {
    inner: C,
    unavailable: std::sync::atomic::AtomicBool,
}

impl<C> FlakyCache<C> {
    /// Wraps a working cache.
    #[must_use]
    pub const fn new(inner: C) -> Self {
        Self {
            inner,
            unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Switches availability.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                message: "cache marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl<C: SharedStateCache> SharedStateCache for FlakyCache<C> {
    fn admit_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> BoxFuture<'a, Result<RateDecision, CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.inner.admit_window(key, now, window, limit).await
        })
    }

    fn record_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.inner.record_window(key, now, window).await
        })
    }

    fn count_window<'a>(
        &'a self,
        key: &'a str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> BoxFuture<'a, Result<u64, CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.inner.count_window(key, now, window).await
        })
    }

    fn load_breaker<'a>(
        &'a self,
        vendor: &'a str,
    ) -> BoxFuture<'a, Result<Option<BreakerSnapshot>, CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.inner.load_breaker(vendor).await
        })
    }

    fn store_breaker<'a>(
        &'a self,
        vendor: &'a str,
        snapshot: BreakerSnapshot,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check()?;
            self.inner.store_breaker(vendor, snapshot).await
        })
    }
}
