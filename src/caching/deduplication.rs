//! # Request Deduplication
//!
//! Collapses identical requests arriving within a short window into a single
//! upstream call. The first caller for a key spawns the fetch; every caller in
//! the window awaits a clone of the same `Shared` future and observes the same
//! value or error.
//!
//! ## Entry lifecycle
//! - Lives until the wall-clock window closes, so staggered arrivals in a burst
//!   still share one call.
//! - A fetch that outlives the window keeps its entry until it resolves; there
//!   is never more than one in-flight call per key.
//! - A failed fetch removes its entry as soon as the failure resolves, so the
//!   next caller retries instead of replaying a known failure.
//!
//! The fetch runs in its own task. A caller that goes away (client disconnect)
//! drops only its clone of the shared future; the call runs to completion and
//! still populates the cache for whoever comes next.
//!
//! [`DedupClaim`] extends this across instances through an atomic
//! set-if-absent on a distributed backend. It is best-effort: duplicate reads
//! upstream are only wasteful, never incorrect.

use super::stores::KvBackend;
use crate::core::error::{ProxyError, ProxyResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

type SharedOutcome<T> = Shared<BoxFuture<'static, ProxyResult<T>>>;

struct DedupEntry<T: Clone> {
    generation: u64,
    window_expires_at: Instant,
    outcome: SharedOutcome<T>,
}

impl<T: Clone> DedupEntry<T> {
    /// Joinable while the window is open or the fetch is still running,
    /// but never once it has failed
    fn is_joinable(&self, now: Instant) -> bool {
        match self.outcome.peek() {
            None => true,
            Some(Err(_)) => false,
            Some(Ok(_)) => now < self.window_expires_at,
        }
    }
}

/// Outcome of a deduplicated call
#[derive(Debug, Clone)]
pub struct Deduplicated<T> {
    pub result: ProxyResult<T>,

    /// `true` when this caller joined a call started by another
    pub shared: bool,
}

/// Per-process request deduplicator
pub struct RequestDeduplicator<T: Clone> {
    entries: Arc<DashMap<String, DedupEntry<T>>>,
    next_generation: AtomicU64,
    fetches: AtomicU64,
    joins: AtomicU64,
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    /// Run `perform_fetch` once per key and window, sharing its outcome
    pub async fn deduplicate<F, Fut>(
        &self,
        key: &str,
        window: Duration,
        perform_fetch: F,
    ) -> Deduplicated<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<T>> + Send + 'static,
    {
        let now = Instant::now();

        let (outcome, shared) = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_joinable(now) => {
                (occupied.get().outcome.clone(), true)
            }
            Entry::Occupied(mut occupied) => {
                let entry = self.start(key, now, window, perform_fetch);
                let outcome = entry.outcome.clone();
                occupied.insert(entry);
                (outcome, false)
            }
            Entry::Vacant(vacant) => {
                let entry = self.start(key, now, window, perform_fetch);
                let outcome = entry.outcome.clone();
                vacant.insert(entry);
                (outcome, false)
            }
        };

        if shared {
            self.joins.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Joined in-flight request");
        }

        Deduplicated {
            result: outcome.await,
            shared,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upstream fetches started and callers that joined one
    pub fn counts(&self) -> (u64, u64) {
        (
            self.fetches.load(Ordering::Relaxed),
            self.joins.load(Ordering::Relaxed),
        )
    }

    fn start<F, Fut>(
        &self,
        key: &str,
        now: Instant,
        window: Duration,
        perform_fetch: F,
    ) -> DedupEntry<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<T>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let window_expires_at = now + window;
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(perform_fetch());
        let outcome: SharedOutcome<T> = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(ProxyError::internal(format!("upstream fetch task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        let entries = Arc::clone(&self.entries);
        let watched = outcome.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let failed = watched.await.is_err();
            if !failed {
                tokio::time::sleep_until(window_expires_at).await;
            }
            // Only remove the entry this task was created for
            entries.remove_if(&key, |_, entry| entry.generation == generation);
            if failed {
                debug!(key = %key, "Dropped failed dedup entry early");
            }
        });

        DedupEntry {
            generation,
            window_expires_at,
            outcome,
        }
    }
}

/// Cross-instance claim on a dedup key
pub struct DedupClaim {
    backend: Arc<dyn KvBackend>,
}

impl DedupClaim {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    fn claim_key(key: &str) -> String {
        format!("dedup-claim:{}", key)
    }

    /// Try to become the instance that fetches `key` during `window`
    ///
    /// Returns `true` when this instance should fetch: it won the claim, the
    /// backend is process-local, or the backend could not be reached.
    pub async fn try_claim(&self, key: &str, window: Duration) -> bool {
        if !self.backend.kind().is_distributed() {
            return true;
        }

        let claim_key = Self::claim_key(key);
        match self
            .backend
            .set_if_absent(&claim_key, b"1", window.max(Duration::from_millis(1)))
            .await
        {
            Ok(won) => {
                if !won {
                    debug!(key = %key, "Another instance holds the dedup claim");
                }
                won
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Dedup claim failed, fetching anyway");
                true
            }
        }
    }
}
