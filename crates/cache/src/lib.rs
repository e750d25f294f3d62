//! Tunnelboard cache: keyed store of server-fetched resources plus the
//! mutation pipeline that invalidates it.
//!
//! Each query key owns one slot holding the last-known value, freshness
//! stamp and in-flight fetch state. Subscribers get a watch channel onto
//! the slot; at most one fetch runs per key at any time, so concurrent
//! subscriptions collapse into a single network call.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tunnelboard_core::{
    ApiResult, CacheEntry, FetchStatus, MutationRequest, MutationState, QueryKey, Response,
};
use tunnelboard_transport::Transport;

/// Value producer for a key, generally a session-guarded transport call.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, ApiResult<Json>> + Send + Sync>;

/// Cache-wide policy. `stale_after: None` means every entry is always
/// stale: cached values are still served synchronously, but each new
/// subscription triggers a background refetch.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub stale_after: Option<Duration>,
    /// How long an unwatched entry survives before eviction.
    pub gc_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { stale_after: None, gc_grace: Duration::from_secs(5) }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let stale_after = std::env::var("TB_STALE_AFTER_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis);
        let gc_grace = std::env::var("TB_GC_GRACE_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));
        Self { stale_after, gc_grace }
    }
}

/// Per-subscription overrides.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub stale_after: Option<Duration>,
    /// Periodic background refetch while the subscription lives, for
    /// polling use cases such as health checks.
    pub refetch_interval: Option<Duration>,
}

struct Slot {
    tx: watch::Sender<CacheEntry>,
    /// Last fetcher registered for the key; reused by invalidation and
    /// interval refetches.
    fetcher: Option<Fetcher>,
    stale_after: Option<Duration>,
    /// Ticket of the in-flight fetch, if any. The per-key dedup marker.
    in_flight: Option<u64>,
    /// Set by explicit invalidation; cleared when a fetch that observes it
    /// starts, so a mark landing mid-flight survives the running fetch.
    stale: bool,
}

impl Slot {
    fn new(key: QueryKey, stale_after: Option<Duration>) -> Self {
        let (tx, _) = watch::channel(CacheEntry::idle(key));
        Self { tx, fetcher: None, stale_after, in_flight: None, stale: false }
    }
}

struct Inner {
    slots: Mutex<FxHashMap<QueryKey, Slot>>,
    cfg: CacheConfig,
    tickets: AtomicU64,
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, FxHashMap<QueryKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply clonable handle onto the shared cache.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    pub fn new(cfg: CacheConfig) -> Self {
        Self { inner: Arc::new(Inner { slots: Mutex::new(FxHashMap::default()), cfg, tickets: AtomicU64::new(0) }) }
    }

    /// Register interest in `key`. Creates the slot on first interest and
    /// starts a fetch unless the entry is fresh or one is already running.
    /// The returned subscription sees the current entry synchronously; a
    /// stale prior value stays visible while the refetch runs.
    pub fn subscribe(&self, key: QueryKey, fetcher: Fetcher, opts: QueryOptions) -> Subscription {
        let mut slots = self.inner.lock_slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), self.inner.cfg.stale_after));
        slot.tx.send_if_modified(|e| {
            e.subscriber_count += 1;
            false
        });
        slot.fetcher = Some(fetcher);
        if opts.stale_after.is_some() {
            slot.stale_after = opts.stale_after;
        }
        let rx = slot.tx.subscribe();
        let fresh = !slot.stale && slot.tx.borrow().is_fresh(slot.stale_after);
        if slot.in_flight.is_some() {
            counter!("cache_fetch_dedup", 1u64);
            debug!(key = %key, "cache: joined in-flight fetch");
        } else if !fresh {
            self.begin_fetch(slot, &key, "subscribe");
        }
        drop(slots);

        let poll_task = opts.refetch_interval.map(|every| {
            let cache = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    cache.poll_refetch(&key);
                }
            })
        });

        Subscription { key, rx, cache: self.clone(), poll_task }
    }

    /// Mark `key` stale. Watched entries refetch immediately; unwatched
    /// ones refetch on next subscription.
    pub fn invalidate(&self, key: &QueryKey) {
        counter!("cache_invalidate", 1u64);
        let mut slots = self.inner.lock_slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.stale = true;
        let watched = slot.tx.borrow().subscriber_count > 0;
        if watched && slot.in_flight.is_none() {
            self.begin_fetch(slot, key, "invalidate");
        }
    }

    pub fn invalidate_all(&self, keys: &[QueryKey]) {
        for key in keys {
            self.invalidate(key);
        }
    }

    /// Synchronous snapshot of a key, no side effects.
    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.lock_slots().get(key).map(|s| s.tx.borrow().clone())
    }

    /// Number of live slots, watched or not.
    pub fn len(&self) -> usize {
        self.inner.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin_fetch(&self, slot: &mut Slot, key: &QueryKey, reason: &str) {
        let Some(fetcher) = slot.fetcher.clone() else {
            return;
        };
        let ticket = self.inner.tickets.fetch_add(1, Ordering::Relaxed);
        slot.in_flight = Some(ticket);
        // This fetch is the revalidation for any staleness known so far.
        slot.stale = false;
        slot.tx.send_modify(|e| e.status = FetchStatus::Loading);
        counter!("cache_fetch", 1u64);
        debug!(key = %key, reason, "cache: fetch start");
        let cache = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let t0 = std::time::Instant::now();
            let res = fetcher().await;
            histogram!("cache_fetch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            cache.complete(&key, ticket, res);
        });
    }

    fn complete(&self, key: &QueryKey, ticket: u64, res: ApiResult<Json>) {
        let mut slots = self.inner.lock_slots();
        let Some(slot) = slots.get_mut(key) else {
            // Evicted while in flight: the result is discarded, it does not
            // resurrect the entry.
            counter!("cache_fetch_discarded", 1u64);
            debug!(key = %key, "cache: completion for evicted key discarded");
            return;
        };
        if slot.in_flight != Some(ticket) {
            counter!("cache_fetch_discarded", 1u64);
            return;
        }
        slot.in_flight = None;
        match res {
            Ok(value) => {
                slot.tx.send_modify(|e| {
                    e.value = Some(value);
                    e.status = FetchStatus::Success;
                    e.fetched_at = Some(tokio::time::Instant::now());
                    e.error = None;
                });
                debug!(key = %key, "cache: fetch ok");
            }
            Err(err) => {
                counter!("cache_fetch_err", 1u64);
                warn!(key = %key, error = %err, "cache: fetch failed");
                // Keep the last good value so readers can show stale data
                // next to the error.
                slot.tx.send_modify(|e| {
                    e.status = FetchStatus::Error;
                    e.error = Some(err);
                });
            }
        }
        // An invalidation that landed mid-flight supersedes this result:
        // watched entries refetch now, unwatched ones stay stale for the
        // next subscriber.
        if slot.stale && slot.tx.borrow().subscriber_count > 0 {
            self.begin_fetch(slot, key, "invalidated-in-flight");
        }
    }

    fn poll_refetch(&self, key: &QueryKey) {
        let mut slots = self.inner.lock_slots();
        if let Some(slot) = slots.get_mut(key) {
            if slot.tx.borrow().subscriber_count > 0 && slot.in_flight.is_none() {
                self.begin_fetch(slot, key, "interval");
            }
        }
    }

    fn unsubscribe(&self, key: &QueryKey) {
        let mut slots = self.inner.lock_slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.tx.send_if_modified(|e| {
            e.subscriber_count = e.subscriber_count.saturating_sub(1);
            false
        });
        if slot.tx.borrow().subscriber_count == 0 {
            let grace = self.inner.cfg.gc_grace;
            let cache = self.clone();
            let key = key.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        tokio::time::sleep(grace).await;
                        cache.evict_if_unwatched(&key);
                    });
                }
                Err(_) => {
                    // No runtime (shutdown path): evict immediately.
                    drop(slots);
                    self.evict_if_unwatched(&key);
                }
            }
        }
    }

    fn evict_if_unwatched(&self, key: &QueryKey) {
        let mut slots = self.inner.lock_slots();
        if let Some(slot) = slots.get(key) {
            if slot.tx.borrow().subscriber_count == 0 {
                slots.remove(key);
                counter!("cache_evict", 1u64);
                debug!(key = %key, "cache: evicted");
            }
        }
    }
}

/// Live interest in one key. Dropping it decrements the subscriber count
/// and, at zero, arms the eviction timer.
pub struct Subscription {
    key: QueryKey,
    rx: watch::Receiver<CacheEntry>,
    cache: QueryCache,
    poll_task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Snapshot of the entry as of now.
    pub fn current(&self) -> CacheEntry {
        self.rx.borrow().clone()
    }

    /// Wait for the next entry transition and return the new snapshot.
    pub async fn changed(&mut self) -> CacheEntry {
        let _ = self.rx.changed().await;
        self.current()
    }

    /// Wait until the entry settles in `Success` or `Error`.
    pub async fn ready(&mut self) -> CacheEntry {
        loop {
            let entry = self.current();
            match entry.status {
                FetchStatus::Success | FetchStatus::Error => return entry,
                FetchStatus::Idle | FetchStatus::Loading => {}
            }
            if self.rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.cache.unsubscribe(&self.key);
    }
}

// ---- Mutation pipeline ----

/// Executes writes through the (guarded) transport and invalidates the
/// affected keys strictly after a confirmed success. No optimistic local
/// mutation: the cache is untouched until the server round-trip confirms.
#[derive(Clone)]
pub struct Mutations {
    transport: Arc<dyn Transport>,
    cache: QueryCache,
}

impl Mutations {
    pub fn new(transport: Arc<dyn Transport>, cache: QueryCache) -> Self {
        Self { transport, cache }
    }

    pub async fn execute(&self, req: MutationRequest) -> ApiResult<Response> {
        let t0 = std::time::Instant::now();
        counter!("mutation_attempts", 1u64);
        info!(method = %req.method, path = %req.path, "mutation: start");
        match self.transport.send(req.method, &req.path, req.body.as_ref(), None).await {
            Ok(resp) => {
                self.cache.invalidate_all(&req.invalidates);
                counter!("mutation_ok", 1u64);
                info!(
                    status = resp.status,
                    invalidated = req.invalidates.len(),
                    took_ms = %t0.elapsed().as_millis(),
                    "mutation: ok"
                );
                Ok(resp)
            }
            Err(e) => {
                counter!("mutation_err", 1u64);
                warn!(error = %e, took_ms = %t0.elapsed().as_millis(), "mutation: failed");
                Err(e)
            }
        }
    }

    /// Fire-and-watch variant: runs the mutation on a task and reports
    /// `Pending -> Succeeded | Failed` through the handle. Each call is a
    /// fresh state machine; nothing queues behind a previous one.
    pub fn submit(&self, req: MutationRequest) -> MutationHandle {
        let (tx, rx) = watch::channel(MutationState::Pending);
        let this = self.clone();
        let task = tokio::spawn(async move {
            let state = match this.execute(req).await {
                Ok(r) => MutationState::Succeeded(r),
                Err(e) => MutationState::Failed(e),
            };
            let _ = tx.send(state);
        });
        MutationHandle { rx, _task: task }
    }
}

/// Subscriber handle onto one submitted mutation.
pub struct MutationHandle {
    rx: watch::Receiver<MutationState>,
    _task: JoinHandle<()>,
}

impl MutationHandle {
    pub fn state(&self) -> MutationState {
        self.rx.borrow().clone()
    }

    pub async fn finished(&mut self) -> MutationState {
        loop {
            match self.state() {
                MutationState::Succeeded(_) | MutationState::Failed(_) => return self.state(),
                MutationState::Idle | MutationState::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}
