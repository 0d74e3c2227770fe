//! The disk cache backend.
//!
//! Serves cached replies while they are fresh, coalesces concurrent
//! misses into one upstream refresh, returns stale entries inside their
//! stale-while-revalidate window while a deduplicated background refresh
//! runs, and falls back to stale entries when the upstream fails inside
//! the stale-if-error window.

pub mod fs;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;

use crate::config::CacheTuning;
use crate::error::BackendError;
use crate::stats::{bump, CACHE_STATS};
use crate::types::{Reply, Request};
use crate::volatile::Volatiles;
use crate::{Backend, Outcome};

/// An item held in the in-memory coalescing cache.
#[derive(Clone, Debug)]
struct CachedItem {
    /// When moka should evict this item: the end of the
    /// stale-while-revalidate window for replies, a short retry delay for
    /// errors.
    deadline: Instant,
    entry: Result<Reply, BackendError>,
}

type InMemoryCache = moka::future::Cache<String, CachedItem>;

/// A [`moka::Expiry`] that uses the [`CachedItem`] deadline as the
/// explicit expiration time.
struct CacheExpiration;

fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, CachedItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// Runs a closure on drop.
struct CallOnDrop(Option<Box<dyn FnOnce() + Send + 'static>>);

impl CallOnDrop {
    fn new(f: impl FnOnce() + Send + 'static) -> Self {
        CallOnDrop(Some(Box::new(f)))
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

#[derive(Clone)]
pub struct DiskCache {
    upstream: Arc<dyn Backend>,
    cache_dir: Option<PathBuf>,
    retry_errors_after: Duration,
    memory: InMemoryCache,
    /// URL stems with a background refresh currently in flight.
    refreshes: Arc<Mutex<HashSet<String>>>,
    max_lazy_refreshes: Arc<AtomicIsize>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let refreshes = self
            .refreshes
            .try_lock()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("DiskCache")
            .field("cache_dir", &self.cache_dir)
            .field("in-memory items", &self.memory.entry_count())
            .field("running refreshes", &refreshes)
            .finish()
    }
}

impl DiskCache {
    pub fn new(upstream: Arc<dyn Backend>, cache_dir: Option<PathBuf>, tuning: &CacheTuning) -> Self {
        let memory = InMemoryCache::builder()
            .max_capacity(tuning.in_memory_capacity)
            .expire_after(CacheExpiration)
            .build();
        DiskCache {
            upstream,
            cache_dir,
            retry_errors_after: tuning.retry_errors_after,
            memory,
            refreshes: Default::default(),
            max_lazy_refreshes: Arc::new(AtomicIsize::new(tuning.max_lazy_refreshes)),
        }
    }

    /// Produce a reply for `req` that is fresh at the time of return, or a
    /// stale one explicitly allowed by the request's staleness directives,
    /// or fail.
    ///
    /// Concurrent calls for the same stem collapse into one upstream
    /// refresh; every waiter gets the same reply or the same error.
    pub async fn get(&self, req: &Request) -> Result<Reply, BackendError> {
        bump(&CACHE_STATS.accesses);
        let key = req.urlstem.clone();

        if req.no_cache {
            // Bypass both tiers, but leave the fresh result behind for
            // everyone else.
            let item = self.compute_item(req.clone(), None).await;
            self.memory.insert(key, item.clone()).await;
            return item.entry;
        }

        let entry = self
            .memory
            .entry_by_ref(&key)
            .or_insert_with(Box::pin(self.lookup_or_compute(req)))
            .await;
        let inserted_now = entry.is_fresh();
        let item = entry.into_value();
        if !inserted_now {
            bump(&CACHE_STATS.memory_hits);
        }

        let reply = item.entry?;
        if reply.fresh() {
            return Ok(reply);
        }

        // The entry is stale. Inside the stale-while-revalidate window we
        // hand it out immediately and refresh in the background, unless
        // the request insists on revalidation.
        if req.max_stale != Some(0) && reply.within_swr() {
            bump(&CACHE_STATS.stale_served);
            self.spawn_refresh(req.clone());
            return Ok(reply);
        }

        // Revalidate now, coalescing with anyone else who got here.
        self.memory.invalidate(&key).await;
        let item = self
            .memory
            .entry_by_ref(&key)
            .or_insert_with(Box::pin(self.compute_item(req.clone(), Some(reply))))
            .await
            .into_value();
        item.entry
    }

    /// Look the record up on disk, or compute it via the upstream.
    async fn lookup_or_compute(&self, req: &Request) -> CachedItem {
        if let Some(cache_dir) = &self.cache_dir {
            match fs::read_record(cache_dir, &req.urlstem) {
                Ok(Some(reply)) if reply.fresh() || reply.within_swr() => {
                    bump(&CACHE_STATS.file_hits);
                    return self.item_for(Ok(reply));
                }
                Ok(Some(reply)) => {
                    // Expired beyond its grace window; its validator still
                    // earns us a 304 exchange.
                    return self.compute_item(req.clone(), Some(reply)).await;
                }
                Ok(None) => {}
                Err(err) => return self.item_for(Err(err)),
            }
        }
        self.compute_item(req.clone(), None).await
    }

    /// One upstream refresh, seeded with a stale reply when we have one.
    async fn compute_item(&self, req: Request, seed: Option<Reply>) -> CachedItem {
        bump(&CACHE_STATS.computations);
        let stale = seed.clone();
        let mut reply = seed.unwrap_or_default();

        let entry = match self.upstream.refresh(&req, &mut reply).await {
            Ok(_outcome) => {
                if !reply.fingerprint_ok() {
                    // Never hand out a reply whose fingerprint disagrees
                    // with its content.
                    Err(BackendError::Malformed(
                        "content fingerprint mismatch".into(),
                    ))
                } else {
                    if let Some(cache_dir) = &self.cache_dir {
                        if let Err(e) = fs::write_record(cache_dir, &req.urlstem, &reply) {
                            tracing::error!(
                                urlstem = %req.urlstem,
                                error = %e,
                                "failed to persist cache record"
                            );
                        }
                    }
                    Ok(reply)
                }
            }
            Err(err) => {
                // The upstream already consumed its own stale-if-error
                // allowance; this covers upstreams without one.
                match stale {
                    Some(mut stale) if stale.within_stale_if_error(req.stale_if_error) => {
                        bump(&CACHE_STATS.stale_if_error_served);
                        stale.extend_staleness(Duration::from_secs(1));
                        Ok(stale)
                    }
                    _ => Err(err),
                }
            }
        };
        self.item_for(entry)
    }

    fn item_for(&self, entry: Result<Reply, BackendError>) -> CachedItem {
        let deadline = match &entry {
            Ok(reply) => {
                let until = (reply.expires + reply.stale_while_revalidate)
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                Instant::now() + until
            }
            Err(_) => Instant::now() + self.retry_errors_after,
        };
        CachedItem { deadline, entry }
    }

    /// Kick off a deduplicated background refresh for a stale entry.
    fn spawn_refresh(&self, req: Request) {
        let key = req.urlstem.clone();

        let mut refreshes = self.refreshes.lock().unwrap();
        if refreshes.contains(&key) {
            return;
        }

        // Count down towards zero; at or below it, skip the refresh.
        let max_lazy = Arc::clone(&self.max_lazy_refreshes);
        if max_lazy.fetch_sub(1, Ordering::Relaxed) <= 0 {
            max_lazy.fetch_add(1, Ordering::Relaxed);
            bump(&CACHE_STATS.lazy_limit_hit);
            return;
        }

        let done_token = {
            let key = key.clone();
            let refreshes = Arc::clone(&self.refreshes);
            CallOnDrop::new(move || {
                max_lazy.fetch_add(1, Ordering::Relaxed);
                refreshes.lock().unwrap().remove(&key);
            })
        };

        refreshes.insert(key.clone());
        drop(refreshes);

        bump(&CACHE_STATS.refreshes_spawned);
        tracing::trace!(urlstem = %req.urlstem, "spawning deduplicated refresh");

        let this = self.clone();
        tokio::spawn(async move {
            let _done_token = done_token;
            let seed = this
                .cache_dir
                .as_deref()
                .and_then(|dir| fs::read_record(dir, &req.urlstem).ok().flatten());
            let item = this.compute_item(req, seed).await;
            this.memory.insert(key, item).await;
        });
    }

    /// See [`cleanup`].
    pub fn cleanup(&self, vols: &Volatiles) -> CleanupSummary {
        match &self.cache_dir {
            Some(dir) => cleanup(dir, vols),
            None => CleanupSummary::default(),
        }
    }
}

/// Remove records that are past their grace window and, oldest first,
/// enough more to come back under the configured size caps. Used by the
/// `cleanup` subcommand; the serving path never blocks on this.
pub fn cleanup(cache_dir: &std::path::Path, vols: &Volatiles) -> CleanupSummary {
    let mut summary = CleanupSummary::default();

    let mut live = Vec::new();
    for (path, size, mtime) in fs::walk_records(cache_dir) {
        summary.scanned += 1;
        let dead = match std::fs::read(&path).map(|d| Reply::from_record(&d)) {
            Ok(Ok(reply)) => !reply.within_swr() && !reply.fresh(),
            // Unreadable or unparseable records are dead weight.
            _ => true,
        };
        if dead {
            if std::fs::remove_file(&path).is_ok() {
                summary.removed += 1;
                summary.bytes_freed += size;
            }
        } else {
            live.push((path, size, mtime));
        }
    }

    let max_bytes = vols.dc_maxbytes();
    let max_files = vols.dc_maxfiles();
    let mut total: u64 = live.iter().map(|(_, size, _)| size).sum();
    let over_bytes = total as f32 > max_bytes as f32 * vols.evict_lwm();
    let over_files = live.len() as f32 > max_files as f32 * vols.evict_lwm();
    if over_bytes || over_files {
        let target_bytes = (max_bytes as f32 * vols.evict_target_fraction()) as u64;
        let target_files = (max_files as f32 * vols.evict_target_fraction()) as u64;
        live.sort_by_key(|(_, _, mtime)| *mtime);
        let mut count = live.len() as u64;
        for (path, size, _) in live {
            if total <= target_bytes && count <= target_files {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                summary.removed += 1;
                summary.bytes_freed += size;
                total = total.saturating_sub(size);
                count -= 1;
            }
        }
    }
    summary
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupSummary {
    pub scanned: u64,
    pub removed: u64,
    pub bytes_freed: u64,
}

impl Backend for DiskCache {
    fn refresh<'a>(
        &'a self,
        req: &'a Request,
        reply: &'a mut Reply,
    ) -> BoxFuture<'a, Result<Outcome, BackendError>> {
        Box::pin(async move {
            *reply = self.get(req).await?;
            Ok(Outcome::Modified)
        })
    }
}
