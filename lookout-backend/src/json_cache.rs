use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use scc::HashMap;
use scc::hash_map::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Kind of derived view a cached payload holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataTag {
    Servers,
    Players,
    Sessions,
    KillsTable,
    ServerOverview,
    PlayerOverview,
    OnlineNow,
    GraphPing,
    GraphPerformance,
}

impl DataTag {
    pub const ALL: [DataTag; 9] = [
        DataTag::Servers,
        DataTag::Players,
        DataTag::Sessions,
        DataTag::KillsTable,
        DataTag::ServerOverview,
        DataTag::PlayerOverview,
        DataTag::OnlineNow,
        DataTag::GraphPing,
        DataTag::GraphPerformance,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Tag plus the server or player the payload was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tag: DataTag,
    pub scope: Option<Uuid>,
}

impl CacheKey {
    pub fn of(tag: DataTag) -> Self {
        Self { tag, scope: None }
    }

    pub fn scoped(tag: DataTag, scope: Uuid) -> Self {
        Self {
            tag,
            scope: Some(scope),
        }
    }
}

struct CacheEntry {
    payload: Arc<str>,
    created_at: i64,
    last_access: AtomicI64,
}

impl CacheEntry {
    fn is_idle(&self, now: i64, ttl: i64) -> bool {
        now - self.last_access.load(Ordering::Relaxed) > ttl
    }
}

/// Serialized view payloads keyed by [`CacheKey`], expiring after a period without access.
///
/// Payloads are handed out as `Arc<str>`, so eviction never takes a value away
/// from a reader that already got it.
pub struct JsonCache {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Bumped on every invalidation of a tag; guards against caching a payload
    /// computed before that invalidation.
    generations: [AtomicU64; DataTag::ALL.len()],
    ttl: i64,
}

impl JsonCache {
    /// `ttl` is the idle time in millis after which an entry is dropped.
    pub fn new(ttl: i64) -> Self {
        Self {
            entries: HashMap::new(),
            generations: Default::default(),
            ttl,
        }
    }

    fn generation(&self, tag: DataTag) -> u64 {
        self.generations[tag.index()].load(Ordering::SeqCst)
    }

    fn bump(&self, tag: DataTag) {
        self.generations[tag.index()].fetch_add(1, Ordering::SeqCst);
    }

    /// Return the cached payload, or compute, store and return it.
    ///
    /// Concurrent misses on the same key may compute twice; the last store wins.
    /// A payload whose tag was invalidated while it was being computed is
    /// returned to the caller but not kept.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        now: i64,
        compute: F,
    ) -> Result<Arc<str>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        if let Some(payload) = self.get(key, now).await {
            return Ok(payload);
        }

        let started = self.generation(key.tag);
        let payload: Arc<str> = Arc::from(compute().await?);
        self.put(key, payload.clone(), now).await;

        if self.generation(key.tag) != started {
            let _ = self
                .entries
                .remove_if_async(&key, |entry| Arc::ptr_eq(&entry.payload, &payload))
                .await;
            debug!(?key, "discarded payload invalidated during compute");
        }
        Ok(payload)
    }

    /// Cached payload if present and not idle. Idle entries are dropped on the way.
    pub async fn get(&self, key: CacheKey, now: i64) -> Option<Arc<str>> {
        let ttl = self.ttl;
        let hit = self
            .entries
            .read_async(&key, |_, entry| {
                if entry.is_idle(now, ttl) {
                    None
                } else {
                    entry.last_access.fetch_max(now, Ordering::Relaxed);
                    Some(entry.payload.clone())
                }
            })
            .await
            .flatten();

        if hit.is_none() {
            let _ = self
                .entries
                .remove_if_async(&key, |entry| entry.is_idle(now, ttl))
                .await;
        }
        hit
    }

    /// Store a payload, replacing whatever was cached under `key`.
    pub async fn put(&self, key: CacheKey, payload: Arc<str>, now: i64) {
        let entry = CacheEntry {
            payload,
            created_at: now,
            last_access: AtomicI64::new(now),
        };
        match self.entries.entry_async(key).await {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = entry;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
    }

    /// Creation time of the cached payload, if any.
    pub async fn created_at(&self, key: CacheKey) -> Option<i64> {
        self.entries
            .read_async(&key, |_, entry| entry.created_at)
            .await
    }

    /// Remove exactly `key`.
    pub async fn invalidate(&self, key: CacheKey) {
        self.bump(key.tag);
        if self.entries.remove_async(&key).await.is_some() {
            debug!(?key, "invalidated cache entry");
        }
    }

    /// Remove every entry whose tag is listed, whatever its scope.
    pub async fn invalidate_matching(&self, tags: &[DataTag]) {
        for tag in tags {
            self.bump(*tag);
        }
        self.entries
            .retain_async(|key, _| !tags.contains(&key.tag))
            .await;
        debug!(?tags, "invalidated matching cache entries");
    }

    pub async fn invalidate_all(&self) {
        for tag in DataTag::ALL {
            self.bump(tag);
        }
        self.entries.retain_async(|_, _| false).await;
        debug!("invalidated all cache entries");
    }

    /// Drop entries idle for longer than the TTL.
    pub async fn clean_up(&self, now: i64) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain_async(|_, entry| !entry.is_idle(now, ttl))
            .await;
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "cleaned up idle cache entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    const TTL: i64 = 60_000;

    async fn compute_counted(
        cache: &JsonCache,
        key: CacheKey,
        now: i64,
        calls: &AtomicUsize,
    ) -> Arc<str> {
        cache
            .get_or_compute(key, now, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(format!("{{\"n\":{n}}}"))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_hit_does_not_recompute() {
        let cache = JsonCache::new(TTL);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::of(DataTag::Servers);

        let first = compute_counted(&cache, key, 0, &calls).await;
        let second = compute_counted(&cache, key, 1_000, &calls).await;

        assert_eq!(&*first, "{\"n\":0}");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.created_at(key).await, Some(0));
    }

    #[tokio::test]
    async fn test_invalidate_exact_key() {
        let cache = JsonCache::new(TTL);
        let calls = AtomicUsize::new(0);
        let servers = CacheKey::of(DataTag::Servers);
        let players = CacheKey::of(DataTag::Players);

        compute_counted(&cache, servers, 0, &calls).await;
        compute_counted(&cache, players, 0, &calls).await;
        cache.invalidate(servers).await;

        assert!(cache.get(servers, 1).await.is_none());
        assert!(cache.get(players, 1).await.is_some());

        // Miss recomputes
        let again = compute_counted(&cache, servers, 2, &calls).await;
        assert_eq!(&*again, "{\"n\":2}");
    }

    #[tokio::test]
    async fn test_invalidate_matching_covers_all_scopes() {
        let cache = JsonCache::new(TTL);
        let calls = AtomicUsize::new(0);
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());

        for key in [
            CacheKey::scoped(DataTag::ServerOverview, s1),
            CacheKey::scoped(DataTag::ServerOverview, s2),
            CacheKey::scoped(DataTag::Sessions, s1),
            CacheKey::of(DataTag::Sessions),
            CacheKey::of(DataTag::KillsTable),
            CacheKey::scoped(DataTag::GraphPing, s1),
        ] {
            compute_counted(&cache, key, 0, &calls).await;
        }

        cache
            .invalidate_matching(&[DataTag::ServerOverview, DataTag::Sessions, DataTag::KillsTable])
            .await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get(CacheKey::scoped(DataTag::GraphPing, s1), 1).await.is_some());
    }

    #[tokio::test]
    async fn test_idle_entries_expire() {
        let cache = JsonCache::new(TTL);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::of(DataTag::Players);

        compute_counted(&cache, key, 0, &calls).await;
        // Access keeps it alive past the original TTL
        assert!(cache.get(key, 50_000).await.is_some());
        assert!(cache.get(key, 100_000).await.is_some());
        // Idle for longer than the TTL
        assert!(cache.get(key, 170_001).await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_clean_up_removes_only_idle() {
        let cache = JsonCache::new(TTL);
        let calls = AtomicUsize::new(0);
        let old = CacheKey::of(DataTag::Players);
        let fresh = CacheKey::of(DataTag::Servers);

        let held = compute_counted(&cache, old, 0, &calls).await;
        compute_counted(&cache, fresh, 50_000, &calls).await;
        cache.clean_up(90_000).await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get(fresh, 90_000).await.is_some());
        // A payload handed out before eviction stays valid for its holder
        assert_eq!(&*held, "{\"n\":0}");
    }

    #[tokio::test]
    async fn test_put_last_write_wins() {
        let cache = JsonCache::new(TTL);
        let key = CacheKey::of(DataTag::Servers);
        cache.put(key, Arc::from("old"), 0).await;
        cache.put(key, Arc::from("new"), 1).await;
        assert_eq!(cache.get(key, 2).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_invalidation_during_compute_is_not_cached() {
        let cache = Arc::new(JsonCache::new(TTL));
        let key = CacheKey::of(DataTag::Sessions);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(key, 0, || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, Infallible>("stale".to_string())
                    })
                    .await
                    .unwrap()
            })
        };

        started_rx.await.unwrap();
        cache.invalidate_matching(&[DataTag::Sessions]).await;
        release_tx.send(()).unwrap();

        assert_eq!(&*reader.await.unwrap(), "stale");
        assert!(cache.get(key, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = JsonCache::new(TTL);
        let calls = AtomicUsize::new(0);
        compute_counted(&cache, CacheKey::of(DataTag::Servers), 0, &calls).await;
        compute_counted(&cache, CacheKey::scoped(DataTag::PlayerOverview, Uuid::new_v4()), 0, &calls).await;

        cache.invalidate_all().await;
        assert!(cache.is_empty());
    }
}
