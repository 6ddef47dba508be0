//! Read-through, write-through cache of definitions in front of a [`ConfigStore`].
//!
//! Entries hold `Arc` snapshots. Writers replace entries wholesale, so a reader that got a
//! snapshot keeps a consistent view for the rest of its evaluation no matter what happens to the
//! cache afterwards. Names that the store does not know are cached as absent, so that evaluating
//! an unknown flag on every request does not turn into a store read on every request.
//!
//! Every entry carries the generation it was written at. Writes that are based on a store read
//! (misses, bulk loads) only land if the entry was not written after the read started, checked
//! and written in one step under the cache's per-key lock. Local administrative writes always
//! land, so they are never reverted by an older store listing.
use std::{
    collections::HashSet,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use moka::{ops::compute::Op, sync::Cache};
use serde::de::DeserializeOwned;

use crate::{
    clock::{Clock, Timestamp},
    store::{ConfigStore, Fetcher, StoreError},
    ServiceConfig,
};

struct CacheEntry<T> {
    /// `None` records that the store had no (usable) value for the name.
    value: Option<Arc<T>>,
    refreshed_at: Timestamp,
    generation: u64,
}

// Not derived: `#[derive(Clone)]` would require `T: Clone`.
impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        CacheEntry {
            value: self.value.clone(),
            refreshed_at: self.refreshed_at,
            generation: self.generation,
        }
    }
}

/// Cache of definitions of type `T` stored under a common key prefix.
pub struct DefinitionCache<T> {
    store: Arc<dyn ConfigStore>,
    fetcher: Fetcher,
    prefix: String,
    entries: Cache<String, CacheEntry<T>>,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DefinitionCache<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Create an empty cache for keys under `prefix`.
    pub fn new(store: Arc<dyn ConfigStore>, prefix: &str, config: &ServiceConfig) -> Self {
        DefinitionCache {
            fetcher: Fetcher::new(Arc::clone(&store), config.store_timeout),
            store,
            prefix: prefix.to_owned(),
            entries: Cache::builder()
                .max_capacity(config.max_cache_entries)
                .build(),
            generation: AtomicU64::new(0),
            clock: Arc::clone(&config.clock),
            ttl: chrono::Duration::from_std(config.cache_ttl).unwrap_or(chrono::Duration::MAX),
            _marker: PhantomData,
        }
    }

    /// Store key of the definition called `name`.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get the definition called `name`.
    ///
    /// Serves from the cache while the entry is fresh. Otherwise reads the store, sharing the
    /// read with concurrent misses on the same name, caches the outcome and returns it. Store
    /// failures are logged and reported as absent.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        if let Some(entry) = self.entries.get(name) {
            if !self.is_stale(&entry) {
                return entry.value;
            }
        }

        let started = self.generation.load(Ordering::SeqCst);
        let key = self.key(name);
        match self.fetcher.get(&key) {
            Ok(raw) => {
                let value = raw.and_then(|raw| self.parse(&key, &raw)).map(Arc::new);
                self.insert_unless_written_since(name, value.clone(), started);
                value
            }
            Err(err) => {
                log::warn!(target: "gateway_flags",
                           key:display = key;
                           "failed to read definition from config store: {}", err);
                None
            }
        }
    }

    /// Read `name` straight from the store, refreshing the cache with the result.
    ///
    /// Unlike [`DefinitionCache::get`], store failures are returned to the caller. Used by the
    /// administrative path, which must not mistake an outage for a missing definition.
    pub fn fetch(&self, name: &str) -> Result<Option<Arc<T>>, StoreError> {
        let started = self.generation.load(Ordering::SeqCst);
        let key = self.key(name);
        let value = self
            .store
            .get(&key)?
            .and_then(|raw| self.parse(&key, &raw))
            .map(Arc::new);
        self.insert_unless_written_since(name, value.clone(), started);
        Ok(value)
    }

    /// Replace the entry for `name`. Called after the store accepted the write.
    pub fn put(&self, name: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.insert(name, Some(Arc::clone(&value)));
        value
    }

    /// Record that `name` no longer exists. Called after the store accepted the delete.
    pub fn remove(&self, name: &str) {
        self.insert(name, None);
    }

    /// Reload every definition under the prefix from the store and return them.
    ///
    /// Cached definitions missing from the listing are recorded as absent, so deletes made
    /// through other instances converge here too. Values that fail to parse are skipped. The
    /// returned list is the full listing, independent of how many entries the cache can hold.
    pub fn load_all(&self) -> Result<Vec<Arc<T>>, StoreError> {
        let started = self.generation.load(Ordering::SeqCst);
        let listing = self.store.get_all(&self.prefix)?;

        let mut names = HashSet::with_capacity(listing.len());
        let mut loaded = Vec::with_capacity(listing.len());
        for (key, raw) in &listing {
            let Some(name) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let Some(value) = self.parse(key, raw) else {
                continue;
            };
            let value = Arc::new(value);
            self.insert_unless_written_since(name, Some(Arc::clone(&value)), started);
            names.insert(name.to_owned());
            loaded.push(value);
        }

        let vanished: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(name, entry)| entry.value.is_some() && !names.contains(name.as_str()))
            .map(|(name, _)| name)
            .collect();
        for name in vanished {
            self.insert_unless_written_since(&name, None, started);
        }

        log::debug!(target: "gateway_flags",
                    prefix:display = self.prefix,
                    loaded = loaded.len();
                    "loaded definitions from config store");
        Ok(loaded)
    }

    /// Drop entries older than the TTL.
    pub fn sweep(&self) {
        let stale: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_stale(entry))
            .map(|(name, _)| name)
            .collect();
        for name in stale {
            // Re-checked under the entry lock: the entry may have been rewritten meanwhile.
            self.entries
                .entry_by_ref(name.as_str())
                .and_compute_with(|current| match current {
                    Some(current) if self.is_stale(current.value()) => Op::Remove,
                    _ => Op::Nop,
                });
        }
        self.entries.run_pending_tasks();
    }

    /// All cached definitions that are present, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .iter()
            .filter_map(|(_, entry)| entry.value)
            .collect()
    }

    fn insert(&self, name: &str, value: Option<Arc<T>>) {
        self.write(name, value, None);
    }

    /// Write the entry unless `name` was written after generation `since` was observed.
    fn insert_unless_written_since(&self, name: &str, value: Option<Arc<T>>, since: u64) {
        self.write(name, value, Some(since));
    }

    fn write(&self, name: &str, value: Option<Arc<T>>, since: Option<u64>) {
        let entry = CacheEntry {
            value,
            refreshed_at: self.clock.now(),
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.entries
            .entry_by_ref(name)
            .and_compute_with(|current| match (current, since) {
                (Some(current), Some(since)) if current.value().generation > since => Op::Nop,
                _ => Op::Put(entry),
            });
    }

    fn is_stale(&self, entry: &CacheEntry<T>) -> bool {
        self.clock.now() - entry.refreshed_at >= self.ttl
    }

    fn parse(&self, key: &str, raw: &str) -> Option<T> {
        serde_json::from_str(raw)
            .inspect_err(|err| {
                log::warn!(target: "gateway_flags",
                           key;
                           "ignoring definition that failed to parse: {}", err);
            })
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use chrono::{TimeZone, Utc};

    use super::DefinitionCache;
    use crate::{
        clock::ManualClock,
        store::{ConfigStore, InMemoryConfigStore, SetOptions, StoreError},
        ServiceConfig,
    };

    /// Counts reads and can be switched into an outage.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryConfigStore,
        reads: AtomicUsize,
        down: AtomicBool,
        read_delay: Duration,
    }

    impl ConfigStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.read_delay);
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("down".to_owned()));
            }
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str, options: &SetOptions) -> Result<(), StoreError> {
            self.inner.set(key, value, options)
        }
        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key)
        }
        fn get_all(&self, prefix: &str) -> Result<HashMap<String, String>, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("down".to_owned()));
            }
            self.inner.get_all(prefix)
        }
    }

    fn setup() -> (Arc<CountingStore>, Arc<ManualClock>, DefinitionCache<u32>) {
        setup_with_store(CountingStore::default())
    }

    fn setup_with_store(
        store: CountingStore,
    ) -> (Arc<CountingStore>, Arc<ManualClock>, DefinitionCache<u32>) {
        let store = Arc::new(store);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = ServiceConfig::new()
            .with_clock(clock.clone())
            .with_cache_ttl(Duration::from_secs(300))
            .with_store_timeout(None);
        let cache = DefinitionCache::new(store.clone(), "numbers/", &config);
        (store, clock, cache)
    }

    fn write(store: &CountingStore, key: &str, value: &str) {
        store.set(key, value, &SetOptions::default()).unwrap();
    }

    #[test]
    fn miss_reads_through_once() {
        let (store, _clock, cache) = setup();
        write(&store, "numbers/one", "1");

        assert_eq!(cache.get("one").as_deref(), Some(&1));
        assert_eq!(cache.get("one").as_deref(), Some(&1));
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn absent_names_are_cached() {
        let (store, _clock, cache) = setup();

        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.get("missing"), None);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_entries_are_refetched() {
        let (store, clock, cache) = setup();
        write(&store, "numbers/one", "1");
        assert_eq!(cache.get("one").as_deref(), Some(&1));

        write(&store, "numbers/one", "11");
        clock.advance(chrono::Duration::minutes(4));
        assert_eq!(cache.get("one").as_deref(), Some(&1));

        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(cache.get("one").as_deref(), Some(&11));
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn store_errors_read_as_absent_and_are_not_cached() {
        let (store, _clock, cache) = setup();
        write(&store, "numbers/one", "1");
        store.down.store(true, Ordering::SeqCst);

        assert_eq!(cache.get("one"), None);

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(cache.get("one").as_deref(), Some(&1));
    }

    #[test]
    fn unparsable_values_read_as_absent() {
        let (store, _clock, cache) = setup();
        write(&store, "numbers/bad", "not a number");

        assert_eq!(cache.get("bad"), None);
    }

    #[test]
    fn put_and_remove_replace_entries() {
        let (store, _clock, cache) = setup();

        cache.put("two", 2);
        assert_eq!(cache.get("two").as_deref(), Some(&2));

        cache.remove("two");
        assert_eq!(cache.get("two"), None);
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn snapshots_survive_replacement() {
        let (_store, _clock, cache) = setup();
        cache.put("n", 1);
        let snapshot = cache.get("n").unwrap();

        cache.put("n", 2);
        assert_eq!(*snapshot, 1);
        assert_eq!(cache.get("n").as_deref(), Some(&2));
    }

    #[test]
    fn load_all_populates_and_forgets_vanished_entries() {
        let (store, _clock, cache) = setup();
        write(&store, "numbers/one", "1");
        write(&store, "numbers/two", "2");
        write(&store, "numbers/bad", "oops");
        write(&store, "other/three", "3");

        assert_eq!(cache.load_all().map(|loaded| loaded.len()), Ok(2));
        assert_eq!(cache.get("one").as_deref(), Some(&1));
        assert_eq!(cache.get("two").as_deref(), Some(&2));
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);

        store.delete("numbers/two").unwrap();
        assert_eq!(cache.load_all().map(|loaded| loaded.len()), Ok(1));
        assert_eq!(cache.get("two"), None);
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn load_all_failure_leaves_cache_usable() {
        let (store, _clock, cache) = setup();
        store.down.store(true, Ordering::SeqCst);
        assert!(cache.load_all().is_err());

        store.down.store(false, Ordering::SeqCst);
        write(&store, "numbers/one", "1");
        assert_eq!(cache.get("one").as_deref(), Some(&1));
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let (_store, clock, cache) = setup();
        cache.put("one", 1);
        clock.advance(chrono::Duration::minutes(10));
        cache.put("two", 2);

        cache.sweep();

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(*snapshot[0], 2);
    }

    #[test]
    fn concurrent_misses_read_the_store_once() {
        let (store, _clock, cache) = setup_with_store(CountingStore {
            read_delay: Duration::from_millis(200),
            ..CountingStore::default()
        });
        write(&store, "numbers/one", "1");
        let barrier = Barrier::new(8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    assert_eq!(cache.get("one").as_deref(), Some(&1));
                });
            }
        });
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_all_never_reverts_local_writes() {
        let (store, _clock, cache) = setup();
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::SeqCst) {
                    let _ = cache.load_all();
                }
            });

            for i in 0..500u32 {
                write(&store, "numbers/n", &i.to_string());
                cache.put("n", i);
                assert_eq!(cache.get("n").as_deref(), Some(&i));

                let name = format!("new-{i}");
                write(&store, &format!("numbers/{name}"), &i.to_string());
                cache.put(&name, i);
                assert_eq!(cache.get(&name).as_deref(), Some(&i));
            }
            stop.store(true, Ordering::SeqCst);
        });
    }

    #[test]
    fn load_all_returns_more_than_the_cache_holds() {
        let store = CountingStore::default();
        for i in 0..50 {
            store
                .set(&format!("numbers/{i}"), &i.to_string(), &SetOptions::default())
                .unwrap();
        }
        let config = ServiceConfig::new().with_max_cache_entries(10);
        let cache: DefinitionCache<u32> = DefinitionCache::new(Arc::new(store), "numbers/", &config);

        let mut loaded: Vec<u32> = cache.load_all().unwrap().iter().map(|n| **n).collect();
        loaded.sort_unstable();
        assert_eq!(loaded, (0..50).collect::<Vec<_>>());
    }
}
