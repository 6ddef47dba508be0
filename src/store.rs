//! Contract of the remote key-value store holding flag and experiment definitions.
//!
//! The transport behind a store is not this crate's business: a parameter store, a database or an
//! HTTP service all fit as long as they implement [`ConfigStore`]. [`InMemoryConfigStore`] is
//! provided for tests and single-process deployments.
use std::{
    collections::{BTreeMap, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock},
    time::Duration,
};

/// Failure talking to the config store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The store did not answer in time.
    #[error("config store timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached or failed internally.
    #[error("config store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request, e.g. for lack of permissions.
    #[error("config store rejected the request: {0}")]
    Rejected(String),
}

/// Options passed along with a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Ask the store to encrypt the value at rest.
    pub secure: bool,
    /// Human-readable description stored next to the value.
    pub description: Option<String>,
}

/// Key-value access to stored definitions.
///
/// Implementations must be safe to call from many threads at once. Retries, if any, belong
/// here and not in the callers.
pub trait ConfigStore: Send + Sync {
    /// Read a single value. `Ok(None)` means the key does not exist.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Create or overwrite a value.
    fn set(&self, key: &str, value: &str, options: &SetOptions) -> Result<(), StoreError>;

    /// Delete a value. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List every key starting with `prefix` together with its value.
    fn get_all(&self, prefix: &str) -> Result<HashMap<String, String>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    options: SetOptions,
}

/// A [`ConfigStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    values: RwLock<BTreeMap<String, StoredValue>>,
}

impl InMemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> InMemoryConfigStore {
        InMemoryConfigStore::default()
    }

    /// Options the value at `key` was written with.
    pub fn options(&self, key: &str) -> Option<SetOptions> {
        let values = self.values.read().ok()?;
        values.get(key).map(|stored| stored.options.clone())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().map(|values| values.len()).unwrap_or(0)
    }

    /// Return `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_owned())
}

impl ConfigStore for InMemoryConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.read().map_err(|_| poisoned())?;
        Ok(values.get(key).map(|stored| stored.value.clone()))
    }

    fn set(&self, key: &str, value: &str, options: &SetOptions) -> Result<(), StoreError> {
        let stored = StoredValue {
            value: value.to_owned(),
            options: options.clone(),
        };
        let mut values = self.values.write().map_err(|_| poisoned())?;
        values.insert(key.to_owned(), stored);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().map_err(|_| poisoned())?;
        values.remove(key);
        Ok(())
    }

    fn get_all(&self, prefix: &str) -> Result<HashMap<String, String>, StoreError> {
        let values = self.values.read().map_err(|_| poisoned())?;
        Ok(values
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, stored)| (key.clone(), stored.value.clone()))
            .collect())
    }
}

type FetchResult = Result<Option<String>, StoreError>;

/// Reads single keys from a store, bounding how long callers wait.
///
/// A read runs on a short-lived thread that is left to finish on its own when its callers give
/// up. At most one read per key is in flight: a caller missing on a key that is already being
/// read waits for that read instead of starting another one. A hung store therefore holds at
/// most one thread per key, and concurrent misses on a key cost a single store read.
pub(crate) struct Fetcher {
    store: Arc<dyn ConfigStore>,
    /// `None` waits as long as the store takes.
    timeout: Option<Duration>,
    in_flight: Arc<Mutex<HashMap<String, Arc<Fetch>>>>,
}

/// Outcome slot of one store read, shared by every caller waiting on it.
#[derive(Default)]
struct Fetch {
    result: Mutex<Option<FetchResult>>,
    done: Condvar,
}

impl Fetch {
    fn complete(&self, result: FetchResult) {
        *lock(&self.result) = Some(result);
        self.done.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> FetchResult {
        let slot = lock(&self.result);
        match timeout {
            None => {
                let slot = self
                    .done
                    .wait_while(slot, |result| result.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                Option::clone(&slot).unwrap_or_else(|| {
                    Err(StoreError::Unavailable("fetch finished without a result".to_owned()))
                })
            }
            Some(timeout) => {
                let (slot, _) = self
                    .done
                    .wait_timeout_while(slot, timeout, |result| result.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                Option::clone(&slot).unwrap_or(Err(StoreError::Timeout(timeout)))
            }
        }
    }
}

impl Fetcher {
    pub fn new(store: Arc<dyn ConfigStore>, timeout: Option<Duration>) -> Fetcher {
        Fetcher {
            store,
            timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read `key`, joining the read already in flight for it if there is one.
    pub fn get(&self, key: &str) -> FetchResult {
        let fetch = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(key) {
                Some(fetch) => Arc::clone(fetch),
                None => {
                    let fetch = Arc::new(Fetch::default());
                    self.spawn(key, Arc::clone(&fetch))?;
                    in_flight.insert(key.to_owned(), Arc::clone(&fetch));
                    fetch
                }
            }
        };
        fetch.wait(self.timeout)
    }

    /// Number of reads currently in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn spawn(&self, key: &str, fetch: Arc<Fetch>) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let key = key.to_owned();
        std::thread::Builder::new()
            .name("flag-store-fetch".to_owned())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| store.get(&key))).unwrap_or_else(
                    |_| Err(StoreError::Unavailable("config store panicked".to_owned())),
                );
                {
                    // The spawning caller holds the lock until the fetch is registered.
                    let mut in_flight = lock(&in_flight);
                    if in_flight
                        .get(&key)
                        .is_some_and(|current| Arc::ptr_eq(current, &fetch))
                    {
                        in_flight.remove(&key);
                    }
                }
                fetch.complete(result);
            })
            .map(|_| ())
            .map_err(|err| StoreError::Unavailable(format!("cannot spawn fetch thread: {err}")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use super::{ConfigStore, Fetcher, InMemoryConfigStore, SetOptions, StoreError};

    /// Answers every read with `"late"` after a delay, counting reads.
    struct SlowStore {
        delay: Duration,
        reads: AtomicUsize,
    }

    fn slow_store(delay: Duration) -> Arc<SlowStore> {
        Arc::new(SlowStore {
            delay,
            reads: AtomicUsize::new(0),
        })
    }

    impl ConfigStore for SlowStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(Some("late".to_owned()))
        }
        fn set(&self, _key: &str, _value: &str, _options: &SetOptions) -> Result<(), StoreError> {
            Ok(())
        }
        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn get_all(&self, _prefix: &str) -> Result<HashMap<String, String>, StoreError> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn set_get_delete() {
        let store = InMemoryConfigStore::new();
        assert_eq!(store.get("feature-flags/a").unwrap(), None);

        store
            .set("feature-flags/a", "1", &SetOptions::default())
            .unwrap();
        assert_eq!(store.get("feature-flags/a").unwrap().as_deref(), Some("1"));

        store.delete("feature-flags/a").unwrap();
        assert_eq!(store.get("feature-flags/a").unwrap(), None);
        // Deleting twice is fine.
        store.delete("feature-flags/a").unwrap();
    }

    #[test]
    fn get_all_filters_by_prefix() {
        let store = InMemoryConfigStore::new();
        for key in ["experiments/e", "feature-flags/a", "feature-flags/b", "feature-flagsx"] {
            store.set(key, key, &SetOptions::default()).unwrap();
        }

        let flags = store.get_all("feature-flags/").unwrap();
        let mut keys: Vec<_> = flags.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["feature-flags/a", "feature-flags/b"]);
    }

    #[test]
    fn keeps_write_options() {
        let store = InMemoryConfigStore::new();
        let options = SetOptions {
            secure: true,
            description: Some("owned by routing".to_owned()),
        };
        store.set("feature-flags/a", "{}", &options).unwrap();
        assert_eq!(store.options("feature-flags/a"), Some(options));
    }

    #[test]
    fn timeout_is_reported_as_store_error() {
        let timeout = Duration::from_millis(10);
        let fetcher = Fetcher::new(slow_store(Duration::from_millis(500)), Some(timeout));
        assert_eq!(fetcher.get("key"), Err(StoreError::Timeout(timeout)));
    }

    #[test]
    fn fast_reads_pass_through() {
        let store = slow_store(Duration::ZERO);
        let fetcher = Fetcher::new(store.clone(), Some(Duration::from_secs(5)));
        assert_eq!(fetcher.get("key"), Ok(Some("late".to_owned())));

        let fetcher = Fetcher::new(store.clone(), None);
        assert_eq!(fetcher.get("key"), Ok(Some("late".to_owned())));
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hung_store_holds_one_read_per_key() {
        let store = slow_store(Duration::from_secs(1));
        let fetcher = Fetcher::new(store.clone(), Some(Duration::from_millis(1)));

        for _ in 0..200 {
            assert!(matches!(fetcher.get("x"), Err(StoreError::Timeout(_))));
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.in_flight(), 1);

        assert!(fetcher.get("y").is_err());
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.in_flight(), 2);

        // Once the hung reads return, the next miss reads again.
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(fetcher.in_flight(), 0);
        assert!(fetcher.get("x").is_err());
        assert_eq!(store.reads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_misses_share_one_read() {
        let store = slow_store(Duration::from_millis(200));
        let fetcher = Fetcher::new(store.clone(), Some(Duration::from_secs(5)));
        let barrier = Barrier::new(8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    assert_eq!(fetcher.get("x"), Ok(Some("late".to_owned())));
                });
            }
        });
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }
}
