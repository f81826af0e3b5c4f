use std::{
    any::Any,
    borrow::Borrow,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    hash::Hash,
    marker::PhantomData,
    sync::Arc,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared, WeakShared},
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    FetchError, QueryOptions, QueryScope, QueryScopeTrait, QueryState,
    options_combine,
    query::Query,
    query_scope::ScopeCacheKey,
    utils::{KeyHash, new_cache_id, new_fetch_id},
};

pub(crate) type SharedFetch<O> = Shared<BoxFuture<'static, Result<O, FetchError>>>;
type WeakFetch<O> = WeakShared<BoxFuture<'static, Result<O, FetchError>>>;

/// Which fetch of a key is in flight. At most one fetch runs per key and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FetchSlot {
    Value,
    FirstPage,
    Page(u64),
}

#[derive(Debug)]
pub(crate) struct InFlight<K> {
    fetch_id: u64,
    key: K,
    // WeakFetch<O> for whatever output type the fetch in that slot produces.
    // Weak so the fetch is dropped along with its last caller.
    fetch: Box<dyn Any + Send>,
}

#[derive(Debug)]
pub(crate) struct Scope<K, V> {
    queries: HashMap<KeyHash, Query<K, V>>,
    in_flight: HashMap<(KeyHash, FetchSlot), InFlight<K>>,
}

impl<K, V> Default for Scope<K, V> {
    fn default() -> Self {
        Self {
            queries: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }
}

impl<K: PartialEq, V> Scope<K, V> {
    /// Entries are addressed by hash and confirmed by equality, a collision is a miss.
    pub fn get(&self, key_hash: &KeyHash, key: &K) -> Option<&Query<K, V>> {
        self.queries.get(key_hash).filter(|query| query.key == *key)
    }

    pub fn get_mut(&mut self, key_hash: &KeyHash, key: &K) -> Option<&mut Query<K, V>> {
        self.queries
            .get_mut(key_hash)
            .filter(|query| query.key == *key)
    }

    pub fn insert(&mut self, key_hash: KeyHash, query: Query<K, V>) {
        self.queries.insert(key_hash, query);
    }

    /// Forget a fetch, unless the slot was already taken over by a newer one.
    fn remove_in_flight(&mut self, slot: &(KeyHash, FetchSlot), fetch_id: u64) {
        if self
            .in_flight
            .get(slot)
            .is_some_and(|in_flight| in_flight.fetch_id == fetch_id)
        {
            self.in_flight.remove(slot);
        }
    }
}

pub(crate) trait ScopeTrait: Send + 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn invalidate_scope(&mut self);
    fn clear(&mut self);
    fn gc(&mut self, now: chrono::DateTime<chrono::Utc>) -> usize;
    fn size(&self) -> usize;
    fn is_idle(&self) -> bool;
}

impl<K: Send + 'static, V: Send + 'static> ScopeTrait for Scope<K, V> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn invalidate_scope(&mut self) {
        for query in self.queries.values_mut() {
            query.invalidate();
        }
    }

    // In-flight fetches are left to finish for their current callers, they'll find their entry gone
    // and discard their results. New callers start fresh fetches.
    fn clear(&mut self) {
        self.queries.clear();
        self.in_flight.clear();
    }

    fn gc(&mut self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let before = self.queries.len();
        self.queries.retain(|_, query| !query.gc_due(now));
        before - self.queries.len()
    }

    fn size(&self) -> usize {
        self.queries.len()
    }

    fn is_idle(&self) -> bool {
        self.queries.is_empty() && self.in_flight.is_empty()
    }
}

type Scopes = HashMap<ScopeCacheKey, Box<dyn ScopeTrait>>;

struct CacheInner {
    id: u64,
    scopes: Mutex<Scopes>,
}

/// Everything needed to run one coalesced fetch.
pub(crate) struct FetchRequest<K> {
    pub cache_key: ScopeCacheKey,
    pub name: Arc<str>,
    pub key: K,
    pub slot: FetchSlot,
    pub options: QueryOptions,
    /// Replace the entry's generation when the fetch starts, so fetches started before it are
    /// discarded.
    pub reset_generation: bool,
    /// Return [`FetchError::Superseded`] rather than the unapplied result when superseded.
    pub discard_superseded: bool,
}

#[derive(Debug, Clone, Copy)]
struct FetchTicket {
    entry_id: u64,
    generation: u64,
}

/// Owned by a running fetch. If the fetch is dropped before completing,
/// because every caller went away, releases its slot and its hold on the entry.
struct FetchDropGuard<K, V>
where
    K: PartialEq + Send + 'static,
    V: Send + 'static,
{
    cache: QueryCache,
    cache_key: ScopeCacheKey,
    key_hash: KeyHash,
    key: K,
    slot: FetchSlot,
    fetch_id: u64,
    // Set once the entry's fetching count was incremented.
    entry_id: Option<u64>,
    armed: bool,
    _phantom: PhantomData<fn() -> V>,
}

impl<K, V> FetchDropGuard<K, V>
where
    K: PartialEq + Send + 'static,
    V: Send + 'static,
{
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<K, V> Drop for FetchDropGuard<K, V>
where
    K: PartialEq + Send + 'static,
    V: Send + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cache
            .with_scope_mut::<K, V, _>(self.cache_key, false, |maybe_scope| {
                let Some(scope) = maybe_scope else {
                    return;
                };
                scope.remove_in_flight(&(self.key_hash, self.slot), self.fetch_id);
                if let Some(cached) = self.entry_id.and_then(|entry_id| {
                    scope
                        .get_mut(&self.key_hash, &self.key)
                        .filter(|cached| cached.entry_id == entry_id)
                }) {
                    cached.fetching = cached.fetching.saturating_sub(1);
                }
            });
        debug!(slot = ?self.slot, "fetch dropped before completing");
    }
}

/// The [`QueryCache`] stores all query data, and is used to fetch and manage queries.
///
/// It's a cheap handle: clones share the same underlying cache.
/// Every key is independent, the only coordination between callers is that
/// concurrent fetches of the same key (and page) are coalesced into one call.
///
/// # Example
///
/// ```rust,ignore
/// use primed_fetch::{QueryCache, QueryScope};
///
/// let cache = QueryCache::new();
/// let scope = QueryScope::new("user", |id: u64| async move { api.get_user(id).await });
/// let user = cache.fetch_query(&scope, 1).await?;
/// ```
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
    options: QueryOptions,
}

impl Debug for QueryCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("id", &self.inner.id)
            .field("options", &self.options)
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    /// Creates a new, empty [`QueryCache`].
    pub fn new() -> Self {
        Self::new_with_options(QueryOptions::default())
    }

    /// Create a new [`QueryCache`] with custom options.
    ///
    /// These options will be combined with any options for a specific query scope.
    pub fn new_with_options(options: QueryOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                id: new_cache_id(),
                scopes: Mutex::new(HashMap::new()),
            }),
            options,
        }
    }

    /// Read the base [`QueryOptions`] for this [`QueryCache`].
    ///
    /// These will be combined with any options for a specific query scope.
    pub fn options(&self) -> QueryOptions {
        self.options
    }

    /// Fetch a query, store it in the cache and return it.
    ///
    /// - Entry doesn't exist: fetched and stored in the cache.
    /// - Entry exists but stale: fetched and updated in the cache.
    /// - Entry exists and **not** stale: returned without fetching.
    ///
    /// If the same key is already being fetched, waits for that fetch rather than starting another.
    /// A failed fetch is never stored as fresh data, any previous value stays cached.
    pub async fn fetch_query<K, V>(
        &self,
        query_scope: &QueryScope<K, V>,
        key: impl Borrow<K>,
    ) -> Result<V, FetchError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let key = key.borrow();
        if let Some(cached) = self.fresh_cached::<K, V>(query_scope.cache_key(), key) {
            trace!(query = query_scope.name(), "cache hit");
            return Ok(cached);
        }
        self.fetch_value(query_scope, key.clone()).await
    }

    /// Prefetch a query and store it in the cache.
    ///
    /// Same as [`QueryCache::fetch_query`], without cloning out the value.
    pub async fn prefetch_query<K, V>(
        &self,
        query_scope: &QueryScope<K, V>,
        key: impl Borrow<K>,
    ) -> Result<(), FetchError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let key = key.borrow();
        let is_fresh = self.with_query::<K, V, _>(query_scope.cache_key(), key, |maybe_query| {
            maybe_query.is_some_and(|query| !query.stale())
        });
        if !is_fresh {
            self.fetch_value(query_scope, key.clone()).await?;
        }
        Ok(())
    }

    fn fetch_value<K, V>(&self, query_scope: &QueryScope<K, V>, key: K) -> SharedFetch<V>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let query_scope = query_scope.clone();
        let attempt_key = key.clone();
        self.fetch_coalesced::<K, V, V>(
            FetchRequest {
                cache_key: query_scope.cache_key(),
                name: query_scope.shared_name(),
                key,
                slot: FetchSlot::Value,
                options: options_combine(self.options, query_scope.options()),
                reset_generation: false,
                discard_superseded: false,
            },
            move || query_scope.query(attempt_key.clone()),
            |query, value| {
                query.set_value(value.clone());
                Ok(())
            },
        )
    }

    /// Set the value of a query in the cache, marking it fresh.
    ///
    /// A fetch of the key already in flight won't overwrite this value.
    pub fn set_query<K, V>(
        &self,
        query_scope: impl QueryScopeTrait<K, V>,
        key: impl Borrow<K>,
        new_value: V,
    ) where
        K: Clone + Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        let key = key.borrow();
        let key_hash = KeyHash::new(key);
        let options = options_combine(self.options, query_scope.options());
        self.with_scope_mut::<K, V, _>(query_scope.cache_key(), true, |maybe_scope| {
            let scope = maybe_scope.expect("provided a default");
            if let Some(cached) = scope.get_mut(&key_hash, key) {
                cached.set_value(new_value);
                cached.reset_generation();
                cached.touch();
            } else {
                scope.insert(key_hash, Query::with_value(key.clone(), new_value, options));
            }
        });
    }

    /// Update the value of a query in the cache with a callback.
    ///
    /// The callback takes `Option<&mut V>`, will be None if no value is cached for the key.
    /// If a value was modified, it is marked fresh.
    ///
    /// Returns the output of the callback.
    pub fn update_query<K, V, T>(
        &self,
        query_scope: impl QueryScopeTrait<K, V>,
        key: impl Borrow<K>,
        modifier: impl FnOnce(Option<&mut V>) -> T,
    ) -> T
    where
        K: Clone + Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        let key = key.borrow();
        let key_hash = KeyHash::new(key);
        self.with_scope_mut::<K, V, _>(query_scope.cache_key(), false, |maybe_scope| {
            match maybe_scope
                .and_then(|scope| scope.get_mut(&key_hash, key))
                .and_then(|cached| cached.value.take().map(|value| (cached, value)))
            {
                Some((cached, mut value)) => {
                    let return_value = modifier(Some(&mut value));
                    cached.set_value(value);
                    cached.reset_generation();
                    cached.touch();
                    return_value
                }
                None => modifier(None),
            }
        })
    }

    /// Synchronously get a query's value from the cache, if it exists, whether stale or not.
    pub fn get_cached_query<K, V>(
        &self,
        query_scope: impl QueryScopeTrait<K, V>,
        key: impl Borrow<K>,
    ) -> Option<V>
    where
        K: Eq + Hash + Send + 'static,
        V: Clone + Send + 'static,
    {
        self.with_query::<K, V, _>(query_scope.cache_key(), key.borrow(), |maybe_query| {
            maybe_query.and_then(|query| query.value.clone())
        })
    }

    /// Synchronously check if a query's value exists in the cache.
    pub fn query_exists<K, V>(
        &self,
        query_scope: impl QueryScopeTrait<K, V>,
        key: impl Borrow<K>,
    ) -> bool
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        self.with_query::<K, V, _>(query_scope.cache_key(), key.borrow(), |maybe_query| {
            maybe_query.is_some_and(|query| query.value.is_some())
        })
    }

    /// The status, error and timestamps of a query, `None` if the cache has never seen the key.
    pub fn query_state<K, V>(
        &self,
        query_scope: impl QueryScopeTrait<K, V>,
        key: impl Borrow<K>,
    ) -> Option<QueryState>
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        self.with_query::<K, V, _>(query_scope.cache_key(), key.borrow(), |maybe_query| {
            maybe_query.map(|query| query.state())
        })
    }

    /// Mark a query as stale. The next time it's accessed it'll be refetched.
    ///
    /// The cached value stays available until then. Fetches of the key already in flight
    /// are no longer stored when they complete.
    ///
    /// Returns `true` if the query existed.
    pub fn invalidate_query<K, V>(
        &self,
        query_scope: impl QueryScopeTrait<K, V>,
        key: impl Borrow<K>,
    ) -> bool
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        let key = key.borrow();
        let key_hash = KeyHash::new(key);
        let invalidated =
            self.with_scope_mut::<K, V, _>(query_scope.cache_key(), false, |maybe_scope| {
                maybe_scope
                    .and_then(|scope| scope.get_mut(&key_hash, key))
                    .map(|cached| cached.invalidate())
                    .is_some()
            });
        if invalidated {
            debug!(query = query_scope.name(), "invalidated query");
        }
        invalidated
    }

    /// Mark all queries of a specific scope as stale.
    pub fn invalidate_query_type<K, V>(&self, query_scope: impl QueryScopeTrait<K, V>) {
        if let Some(scope) = self.inner.scopes.lock().get_mut(&query_scope.cache_key()) {
            scope.invalidate_scope();
        }
        debug!(query = query_scope.name(), "invalidated query type");
    }

    /// Mark all queries as stale. The next time any query is accessed it'll be refetched.
    pub fn invalidate_all_queries(&self) {
        for scope in self.inner.scopes.lock().values_mut() {
            scope.invalidate_scope();
        }
        debug!("invalidated all queries");
    }

    /// Empty the cache, note [`QueryCache::invalidate_all_queries`] is preferred in most cases
    /// as it keeps serving the previous data until refetched.
    pub fn clear(&self) {
        for scope in self.inner.scopes.lock().values_mut() {
            scope.clear();
        }
        debug!("cleared query cache");
    }

    /// Remove every query that isn't being fetched and hasn't been accessed for longer than
    /// its gc time.
    ///
    /// Returns the number of queries removed.
    pub fn gc(&self) -> usize {
        let now = chrono::Utc::now();
        let mut guard = self.inner.scopes.lock();
        let removed = guard.values_mut().map(|scope| scope.gc(now)).sum();
        guard.retain(|_, scope| !scope.is_idle());
        trace!(removed, "garbage collected queries");
        removed
    }

    /// The number of queries in the cache.
    pub fn size(&self) -> usize {
        self.inner
            .scopes
            .lock()
            .values()
            .map(|scope| scope.size())
            .sum()
    }

    pub(crate) fn fresh_cached<K, V>(&self, cache_key: ScopeCacheKey, key: &K) -> Option<V>
    where
        K: Eq + Hash + Send + 'static,
        V: Clone + Send + 'static,
    {
        let key_hash = KeyHash::new(key);
        self.with_scope_mut::<K, V, _>(cache_key, false, |maybe_scope| {
            let cached = maybe_scope?.get_mut(&key_hash, key)?;
            cached.touch();
            cached.fresh_value().cloned()
        })
    }

    pub(crate) fn with_query<K, V, T>(
        &self,
        cache_key: ScopeCacheKey,
        key: &K,
        cb: impl FnOnce(Option<&Query<K, V>>) -> T,
    ) -> T
    where
        K: Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        let key_hash = KeyHash::new(key);
        let guard = self.inner.scopes.lock();
        let maybe_query = guard.get(&cache_key).and_then(|scope| {
            scope
                .as_any()
                .downcast_ref::<Scope<K, V>>()
                .expect("Cache entry type mismatch.")
                .get(&key_hash, key)
        });
        cb(maybe_query)
    }

    pub(crate) fn with_scope_mut<K, V, T>(
        &self,
        cache_key: ScopeCacheKey,
        create_scope_if_missing: bool,
        cb: impl FnOnce(Option<&mut Scope<K, V>>) -> T,
    ) -> T
    where
        K: Send + 'static,
        V: Send + 'static,
    {
        let mut guard = self.inner.scopes.lock();
        if create_scope_if_missing {
            guard
                .entry(cache_key)
                .or_insert_with(|| Box::new(Scope::<K, V>::default()));
        }
        cb(guard.get_mut(&cache_key).map(|scope| {
            scope
                .as_any_mut()
                .downcast_mut::<Scope<K, V>>()
                .expect("Cache entry type mismatch.")
        }))
    }

    /// Join the fetch in flight for this key and slot, or start a new one.
    ///
    /// `attempt` is called once, plus once per retry. When it succeeds and the entry hasn't been
    /// superseded in the meantime, `apply` stores the result on the entry.
    pub(crate) fn fetch_coalesced<K, V, O>(
        &self,
        request: FetchRequest<K>,
        attempt: impl Fn() -> BoxFuture<'static, Result<O, FetchError>> + Send + Sync + 'static,
        apply: impl FnOnce(&mut Query<K, V>, &O) -> Result<(), FetchError> + Send + 'static,
    ) -> SharedFetch<O>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Send + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let key_hash = KeyHash::new(&request.key);
        let slot = (key_hash, request.slot);
        self.with_scope_mut::<K, V, _>(request.cache_key, true, |maybe_scope| {
            let scope = maybe_scope.expect("provided a default");
            let mut register = true;
            if let Some(existing) = scope.in_flight.get(&slot) {
                if existing.key == request.key {
                    let joined = existing
                        .fetch
                        .downcast_ref::<WeakFetch<O>>()
                        .expect("In-flight fetch type mismatch.")
                        .upgrade();
                    if let Some(fetch) = joined {
                        trace!(
                            query = %request.name,
                            slot = ?request.slot,
                            "joining in-flight fetch"
                        );
                        return fetch;
                    }
                } else {
                    // Another key with the same hash holds the slot, run this one on its own.
                    register = false;
                }
            }

            let fetch_id = new_fetch_id();
            let guard = FetchDropGuard::<K, V> {
                cache: self.clone(),
                cache_key: request.cache_key,
                key_hash,
                key: request.key.clone(),
                slot: request.slot,
                fetch_id,
                entry_id: None,
                armed: true,
                _phantom: PhantomData,
            };
            let key = request.key.clone();
            let cache = self.clone();
            let fetch = async move { cache.run_fetch(request, guard, attempt, apply).await }
                .boxed()
                .shared();
            if register {
                if let Some(weak) = fetch.downgrade() {
                    scope.in_flight.insert(
                        slot,
                        InFlight {
                            fetch_id,
                            key,
                            fetch: Box::new(weak),
                        },
                    );
                }
            }
            fetch
        })
    }

    async fn run_fetch<K, V, O>(
        self,
        request: FetchRequest<K>,
        mut guard: FetchDropGuard<K, V>,
        attempt: impl Fn() -> BoxFuture<'static, Result<O, FetchError>> + Send + Sync + 'static,
        apply: impl FnOnce(&mut Query<K, V>, &O) -> Result<(), FetchError> + Send + 'static,
    ) -> Result<O, FetchError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        V: Send + 'static,
        O: Clone + Send + Sync + 'static,
    {
        let key_hash = guard.key_hash;
        let ticket = self.begin_fetch::<K, V>(&request, key_hash);
        guard.entry_id = Some(ticket.entry_id);

        debug!(query = %request.name, slot = ?request.slot, "fetching");
        let mut retries_left = request.options.retry();
        let result = loop {
            match attempt().await {
                Err(e) if retries_left > 0 && e.is_retryable() => {
                    retries_left -= 1;
                    warn!(
                        query = %request.name,
                        slot = ?request.slot,
                        error = %e,
                        retries_left,
                        "fetch failed, retrying"
                    );
                }
                result => break result,
            }
        };

        guard.disarm();
        self.with_scope_mut::<K, V, _>(request.cache_key, false, |maybe_scope| {
            let superseded = |result: Result<O, FetchError>| {
                debug!(
                    query = %request.name,
                    slot = ?request.slot,
                    "fetch superseded, result not stored"
                );
                if request.discard_superseded {
                    result.and(Err(FetchError::Superseded))
                } else {
                    result
                }
            };
            let Some(scope) = maybe_scope else {
                return superseded(result);
            };
            scope.remove_in_flight(&(key_hash, request.slot), guard.fetch_id);
            let Some(cached) = scope
                .get_mut(&key_hash, &request.key)
                .filter(|cached| cached.entry_id == ticket.entry_id)
            else {
                return superseded(result);
            };
            cached.fetching = cached.fetching.saturating_sub(1);
            cached.touch();
            if cached.generation != ticket.generation {
                return superseded(result);
            }
            match result {
                Ok(value) => {
                    apply(cached, &value)?;
                    debug!(query = %request.name, slot = ?request.slot, "fetch complete");
                    Ok(value)
                }
                Err(e) => {
                    warn!(query = %request.name, slot = ?request.slot, error = %e, "fetch failed");
                    cached.error = Some(e.clone());
                    Err(e)
                }
            }
        })
    }

    fn begin_fetch<K, V>(&self, request: &FetchRequest<K>, key_hash: KeyHash) -> FetchTicket
    where
        K: Clone + Eq + Hash + Send + 'static,
        V: Send + 'static,
    {
        self.with_scope_mut::<K, V, _>(request.cache_key, true, |maybe_scope| {
            let scope = maybe_scope.expect("provided a default");
            if scope.get(&key_hash, &request.key).is_none() {
                scope.insert(key_hash, Query::new(request.key.clone(), request.options));
            }
            let cached = scope
                .get_mut(&key_hash, &request.key)
                .expect("inserted above");
            cached.combined_options = request.options;
            cached.fetching += 1;
            cached.touch();
            if request.reset_generation {
                cached.reset_generation();
            }
            FetchTicket {
                entry_id: cached.entry_id,
                generation: cached.generation,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use rstest::*;

    use super::*;
    use crate::QueryStatus;

    const DEFAULT_FETCHER_MS: u64 = 30;

    fn default_fetcher() -> (QueryScope<u64, u64>, Arc<AtomicUsize>) {
        let fetch_calls = Arc::new(AtomicUsize::new(0));
        let scope = QueryScope::new("double", {
            let fetch_calls = fetch_calls.clone();
            move |key: u64| {
                let fetch_calls = fetch_calls.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(DEFAULT_FETCHER_MS)).await;
                    fetch_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(key * 2)
                }
            }
        });
        (scope, fetch_calls)
    }

    /// Fails the first `failures` calls, then succeeds.
    fn flaky_fetcher(failures: usize) -> (QueryScope<u64, u64>, Arc<AtomicUsize>) {
        let fetch_calls = Arc::new(AtomicUsize::new(0));
        let scope = QueryScope::new("flaky", {
            let fetch_calls = fetch_calls.clone();
            move |key: u64| {
                let call = fetch_calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    tokio::time::sleep(Duration::from_millis(DEFAULT_FETCHER_MS)).await;
                    if call < failures {
                        Err(FetchError::network("connection reset"))
                    } else {
                        Ok(key * 2)
                    }
                }
            }
        });
        (scope, fetch_calls)
    }

    /// fetch_query
    /// prefetch_query
    /// set_query
    /// update_query
    /// get_cached_query
    /// query_exists
    #[tokio::test]
    async fn test_declaratives() {
        crate::test::identify_parking_lot_deadlocks();
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();

        let key = 1;
        assert!(!cache.query_exists(&scope, key));
        cache.set_query(&scope, key, 1);
        assert_eq!(cache.get_cached_query(&scope, key), Some(1));
        assert!(cache.update_query(&scope, key, |value| value
            .map(|v| {
                *v = 2;
                true
            })
            .unwrap_or(false)));
        assert_eq!(cache.get_cached_query(&scope, key), Some(2));
        // Set values are fresh, so no fetch happens:
        assert_eq!(cache.fetch_query(&scope, key).await, Ok(2));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 0);
        assert!(cache.query_exists(&scope, key));

        // Updating a missing key gives None to the callback:
        assert!(!cache.update_query(&scope, 99, |value| value.is_some()));
        assert!(!cache.query_exists(&scope, 99));

        let key = 2;
        cache.prefetch_query(&scope, key).await.unwrap();
        assert_eq!(cache.get_cached_query(&scope, key), Some(4));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 1);
        cache.clear();
        assert_eq!(cache.size(), 0);

        let key = 3;
        assert_eq!(cache.fetch_query(&scope, key).await, Ok(6));
        assert!(cache.query_exists(&scope, key));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
    }

    /// Cached values are served until stale, then refetched.
    #[tokio::test]
    async fn test_stale_time() {
        const STALE_MS: u64 = 100;
        let (scope, fetch_calls) = default_fetcher();
        let scope = scope.set_options(
            QueryOptions::new().set_stale_time(Duration::from_millis(STALE_MS)),
        );
        let cache = QueryCache::new();

        assert_eq!(cache.fetch_query(&scope, 2).await, Ok(4));
        assert_eq!(cache.fetch_query(&scope, 2).await, Ok(4));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_millis(STALE_MS + 10)).await;
        assert!(cache.query_state(&scope, 2).unwrap().stale);
        assert_eq!(cache.fetch_query(&scope, 2).await, Ok(4));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
    }

    /// Distinct keys never share cached state.
    #[tokio::test]
    async fn test_keys_are_independent() {
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();

        assert_eq!(cache.fetch_query(&scope, 1).await, Ok(2));
        assert_eq!(cache.fetch_query(&scope, 2).await, Ok(4));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
        assert_eq!(cache.size(), 2);

        assert!(cache.invalidate_query(&scope, 1));
        assert!(cache.query_state(&scope, 1).unwrap().stale);
        assert!(!cache.query_state(&scope, 2).unwrap().stale);
        assert!(!cache.invalidate_query(&scope, 3));
    }

    /// Same fetcher under a different name is a different query.
    #[tokio::test]
    async fn test_scope_name_is_part_of_key() {
        let (scope, _fetch_calls) = default_fetcher();
        let cache = QueryCache::new();
        cache.set_query(&scope, 1, 100);

        let other = QueryScope::new("other", |key: u64| async move { Ok(key * 2) });
        assert_eq!(cache.get_cached_query(&other, 1), None);
        assert_eq!(cache.fetch_query(&other, 1).await, Ok(2));
        assert_eq!(cache.get_cached_query(&scope, 1), Some(100));
    }

    /// Concurrent requests for the same key share one fetch.
    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        crate::test::identify_parking_lot_deadlocks();
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();

        let results =
            futures::future::join_all((0..5).map(|_| cache.fetch_query(&scope, 3))).await;

        assert!(results.iter().all(|result| *result == Ok(6)));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 1);
    }

    /// A failure is shared by every coalesced caller and never cached as fresh.
    #[tokio::test]
    async fn test_failure_not_cached() {
        let (scope, fetch_calls) = flaky_fetcher(1);
        let cache = QueryCache::new();

        let results =
            futures::future::join_all((0..3).map(|_| cache.fetch_query(&scope, 1))).await;
        for result in results {
            assert_eq!(result, Err(FetchError::network("connection reset")));
        }
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 1);

        let state = cache.query_state(&scope, 1).unwrap();
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.stale);
        assert!(!cache.query_exists(&scope, 1));

        // Next access tries again:
        assert_eq!(cache.fetch_query(&scope, 1).await, Ok(2));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
        let state = cache.query_state(&scope, 1).unwrap();
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.error, None);
    }

    #[rstest]
    #[case::no_retry(0, 2, Err(FetchError::network("connection reset")), 1)]
    #[case::enough_retries(2, 2, Ok(2), 3)]
    #[case::too_few_retries(1, 2, Err(FetchError::network("connection reset")), 2)]
    #[tokio::test]
    async fn test_retry(
        #[case] retry: u32,
        #[case] failures: usize,
        #[case] expected: Result<u64, FetchError>,
        #[case] expected_calls: usize,
    ) {
        let (scope, fetch_calls) = flaky_fetcher(failures);
        let cache = QueryCache::new_with_options(QueryOptions::new().set_retry(retry));

        assert_eq!(cache.fetch_query(&scope, 1).await, expected);
        assert_eq!(fetch_calls.load(Ordering::Relaxed), expected_calls);
    }

    /// A value fetched before an invalidation completes is returned but not stored.
    #[tokio::test]
    async fn test_invalidation_during_fetch() {
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();
        cache.set_query(&scope, 1, 100);
        cache.invalidate_query(&scope, 1);

        let fetch = cache.fetch_query(&scope, 1);
        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(DEFAULT_FETCHER_MS / 3)).await;
            cache.invalidate_query(&scope, 1);
        };
        let (result, ()) = futures::future::join(fetch, invalidate).await;

        assert_eq!(result, Ok(2));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 1);
        // Previous value kept, still stale:
        assert_eq!(cache.get_cached_query(&scope, 1), Some(100));
        assert!(cache.query_state(&scope, 1).unwrap().stale);
    }

    /// A fetch whose every caller went away stops, and leaves nothing marked as fetching.
    #[tokio::test]
    async fn test_dropped_fetch_releases_query() {
        crate::test::identify_parking_lot_deadlocks();
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(5), cache.fetch_query(&scope, 1)).await;
        assert!(timed_out.is_err());

        let state = cache.query_state(&scope, 1).unwrap();
        assert_eq!(state.status, QueryStatus::Idle);
        assert!(!state.is_fetching());

        // Not joined onto the dropped fetch:
        assert_eq!(cache.fetch_query(&scope, 1).await, Ok(2));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
        assert_eq!(cache.get_cached_query(&scope, 1), Some(2));
    }

    /// Clearing forgets fetches in flight, later callers start their own.
    #[tokio::test]
    async fn test_clear_during_fetch() {
        crate::test::identify_parking_lot_deadlocks();
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();

        let fetch = cache.fetch_query(&scope, 1);
        let clear_then_fetch = async {
            tokio::time::sleep(Duration::from_millis(DEFAULT_FETCHER_MS / 3)).await;
            cache.clear();
            cache.fetch_query(&scope, 1).await
        };
        let (first, second) = futures::future::join(fetch, clear_then_fetch).await;

        assert_eq!(first, Ok(2));
        assert_eq!(second, Ok(2));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
        assert!(cache.query_exists(&scope, 1));
        assert!(!cache.query_state(&scope, 1).unwrap().is_fetching());
    }

    /// Distinct keys never share a fetch, even when their hashes collide.
    #[tokio::test]
    async fn test_colliding_keys_fetch_separately() {
        #[derive(Debug, Clone, PartialEq, Eq)]
        struct Colliding(u64);

        impl std::hash::Hash for Colliding {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                0_u8.hash(state);
            }
        }

        let fetch_calls = Arc::new(AtomicUsize::new(0));
        let scope = QueryScope::new("colliding", {
            let fetch_calls = fetch_calls.clone();
            move |key: Colliding| {
                fetch_calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    tokio::time::sleep(Duration::from_millis(DEFAULT_FETCHER_MS)).await;
                    Ok(key.0 * 2)
                }
            }
        });
        let cache = QueryCache::new();

        let (a, b) = futures::future::join(
            cache.fetch_query(&scope, Colliding(1)),
            cache.fetch_query(&scope, Colliding(2)),
        )
        .await;
        assert_eq!(a, Ok(2));
        assert_eq!(b, Ok(4));
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_invalidation_types(#[values(false, true)] all: bool) {
        let (scope, fetch_calls) = default_fetcher();
        let cache = QueryCache::new();
        for key in 0..3 {
            cache.fetch_query(&scope, key).await.unwrap();
        }
        if all {
            cache.invalidate_all_queries();
        } else {
            cache.invalidate_query_type(&scope);
        }
        for key in 0..3 {
            let state = cache.query_state(&scope, key).unwrap();
            assert!(state.invalidated);
            // Data is kept until refetched:
            assert_eq!(cache.get_cached_query(&scope, key), Some(key * 2));
        }
        cache.fetch_query(&scope, 0).await.unwrap();
        assert_eq!(fetch_calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_gc() {
        const GC_TIME_MS: u64 = 100;
        let (scope, _fetch_calls) = default_fetcher();
        let scope = scope.set_options(
            QueryOptions::new().set_gc_time(Duration::from_millis(GC_TIME_MS)),
        );
        let cache = QueryCache::new();
        cache.fetch_query(&scope, 1).await.unwrap();
        cache.fetch_query(&scope, 2).await.unwrap();

        assert_eq!(cache.gc(), 0);
        assert_eq!(cache.size(), 2);

        tokio::time::sleep(Duration::from_millis(GC_TIME_MS / 2)).await;
        // Fetching keeps a query alive:
        cache.fetch_query(&scope, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(GC_TIME_MS / 2 + 30)).await;

        assert_eq!(cache.gc(), 1);
        assert!(cache.query_exists(&scope, 1));
        assert!(!cache.query_exists(&scope, 2));
    }
}
