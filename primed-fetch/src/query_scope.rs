use std::{
    any::TypeId,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};

use crate::{FetchError, QueryOptions};

/// Identifies the storage for one query scope inside a [`crate::QueryCache`].
///
/// Derived from the scope's logical name and its key/value types,
/// so two scopes sharing a name and types share cached entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeCacheKey(u64);

impl ScopeCacheKey {
    pub(crate) fn new<K: 'static, V: 'static>(name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        TypeId::of::<(K, V)>().hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl Hash for ScopeCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Implemented by every scope the [`crate::QueryCache`] can store entries for.
///
/// `V` is the type stored per key, for paginated scopes that's the accumulated
/// [`crate::InfinitePages`].
pub trait QueryScopeTrait<K, V> {
    /// The logical name of the query.
    fn name(&self) -> &str;

    /// The options specific to this scope, if any.
    fn options(&self) -> Option<QueryOptions>;

    /// Where the scope's entries are stored.
    fn cache_key(&self) -> ScopeCacheKey;
}

impl<K, V, S> QueryScopeTrait<K, V> for &S
where
    S: QueryScopeTrait<K, V>,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn options(&self) -> Option<QueryOptions> {
        (**self).options()
    }

    fn cache_key(&self) -> ScopeCacheKey {
        (**self).cache_key()
    }
}

type Fetcher<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V, FetchError>> + Send + Sync>;

/// A named query function. Together with a key `K`, identifies one cached query:
/// the query key is `(name, key)`.
///
/// Specific [`QueryOptions`] set here are combined with the [`crate::QueryCache`]'s options,
/// with the scope's taking precedence.
#[derive(Clone)]
pub struct QueryScope<K, V> {
    name: Arc<str>,
    fetcher: Fetcher<K, V>,
    options: Option<QueryOptions>,
    cache_key: ScopeCacheKey,
}

impl<K, V> Debug for QueryScope<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryScope")
            .field("name", &self.name)
            .field("fetcher", &"Arc<dyn Fn(K) -> BoxFuture<Result<V, FetchError>>>")
            .field("options", &self.options)
            .finish()
    }
}

impl<K, V> QueryScope<K, V>
where
    K: 'static,
    V: 'static,
{
    /// Create a new [`QueryScope`] with the logical `name` of the query.
    ///
    /// If the query fn does not need parameters, use `K=()`.
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, fetcher: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let name = name.into();
        Self {
            cache_key: ScopeCacheKey::new::<K, V>(&name),
            name,
            fetcher: Arc::new(move |key| fetcher(key).boxed()),
            options: None,
        }
    }

    /// Set specific [`QueryOptions`] to only apply to this query scope.
    #[track_caller]
    pub fn set_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn query(&self, key: K) -> BoxFuture<'static, Result<V, FetchError>> {
        (self.fetcher)(key)
    }
}

impl<K, V> QueryScopeTrait<K, V> for QueryScope<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> Option<QueryOptions> {
        self.options
    }

    fn cache_key(&self) -> ScopeCacheKey {
        self.cache_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_depends_on_name_and_types() {
        let a = ScopeCacheKey::new::<u64, u64>("problems");
        assert_eq!(a, ScopeCacheKey::new::<u64, u64>("problems"));
        assert_ne!(a, ScopeCacheKey::new::<u64, u64>("problems-metadata"));
        assert_ne!(a, ScopeCacheKey::new::<u64, String>("problems"));
    }

    #[tokio::test]
    async fn test_query_calls_fetcher() {
        let scope = QueryScope::new("double", |key: u64| async move { Ok(key * 2) });
        assert_eq!(scope.name(), "double");
        assert_eq!(scope.options(), None);
        assert_eq!(scope.query(4).await, Ok(8));

        let scope = scope.set_options(QueryOptions::new().set_retry(1));
        assert_eq!(scope.options().map(|o| o.retry()), Some(1));
    }
}
