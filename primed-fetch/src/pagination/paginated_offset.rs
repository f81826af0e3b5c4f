use std::{
    borrow::Borrow,
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    sync::Arc,
};

use futures::{FutureExt, future::BoxFuture};
use tracing::{trace, warn};

use crate::{
    FetchError, InfinitePages, Page, PagedSource, QueryCache, QueryOptions, QueryScopeTrait,
    QueryState, QueryStatus,
    cache::{FetchRequest, FetchSlot, SharedFetch},
    options_combine,
    query_scope::ScopeCacheKey,
};

type PageFetcher<K, T> =
    Arc<dyn Fn(K, u64) -> BoxFuture<'static, Result<Page<T>, FetchError>> + Send + Sync>;
type NextPageParam<T> = Arc<dyn Fn(&Page<T>) -> Option<u64> + Send + Sync>;

/// A named, offset-paginated query function.
///
/// The getter receives:
/// - `key: K` - the query parameters, the same across all pages
/// - `page_param: u64` - the offset to fetch from, the initial page param (`0` by default) for
///   the first page
///
/// After each page, the next page param is computed from the page, by default with
/// [`Page::next_offset`]: `offset + limit` while `has_more`, otherwise no further pages.
///
/// # Example
///
/// ```rust,ignore
/// use primed_fetch::{InfiniteQueryScope, QueryCache};
///
/// let scope = InfiniteQueryScope::new("problems", |filters: ProblemFilters, offset| async move {
///     api.get_problems(&filters, offset).await
/// });
///
/// let problems = cache.paginated_query(&scope, filters);
/// while let Some(page) = problems.fetch_next().await? {
///     // ...
/// }
/// ```
pub struct InfiniteQueryScope<K, T> {
    name: Arc<str>,
    fetcher: PageFetcher<K, T>,
    next_page_param: NextPageParam<T>,
    initial_page_param: u64,
    options: Option<QueryOptions>,
    cache_key: ScopeCacheKey,
}

impl<K, T> Clone for InfiniteQueryScope<K, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            fetcher: self.fetcher.clone(),
            next_page_param: self.next_page_param.clone(),
            initial_page_param: self.initial_page_param,
            options: self.options,
            cache_key: self.cache_key,
        }
    }
}

impl<K, T> Debug for InfiniteQueryScope<K, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryScope")
            .field("name", &self.name)
            .field("initial_page_param", &self.initial_page_param)
            .field("options", &self.options)
            .finish()
    }
}

impl<K, T> InfiniteQueryScope<K, T>
where
    K: 'static,
    T: 'static,
{
    /// Create an offset-paginated query scope with the logical `name` of the query.
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, getter: F) -> Self
    where
        F: Fn(K, u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Page<T>, FetchError>> + Send + 'static,
    {
        let name = name.into();
        Self {
            cache_key: ScopeCacheKey::new::<K, InfinitePages<T>>(&name),
            name,
            fetcher: Arc::new(move |key, page_param| getter(key, page_param).boxed()),
            next_page_param: Arc::new(Page::next_offset),
            initial_page_param: 0,
            options: None,
        }
    }

    /// Override how the next page param is computed from the last fetched page.
    ///
    /// Returning `None` marks the sequence as exhausted.
    pub fn set_next_page_param(
        mut self,
        next_page_param: impl Fn(&Page<T>) -> Option<u64> + Send + Sync + 'static,
    ) -> Self {
        self.next_page_param = Arc::new(next_page_param);
        self
    }

    /// Set the page param used for the first page. Default: `0`.
    pub fn set_initial_page_param(mut self, initial_page_param: u64) -> Self {
        self.initial_page_param = initial_page_param;
        self
    }

    /// Set specific [`QueryOptions`] to only apply to this query scope.
    ///
    /// Staleness applies to the sequence as a whole, from when its first page was fetched.
    #[track_caller]
    pub fn set_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// The page param used for the first page.
    pub fn initial_page_param(&self) -> u64 {
        self.initial_page_param
    }

    /// The page param following `page`, `None` if it's the last page.
    pub fn next_page_param(&self, page: &Page<T>) -> Option<u64> {
        (self.next_page_param)(page)
    }

    /// Next page param after the last of `pages`, only if it moves forward.
    fn next_after(&self, pages: &InfinitePages<T>) -> Option<u64> {
        let (last_param, last_page) = pages.last()?;
        match self.next_page_param(last_page) {
            Some(next) if next > last_param => Some(next),
            Some(next) => {
                warn!(
                    query = %self.name,
                    last_param,
                    next,
                    "next page param doesn't move forward, treating as exhausted"
                );
                None
            }
            None => None,
        }
    }

    fn query(&self, key: K, page_param: u64) -> BoxFuture<'static, Result<Page<T>, FetchError>> {
        (self.fetcher)(key, page_param)
    }
}

impl<K, T> QueryScopeTrait<K, InfinitePages<T>> for InfiniteQueryScope<K, T> {
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

impl QueryCache {
    /// A handle to one key's page sequence. Creating it doesn't fetch anything.
    pub fn paginated_query<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: K,
    ) -> PaginatedQuery<K, T> {
        PaginatedQuery {
            cache: self.clone(),
            scope: query_scope.clone(),
            key,
        }
    }

    /// Get the accumulated pages for a key, fetching the first page if needed.
    ///
    /// - No pages cached: the first page is fetched.
    /// - Pages cached but stale: the sequence restarts, the first page is refetched and replaces
    ///   all pages.
    /// - Pages cached and **not** stale: returned without fetching.
    pub async fn fetch_infinite_query<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: impl Borrow<K>,
    ) -> Result<InfinitePages<T>, FetchError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let key = key.borrow();
        if let Some(cached) =
            self.fresh_cached::<K, InfinitePages<T>>(query_scope.cache_key(), key)
        {
            trace!(query = query_scope.name(), "cache hit");
            return Ok(cached);
        }
        let page = self.fetch_first_page(query_scope, key.clone()).await?;
        Ok(InfinitePages::first(query_scope.initial_page_param(), page))
    }

    /// Fetch the page after the last fetched page of a key, appending it to the cached pages.
    ///
    /// Fetches the first page if none has been fetched successfully yet.
    /// Returns `None` without fetching once the last fetched page has no next page param.
    ///
    /// On failure, the pages fetched so far are kept, and the error is recorded on the query.
    /// If the sequence is restarted, invalidated or cleared while the page is in flight,
    /// the page is discarded and [`FetchError::Superseded`] returned.
    pub async fn fetch_next_page<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: impl Borrow<K>,
    ) -> Result<Option<Page<T>>, FetchError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let key = key.borrow();
        let last = self.with_query::<K, InfinitePages<T>, _>(
            query_scope.cache_key(),
            key,
            |maybe_query| {
                let pages = maybe_query?.value.as_ref()?;
                let (last_param, _) = pages.last()?;
                Some((pages.len(), last_param, query_scope.next_after(pages)))
            },
        );
        match last {
            None => Ok(Some(self.fetch_first_page(query_scope, key.clone()).await?)),
            Some((_, _, None)) => {
                trace!(query = query_scope.name(), "no more pages");
                Ok(None)
            }
            Some((nb_pages, last_param, Some(next_param))) => {
                let attempt = {
                    let query_scope = query_scope.clone();
                    let key = key.clone();
                    move || query_scope.query(key.clone(), next_param)
                };
                let page = self
                    .fetch_coalesced::<K, InfinitePages<T>, Page<T>>(
                        FetchRequest {
                            cache_key: query_scope.cache_key(),
                            name: query_scope.name.clone(),
                            key: key.clone(),
                            slot: FetchSlot::Page(next_param),
                            options: options_combine(self.options(), query_scope.options()),
                            reset_generation: false,
                            discard_superseded: true,
                        },
                        attempt,
                        move |query, page| match query.value.as_mut() {
                            // Only append directly after the page this one was requested from:
                            Some(pages)
                                if pages.len() == nb_pages
                                    && pages.last().map(|(param, _)| param) == Some(last_param) =>
                            {
                                pages.push(next_param, page.clone());
                                query.error = None;
                                Ok(())
                            }
                            _ => Err(FetchError::Superseded),
                        },
                    )
                    .await?;
                Ok(Some(page))
            }
        }
    }

    /// Restart a key's sequence: refetch the first page, which replaces all accumulated pages
    /// once it arrives.
    ///
    /// Until then the previous pages stay available, and are kept if the refetch fails.
    /// Pages still in flight from before the restart are discarded.
    pub async fn refresh_infinite_query<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: impl Borrow<K>,
    ) -> Result<Page<T>, FetchError>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.fetch_first_page(query_scope, key.borrow().clone())
            .await
    }

    /// Synchronously get the pages accumulated for a key, whether stale or not.
    pub fn get_cached_pages<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: impl Borrow<K>,
    ) -> Option<InfinitePages<T>>
    where
        K: Eq + Hash + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.get_cached_query(query_scope, key)
    }

    /// Whether another page could be fetched for a key.
    ///
    /// `true` when nothing has been fetched yet.
    pub fn has_next_page<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: impl Borrow<K>,
    ) -> bool
    where
        K: Eq + Hash + Send + 'static,
        T: Send + 'static,
    {
        self.with_query::<K, InfinitePages<T>, _>(
            query_scope.cache_key(),
            key.borrow(),
            |maybe_query| match maybe_query.and_then(|query| query.value.as_ref()) {
                Some(pages) if !pages.is_empty() => query_scope.next_after(pages).is_some(),
                _ => true,
            },
        )
    }

    fn fetch_first_page<K, T>(
        &self,
        query_scope: &InfiniteQueryScope<K, T>,
        key: K,
    ) -> SharedFetch<Page<T>>
    where
        K: Clone + Eq + Hash + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let initial_page_param = query_scope.initial_page_param();
        let attempt = {
            let query_scope = query_scope.clone();
            let key = key.clone();
            move || query_scope.query(key.clone(), initial_page_param)
        };
        self.fetch_coalesced::<K, InfinitePages<T>, Page<T>>(
            FetchRequest {
                cache_key: query_scope.cache_key(),
                name: query_scope.name.clone(),
                key,
                slot: FetchSlot::FirstPage,
                options: options_combine(self.options(), query_scope.options()),
                reset_generation: true,
                discard_superseded: true,
            },
            attempt,
            move |query, page| {
                query.set_value(InfinitePages::first(initial_page_param, page.clone()));
                Ok(())
            },
        )
    }
}

/// One key's lazily growing, restartable sequence of pages.
///
/// Holds no pages itself, they all live in the [`QueryCache`],
/// so every handle for the same scope and key sees the same sequence.
#[derive(Clone)]
pub struct PaginatedQuery<K, T> {
    cache: QueryCache,
    scope: InfiniteQueryScope<K, T>,
    key: K,
}

impl<K: Debug, T> Debug for PaginatedQuery<K, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginatedQuery")
            .field("scope", &self.scope)
            .field("key", &self.key)
            .finish()
    }
}

impl<K, T> PaginatedQuery<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// The query parameters.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The scope the pages are fetched with.
    pub fn scope(&self) -> &InfiniteQueryScope<K, T> {
        &self.scope
    }

    /// Get the accumulated pages, fetching the first page if nothing fresh is cached.
    ///
    /// See [`QueryCache::fetch_infinite_query`].
    pub async fn load(&self) -> Result<InfinitePages<T>, FetchError> {
        self.cache.fetch_infinite_query(&self.scope, &self.key).await
    }

    /// Fetch the next page. See [`QueryCache::fetch_next_page`].
    pub async fn fetch_next_page(&self) -> Result<Option<Page<T>>, FetchError> {
        self.cache.fetch_next_page(&self.scope, &self.key).await
    }

    /// Restart the sequence from the first page. See [`QueryCache::refresh_infinite_query`].
    pub async fn refresh(&self) -> Result<Page<T>, FetchError> {
        self.cache
            .refresh_infinite_query(&self.scope, &self.key)
            .await
    }

    /// Mark the sequence as stale, the next [`PaginatedQuery::load`] restarts it.
    pub fn invalidate(&self) -> bool {
        self.cache.invalidate_query(&self.scope, &self.key)
    }

    /// The pages fetched so far.
    pub fn pages(&self) -> Vec<Page<T>> {
        self.cache
            .get_cached_pages(&self.scope, &self.key)
            .map(InfinitePages::into_pages)
            .unwrap_or_default()
    }

    /// The items of all pages fetched so far.
    pub fn items(&self) -> Vec<T> {
        self.cache
            .get_cached_pages(&self.scope, &self.key)
            .map(|pages| pages.items().cloned().collect())
            .unwrap_or_default()
    }

    /// `true` once the last fetched page has no next page.
    pub fn is_exhausted(&self) -> bool {
        !self.cache.has_next_page(&self.scope, &self.key)
    }

    /// The status of the most recent fetch.
    pub fn status(&self) -> QueryStatus {
        self.state()
            .map(|state| state.status)
            .unwrap_or(QueryStatus::Idle)
    }

    /// The error of the most recent fetch, if it failed.
    pub fn error(&self) -> Option<FetchError> {
        self.state().and_then(|state| state.error)
    }

    /// Whether a page is being fetched.
    pub fn is_fetching(&self) -> bool {
        self.state().is_some_and(|state| state.is_fetching())
    }

    /// The full state of the sequence, `None` if it was never fetched.
    pub fn state(&self) -> Option<QueryState> {
        self.cache.query_state(&self.scope, &self.key)
    }
}

impl<K, T> PagedSource<T> for PaginatedQuery<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn fetch_next(&self) -> impl Future<Output = Result<Option<Page<T>>, FetchError>> + Send {
        self.fetch_next_page()
    }

    fn has_more(&self) -> bool {
        !self.is_exhausted()
    }
}
