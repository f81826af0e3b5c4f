use std::{fmt::Debug, future::Future, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    FetchError, InfiniteQueryScope, Page, PaginatedQuery, ProblemsConfig, QueryCache,
    QueryOptions, QueryScope, QueryState,
};

/// How long fetched metadata is served without refetching.
pub const METADATA_STALE_TIME: Duration = Duration::from_millis(3_600_000);

/// Logical name of the paginated problems query.
pub const PROBLEMS_QUERY: &str = "problems";

/// Logical name of the problems metadata query.
pub const PROBLEMS_METADATA_QUERY: &str = "problems-metadata";

/// How hard a problem is, `"easy"`, `"medium"` or `"hard"` on the wire.
///
/// Any other value decodes as [`Difficulty::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    #[serde(other)]
    Unknown,
}

/// A practice problem, passed through as the API returns it.
///
/// No field is required, and absent fields stay absent when serialized again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// Unique id of the problem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Difficulty, if the API knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    /// Every other field, untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregate information about the problem library, e.g. which topics and companies exist.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProblemsMetadata {
    /// Every field, untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Filters of the problems list. Every distinct set of filters is its own page sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemFilters {
    /// Only problems of this difficulty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    /// Only problems tagged with this topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Only problems asked by this company.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    /// Free text search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl ProblemFilters {
    /// Filter by difficulty.
    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    /// Filter by topic.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Filter by company.
    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    /// Free text search.
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }
}

/// The parameters of one problems page request: the filters plus the pagination fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemsRequest {
    /// The filters, flattened alongside the pagination fields.
    #[serde(flatten)]
    pub filters: ProblemFilters,
    /// Page size.
    pub limit: u64,
    /// Index of the first problem of the page.
    pub offset: u64,
    /// Caller identity.
    pub user_id: String,
}

/// The problems backend.
pub trait ProblemsApi: Send + Sync + 'static {
    /// One page of problems matching the request.
    fn get_problems(
        &self,
        request: &ProblemsRequest,
    ) -> impl Future<Output = Result<Page<Problem>, FetchError>> + Send;

    /// The library's metadata.
    fn get_problems_metadata(
        &self,
    ) -> impl Future<Output = Result<ProblemsMetadata, FetchError>> + Send;
}

/// Cached access to the problems list and metadata.
///
/// Clones share the same [`QueryCache`] and API.
pub struct ProblemsClient<A> {
    cache: QueryCache,
    api: Arc<A>,
    config: ProblemsConfig,
    problems_scope: InfiniteQueryScope<ProblemFilters, Problem>,
    metadata_scope: QueryScope<(), ProblemsMetadata>,
}

impl<A> Clone for ProblemsClient<A> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            api: self.api.clone(),
            config: self.config.clone(),
            problems_scope: self.problems_scope.clone(),
            metadata_scope: self.metadata_scope.clone(),
        }
    }
}

impl<A> Debug for ProblemsClient<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProblemsClient")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl<A: ProblemsApi> ProblemsClient<A> {
    /// Queries go through `cache`, which may be shared with other clients.
    pub fn new(cache: QueryCache, api: A, config: ProblemsConfig) -> Self {
        let api = Arc::new(api);

        let problems_scope = InfiniteQueryScope::new(PROBLEMS_QUERY, {
            let api = api.clone();
            let user_id = config.user_id.clone();
            let limit = config.problems_per_page;
            move |filters: ProblemFilters, offset: u64| {
                let api = api.clone();
                let request = ProblemsRequest {
                    filters,
                    limit,
                    offset,
                    user_id: user_id.clone(),
                };
                async move { api.get_problems(&request).await }
            }
        });

        let metadata_scope = QueryScope::new(PROBLEMS_METADATA_QUERY, {
            let api = api.clone();
            move |()| {
                let api = api.clone();
                async move { api.get_problems_metadata().await }
            }
        })
        .set_options(
            QueryOptions::new()
                .set_gc_time(METADATA_STALE_TIME * 2)
                .set_stale_time(METADATA_STALE_TIME),
        );

        Self {
            cache,
            api,
            config,
            problems_scope,
            metadata_scope,
        }
    }

    /// The page sequence for `filters`. Nothing is fetched until it's loaded.
    pub fn problems(&self, filters: ProblemFilters) -> PaginatedQuery<ProblemFilters, Problem> {
        self.cache.paginated_query(&self.problems_scope, filters)
    }

    /// The metadata, from the cache if fetched within the last hour.
    pub async fn problems_metadata(&self) -> Result<ProblemsMetadata, FetchError> {
        self.cache.fetch_query(&self.metadata_scope, ()).await
    }

    /// The status of the metadata query, `None` if it was never fetched.
    pub fn problems_metadata_state(&self) -> Option<QueryState> {
        self.cache.query_state(&self.metadata_scope, ())
    }

    /// Mark every problems sequence as stale, each restarts from its first page when next loaded.
    pub fn invalidate_problems(&self) {
        self.cache.invalidate_query_type(&self.problems_scope);
    }

    /// Mark the metadata as stale.
    pub fn invalidate_problems_metadata(&self) -> bool {
        self.cache.invalidate_query(&self.metadata_scope, ())
    }

    /// The scope the problems pages are fetched with.
    pub fn problems_scope(&self) -> &InfiniteQueryScope<ProblemFilters, Problem> {
        &self.problems_scope
    }

    /// The scope the metadata is fetched with.
    pub fn metadata_scope(&self) -> &QueryScope<(), ProblemsMetadata> {
        &self.metadata_scope
    }

    /// The underlying cache.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// The underlying API.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// The settings requests are made with.
    pub fn config(&self) -> &ProblemsConfig {
        &self.config
    }
}
