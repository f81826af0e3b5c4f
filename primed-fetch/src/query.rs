use std::fmt::{self, Debug, Display, Formatter};

use chrono::{DateTime, Utc};

use crate::{
    FetchError, QueryOptions,
    utils::{new_generation_id, safe_dt_dur_add},
};

/// Where a query is in its lifecycle, derived from its cached data and most recent fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data, no fetch in flight and no error.
    Idle,
    /// No data yet, the first fetch is in flight.
    Loading,
    /// Data is available and a fetch is in flight.
    Fetching,
    /// Data is available and the most recent fetch succeeded.
    Success,
    /// The most recent fetch failed. Any previously fetched data is still available.
    Error,
}

/// A snapshot of a cached query's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryState {
    /// The derived status.
    pub status: QueryStatus,
    /// When data was last successfully stored, `None` if never.
    pub updated_at: Option<DateTime<Utc>>,
    /// The error of the most recent fetch, cleared by the next success.
    pub error: Option<FetchError>,
    /// Whether the query was invalidated since its last successful fetch.
    pub invalidated: bool,
    /// Whether the next access will refetch.
    pub stale: bool,
}

impl QueryState {
    /// Whether a fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        matches!(self.status, QueryStatus::Loading | QueryStatus::Fetching)
    }
}

impl Display for QueryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.status)?;
        if let Some(updated_at) = self.updated_at {
            write!(
                f,
                ", updated {}",
                chrono_humanize::HumanTime::from(updated_at - Utc::now()).to_text_en(
                    chrono_humanize::Accuracy::Rough,
                    chrono_humanize::Tense::Past,
                )
            )?;
        }
        if self.stale {
            write!(f, ", stale")?;
        }
        if let Some(error) = &self.error {
            write!(f, ", error: {error}")?;
        }
        Ok(())
    }
}

pub(crate) struct Query<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub combined_options: QueryOptions,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_accessed: DateTime<Utc>,
    pub invalidated: bool,
    pub error: Option<FetchError>,
    /// Number of fetches currently in flight for this entry.
    pub fetching: usize,
    /// Distinguishes this entry from one later stored under the same key.
    pub entry_id: u64,
    /// Replaced whenever previously started fetches must no longer be applied.
    pub generation: u64,
}

impl<K, V> Debug for Query<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("updated_at", &self.updated_at)
            .field("invalidated", &self.invalidated)
            .field("error", &self.error)
            .field("fetching", &self.fetching)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<K, V> Query<K, V> {
    pub fn new(key: K, combined_options: QueryOptions) -> Self {
        Self {
            key,
            value: None,
            combined_options,
            updated_at: None,
            last_accessed: Utc::now(),
            invalidated: false,
            error: None,
            fetching: 0,
            entry_id: new_generation_id(),
            generation: new_generation_id(),
        }
    }

    pub fn with_value(key: K, value: V, combined_options: QueryOptions) -> Self {
        let mut query = Self::new(key, combined_options);
        query.set_value(value);
        query
    }

    pub fn set_value(&mut self, value: V) {
        self.value = Some(value);
        self.updated_at = Some(Utc::now());
        self.invalidated = false;
        self.error = None;
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Stop any in-flight fetch from being applied.
    pub fn reset_generation(&mut self) -> u64 {
        self.generation = new_generation_id();
        self.generation
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
        self.reset_generation();
    }

    pub fn stale(&self) -> bool {
        match self.updated_at {
            Some(updated_at) => {
                self.invalidated
                    || Utc::now() > safe_dt_dur_add(updated_at, self.combined_options.stale_time())
            }
            None => true,
        }
    }

    /// Fresh, successfully fetched data, if any.
    pub fn fresh_value(&self) -> Option<&V> {
        if self.stale() {
            None
        } else {
            self.value.as_ref()
        }
    }

    pub fn gc_due(&self, now: DateTime<Utc>) -> bool {
        self.fetching == 0
            && now > safe_dt_dur_add(self.last_accessed, self.combined_options.gc_time())
    }

    pub fn status(&self) -> QueryStatus {
        match (self.value.is_some(), self.fetching > 0) {
            (false, true) => QueryStatus::Loading,
            (true, true) => QueryStatus::Fetching,
            _ if self.error.is_some() => QueryStatus::Error,
            (true, false) => QueryStatus::Success,
            (false, false) => QueryStatus::Idle,
        }
    }

    pub fn state(&self) -> QueryState {
        QueryState {
            status: self.status(),
            updated_at: self.updated_at,
            error: self.error.clone(),
            invalidated: self.invalidated,
            stale: self.stale(),
        }
    }
}
