use std::time::Duration;

pub(crate) const DEFAULT_STALE_TIME: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_GC_TIME: Duration = Duration::from_secs(300);

/// Configuration to be used with [`crate::QueryCache`] and individual query scopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueryOptions {
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
    retry: Option<u32>,
}

impl QueryOptions {
    /// Create new [`QueryOptions`] with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the duration that should pass before a query is considered stale.
    ///
    /// Until stale, the cached value is returned without calling the fetcher.
    /// Once stale, the next access refetches it.
    ///
    /// To never mark as stale, set [`std::time::Duration::MAX`].
    /// If greater than the gc time, the gc time is used instead.
    ///
    /// Default: `10 seconds`
    #[track_caller]
    pub fn set_stale_time(mut self, stale_time: Duration) -> Self {
        if let Some(gc_time) = self.gc_time {
            if stale_time > gc_time {
                self.stale_time = Some(gc_time);
                return self;
            }
        }
        self.stale_time = Some(stale_time);
        self
    }

    /// Set the duration an unused query is kept before [`crate::QueryCache::gc`] removes it.
    ///
    /// To never garbage collect, set [`std::time::Duration::MAX`].
    ///
    /// Default: `5 minutes`
    #[track_caller]
    pub fn set_gc_time(mut self, gc_time: Duration) -> Self {
        if let Some(stale_time) = self.stale_time {
            if stale_time > gc_time {
                self.stale_time = Some(gc_time);
            }
        }
        self.gc_time = Some(gc_time);
        self
    }

    /// Set how many more times a failed fetch is attempted before the error is surfaced.
    ///
    /// Retries happen immediately, within the same coalesced fetch.
    ///
    /// Default: `0`
    #[track_caller]
    pub fn set_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// The duration that should pass before a query is considered stale.
    ///
    /// Default: `10 seconds`
    pub fn stale_time(&self) -> Duration {
        self.stale_time.unwrap_or(DEFAULT_STALE_TIME)
    }

    /// The duration an unused query is kept before being garbage collected.
    ///
    /// Default: `5 minutes`
    pub fn gc_time(&self) -> Duration {
        self.gc_time.unwrap_or(DEFAULT_GC_TIME)
    }

    /// How many more times a failed fetch is attempted.
    ///
    /// Default: `0`
    pub fn retry(&self) -> u32 {
        self.retry.unwrap_or(0)
    }
}

pub(crate) fn options_combine(base: QueryOptions, scope: Option<QueryOptions>) -> QueryOptions {
    if let Some(scope) = scope {
        let mut combined = QueryOptions {
            stale_time: scope.stale_time.or(base.stale_time),
            gc_time: scope.gc_time.or(base.gc_time),
            retry: scope.retry.or(base.retry),
        };
        if combined.stale_time() > combined.gc_time() {
            combined.stale_time = Some(combined.gc_time());
        }
        combined
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    #[test]
    fn test_defaults() {
        let options = QueryOptions::new();
        assert_eq!(options.stale_time(), DEFAULT_STALE_TIME);
        assert_eq!(options.gc_time(), DEFAULT_GC_TIME);
        assert_eq!(options.retry(), 0);
    }

    #[rstest]
    #[case::stale_first(true)]
    #[case::gc_first(false)]
    fn test_stale_time_clamped_to_gc_time(#[case] stale_first: bool) {
        let options = if stale_first {
            QueryOptions::new()
                .set_stale_time(Duration::from_secs(60))
                .set_gc_time(Duration::from_secs(30))
        } else {
            QueryOptions::new()
                .set_gc_time(Duration::from_secs(30))
                .set_stale_time(Duration::from_secs(60))
        };
        assert_eq!(options.stale_time(), Duration::from_secs(30));
        assert_eq!(options.gc_time(), Duration::from_secs(30));
    }

    #[test]
    fn test_scope_options_take_precedence() {
        let base = QueryOptions::new()
            .set_stale_time(Duration::from_secs(1))
            .set_retry(2);
        let scope = QueryOptions::new().set_stale_time(Duration::from_secs(5));
        let combined = options_combine(base, Some(scope));
        assert_eq!(combined.stale_time(), Duration::from_secs(5));
        assert_eq!(combined.retry(), 2);
        assert_eq!(combined.gc_time(), DEFAULT_GC_TIME);
        assert_eq!(options_combine(base, None), base);
    }

    #[test]
    fn test_combined_stale_time_never_exceeds_gc_time() {
        let base = QueryOptions::new().set_gc_time(Duration::from_secs(60));
        let scope = QueryOptions::new().set_stale_time(Duration::from_secs(3600));
        let combined = options_combine(base, Some(scope));
        assert_eq!(combined.stale_time(), Duration::from_secs(60));
    }
}
