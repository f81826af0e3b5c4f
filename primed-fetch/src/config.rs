use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::ConfigError;

/// The caller identity sent with every problems request.
pub const DEFAULT_USER_ID: &str = "default_user";

/// The page size of the problems list.
pub const PROBLEMS_PER_PAGE: u64 = 20;

/// Base url of the problems API when none is configured.
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Timeout applied to each API request when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for talking to the problems API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemsConfig {
    /// Base url, endpoints are appended to it.
    pub base_url: String,
    /// Sent as `user_id` with every problems request.
    pub user_id: String,
    /// Sent as `limit` with every problems request.
    pub problems_per_page: u64,
    /// Per request timeout of the HTTP client.
    pub request_timeout: Duration,
}

impl Default for ProblemsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            user_id: DEFAULT_USER_ID.to_string(),
            problems_per_page: PROBLEMS_PER_PAGE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ProblemsConfig {
    /// Load from `PRIMED_API_URL`, `PRIMED_USER_ID`, `PRIMED_PROBLEMS_PER_PAGE`
    /// and `PRIMED_REQUEST_TIMEOUT_SECS`, defaulting whatever isn't set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load with `lookup` as the source of variables instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let base_url = load_string(&lookup, "PRIMED_API_URL", defaults.base_url)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: load_string(&lookup, "PRIMED_USER_ID", defaults.user_id)?,
            problems_per_page: load_positive(
                &lookup,
                "PRIMED_PROBLEMS_PER_PAGE",
                defaults.problems_per_page,
            )?,
            request_timeout: Duration::from_secs(load_positive(
                &lookup,
                "PRIMED_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
        })
    }
}

fn load_string(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: String,
) -> Result<String, ConfigError> {
    match lookup(key) {
        Some(value) if value.trim().is_empty() => Err(invalid(key, "must not be empty")),
        Some(value) => Ok(value.trim().to_string()),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn load_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        info!("{key} not set, using default: {default}");
        return Ok(default);
    };
    let value = raw.trim().parse::<T>().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        invalid(key, e)
    })?;
    if value == T::default() {
        warn!("Invalid {key} value: must be greater than zero");
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn invalid(key: &str, message: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
