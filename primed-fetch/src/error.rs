use thiserror::Error;

/// Failure of a single fetch, as surfaced to callers and recorded on the cache entry.
///
/// Cloneable so one failed fetch can be shared by every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request never produced a response (connection, timeout, TLS...).
    #[error("Network request failed: {message}")]
    Network {
        /// What went wrong.
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// The status code.
        status: u16,
        /// The response body, as text.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("Failed to decode response: {message}")]
    Decode {
        /// What didn't match.
        message: String,
    },

    /// The query was refreshed, invalidated or cleared while this fetch was in flight,
    /// so its result was discarded.
    #[error("Fetch was superseded before it completed")]
    Superseded,
}

impl FetchError {
    /// Shorthand for a [`FetchError::Network`] from anything displayable.
    pub fn network(message: impl std::fmt::Display) -> Self {
        Self::Network {
            message: message.to_string(),
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        !matches!(self, Self::Superseded)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode {
                message: e.to_string(),
            }
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            Self::network(e)
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode {
            message: e.to_string(),
        }
    }
}

/// Invalid configuration values.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A variable was set to something unusable.
    #[error("Invalid value for '{key}': {message}")]
    InvalidValue {
        /// The variable.
        key: String,
        /// Why it was rejected.
        message: String,
    },
}
