//! Error taxonomy for report requests.
//!
//! Configuration and input errors are the caller's fault and map to client
//! statuses. Backend errors are fatal to the request but carry enough context
//! to retry by hand. Cache errors never fail a request on their own; the
//! orchestrator logs them and falls through to a live fetch.

use std::fmt;

/// Errors that can occur while serving a report request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HeraldError {
    /// No endpoint with the given name is configured.
    #[error("Endpoint not found: {endpoint}")]
    EndpointNotFound {
        /// The requested endpoint name.
        endpoint: String,
    },

    /// The endpoint configuration is internally inconsistent.
    #[error("Invalid configuration for endpoint '{endpoint}': {message}")]
    InvalidConfiguration {
        /// Endpoint whose configuration is broken.
        endpoint: String,
        /// Description of the inconsistency.
        message: String,
    },

    /// The requested info type is not offered by the endpoint.
    #[error("Endpoint '{endpoint}' does not support info type '{info_type}'")]
    UnsupportedInfoType {
        /// Endpoint name.
        endpoint: String,
        /// The requested info type.
        info_type: String,
    },

    /// Page or page size is out of range.
    #[error("Invalid pagination: {message}")]
    InvalidPagination {
        /// Description of the rejected value.
        message: String,
    },

    /// A filter key is not declared for the endpoint.
    #[error("Unknown filter key '{key}' for endpoint '{endpoint}'")]
    FilterKeyUnknown {
        /// Endpoint name.
        endpoint: String,
        /// The rejected filter key.
        key: String,
    },

    /// The backend could not be reached or refused the credentials.
    #[error("Source '{source_id}' unavailable: {message}")]
    SourceUnavailable {
        /// Source identifier.
        source_id: String,
        /// Description of the failure.
        message: String,
    },

    /// The backend rejected the query, or the filters could not be translated.
    #[error("Source '{source_id}' query failed: {message}")]
    SourceQueryError {
        /// Source identifier.
        source_id: String,
        /// Description of the failure.
        message: String,
    },

    /// The backend did not answer in time.
    #[error("Source '{source_id}' timed out after {timeout_ms}ms")]
    SourceTimeout {
        /// Source identifier.
        source_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The raw table could not be turned into a canonical row set.
    #[error("Normalization failed: {message}")]
    NormalizationError {
        /// Description of the structural problem.
        message: String,
    },

    /// A cache tier could not be read or written.
    #[error("Cache unavailable: {message}")]
    CacheUnavailable {
        /// Description of the cache failure.
        message: String,
    },
}

impl HeraldError {
    /// Creates a new `EndpointNotFound` error.
    #[must_use]
    pub fn endpoint_not_found(endpoint: impl Into<String>) -> Self {
        Self::EndpointNotFound {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a new `InvalidConfiguration` error.
    #[must_use]
    pub fn invalid_configuration(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates a new `UnsupportedInfoType` error.
    #[must_use]
    pub fn unsupported_info_type(
        endpoint: impl Into<String>,
        info_type: impl Into<String>,
    ) -> Self {
        Self::UnsupportedInfoType {
            endpoint: endpoint.into(),
            info_type: info_type.into(),
        }
    }

    /// Creates a new `InvalidPagination` error.
    #[must_use]
    pub fn invalid_pagination(message: impl Into<String>) -> Self {
        Self::InvalidPagination {
            message: message.into(),
        }
    }

    /// Creates a new `FilterKeyUnknown` error.
    #[must_use]
    pub fn filter_key_unknown(endpoint: impl Into<String>, key: impl Into<String>) -> Self {
        Self::FilterKeyUnknown {
            endpoint: endpoint.into(),
            key: key.into(),
        }
    }

    /// Creates a new `SourceUnavailable` error.
    #[must_use]
    pub fn source_unavailable(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Creates a new `SourceQueryError` error.
    #[must_use]
    pub fn source_query(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceQueryError {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Creates a new `SourceTimeout` error.
    #[must_use]
    pub fn source_timeout(source_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self::SourceTimeout {
            source_id: source_id.into(),
            timeout_ms,
        }
    }

    /// Creates a new `NormalizationError` error.
    #[must_use]
    pub fn normalization(message: impl Into<String>) -> Self {
        Self::NormalizationError {
            message: message.into(),
        }
    }

    /// Creates a new `CacheUnavailable` error.
    #[must_use]
    pub fn cache_unavailable(message: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            message: message.into(),
        }
    }

    /// Returns `true` if this is an endpoint-not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EndpointNotFound { .. })
    }

    /// Returns `true` if this is a source timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SourceTimeout { .. })
    }

    /// Returns `true` if the request itself was at fault.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Input
        )
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EndpointNotFound { .. } | Self::InvalidConfiguration { .. } => {
                ErrorCategory::Configuration
            }
            Self::UnsupportedInfoType { .. }
            | Self::InvalidPagination { .. }
            | Self::FilterKeyUnknown { .. } => ErrorCategory::Input,
            Self::SourceUnavailable { .. }
            | Self::SourceQueryError { .. }
            | Self::SourceTimeout { .. }
            | Self::NormalizationError { .. } => ErrorCategory::Backend,
            Self::CacheUnavailable { .. } => ErrorCategory::Cache,
        }
    }

    /// HTTP status a transport layer should answer with.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::EndpointNotFound { .. } => 404,
            Self::InvalidConfiguration { .. }
            | Self::UnsupportedInfoType { .. }
            | Self::InvalidPagination { .. }
            | Self::FilterKeyUnknown { .. } => 400,
            Self::SourceUnavailable { .. } | Self::SourceQueryError { .. } => 502,
            Self::NormalizationError { .. } => 502,
            Self::SourceTimeout { .. } => 504,
            Self::CacheUnavailable { .. } => 503,
        }
    }
}

/// Categories of request errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unknown endpoint or inconsistent endpoint configuration.
    Configuration,
    /// Rejected request parameters.
    Input,
    /// Failure in a data source.
    Backend,
    /// Failure in a cache tier.
    Cache,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Input => write!(f, "input"),
            Self::Backend => write!(f, "backend"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HeraldError::endpoint_not_found("inventory");
        assert_eq!(err.to_string(), "Endpoint not found: inventory");

        let err = HeraldError::filter_key_unknown("inventory", "colour");
        assert_eq!(
            err.to_string(),
            "Unknown filter key 'colour' for endpoint 'inventory'"
        );

        let err = HeraldError::source_timeout("relational-b", 30_000);
        assert_eq!(
            err.to_string(),
            "Source 'relational-b' timed out after 30000ms"
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(HeraldError::endpoint_not_found("x").is_client_error());
        assert!(HeraldError::invalid_pagination("page must be >= 1").is_client_error());
        assert!(HeraldError::filter_key_unknown("x", "y").is_client_error());
        assert!(!HeraldError::source_unavailable("report", "refused").is_client_error());
        assert!(!HeraldError::cache_unavailable("redis down").is_client_error());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            HeraldError::invalid_configuration("x", "bad").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            HeraldError::unsupported_info_type("x", "detail").category(),
            ErrorCategory::Input
        );
        assert_eq!(
            HeraldError::source_query("relational-a", "bad column").category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            HeraldError::cache_unavailable("down").category(),
            ErrorCategory::Cache
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(HeraldError::endpoint_not_found("x").status_code(), 404);
        assert_eq!(HeraldError::invalid_pagination("0").status_code(), 400);
        assert_eq!(HeraldError::source_timeout("report", 10).status_code(), 504);
        assert_eq!(HeraldError::source_unavailable("report", "x").status_code(), 502);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Backend.to_string(), "backend");
        assert_eq!(ErrorCategory::Input.to_string(), "input");
    }
}
