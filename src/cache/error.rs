//! Error taxonomy for the cache layer.
//!
//! Only [`CacheError::Configuration`] is ever surfaced to a caller on the data
//! path, and only while building a [`QueryCache`](super::QueryCache). Every
//! other variant is logged and absorbed as a cache miss at the hook boundary.

use metrics::counter;
use thiserror::Error;
use tracing::warn;

use super::metric_names::STORE_ERROR_TOTAL;

/// Faults raised by the cache machinery itself.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("invalid cache configuration for `{key}`: {reason}")]
    Configuration { key: &'static str, reason: String },
    #[error("backing store unavailable during `{op}`: {source}")]
    StoreUnavailable {
        op: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("cached payload could not be decoded: {0}")]
    Deserialization(String),
    #[error("result could not be encoded for caching: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn configuration(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key,
            reason: reason.into(),
        }
    }

    pub fn store(op: &'static str, source: StoreError) -> Self {
        Self::StoreUnavailable { op, source }
    }

    pub fn deserialization(error: impl std::fmt::Display) -> Self {
        Self::Deserialization(error.to_string())
    }

    pub fn serialization(error: impl std::fmt::Display) -> Self {
        Self::Serialization(error.to_string())
    }

    /// Short, stable label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Deserialization(_) => "deserialization",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Failures reported by a [`KvStore`](super::KvStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("key `{0}` is missing")]
    Missing(String),
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Log a cache fault and drop it; the caller continues as on a miss.
pub(crate) fn absorb(source: &'static str, error: CacheError) {
    if let CacheError::StoreUnavailable { op, .. } = &error {
        counter!(STORE_ERROR_TOTAL, "op" => *op).increment(1);
    }
    warn!(
        target_module = source,
        kind = error.kind(),
        error = %error,
        "cache fault absorbed"
    );
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn store_error_is_the_source_of_store_unavailable() {
        let error = CacheError::store("get", StoreError::unavailable("connection reset"));

        assert_eq!(error.kind(), "store_unavailable");
        let source = error.source().expect("store error should be chained");
        assert_eq!(source.to_string(), "store unavailable: connection reset");
    }

    #[test]
    fn configuration_error_names_the_key() {
        let error = CacheError::configuration("cache.key_prefix", "must not be empty");
        assert_eq!(
            error.to_string(),
            "invalid cache configuration for `cache.key_prefix`: must not be empty"
        );
    }
}
