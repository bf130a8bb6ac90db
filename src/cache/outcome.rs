//! How a single read was resolved.

use std::fmt;

/// Cache resolution of one read operation.
///
/// Travels next to the operation's own result, never in place of it: a
/// genuine query error stays in the result and is only mirrored here as
/// [`CacheOutcome::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheOutcome {
    /// The real query ran (or will run).
    #[default]
    Miss,
    /// Served from the primary-key tier.
    PrimaryHit,
    /// Served from the query-result tier.
    SearchHit,
    /// Served from a cached "not found" sentinel.
    NotFoundHit,
    /// Served from a concurrent owner's result; carries the owner's outcome.
    SingleFlightHit(Box<CacheOutcome>),
    /// The real query ran and failed.
    Error,
}

impl CacheOutcome {
    pub fn single_flight(owner: CacheOutcome) -> Self {
        Self::SingleFlightHit(Box::new(owner))
    }

    /// True if the real query was skipped for this caller.
    pub fn is_hit(&self) -> bool {
        matches!(
            self,
            Self::PrimaryHit | Self::SearchHit | Self::NotFoundHit | Self::SingleFlightHit(_)
        )
    }

    /// Outcome of the execution this caller's result came from.
    pub fn origin(&self) -> &CacheOutcome {
        match self {
            Self::SingleFlightHit(owner) => owner.origin(),
            other => other,
        }
    }

    /// Stable label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::PrimaryHit => "primary",
            Self::SearchHit => "search",
            Self::NotFoundHit => "not_found",
            Self::SingleFlightHit(_) => "single_flight",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleFlightHit(owner) => write!(f, "single_flight({owner})"),
            other => f.write_str(other.label()),
        }
    }
}
