//! Process-lifetime hit/miss counters.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;

use super::metric_names::{HIT_TOTAL, MISS_TOTAL};
use super::outcome::CacheOutcome;

/// Hit and miss counters for one cache instance.
///
/// Resetting the counters never touches cached content.
#[derive(Debug, Default)]
pub struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one resolved read.
    pub fn record(&self, outcome: &CacheOutcome) {
        if outcome.is_hit() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(HIT_TOTAL, "kind" => outcome.label()).increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(MISS_TOTAL).increment(1);
        }
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn lookup_count(&self) -> u64 {
        self.hit_count() + self.miss_count()
    }

    /// Fraction of lookups served from cache, `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookup_count();
        if lookups == 0 {
            return 0.0;
        }
        self.hit_count() as f64 / lookups as f64
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hits_and_misses() {
        let stats = Stats::new();
        stats.record(&CacheOutcome::Miss);
        stats.record(&CacheOutcome::PrimaryHit);
        stats.record(&CacheOutcome::single_flight(CacheOutcome::Miss));
        stats.record(&CacheOutcome::Error);

        assert_eq!(stats.hit_count(), 2);
        assert_eq!(stats.miss_count(), 2);
        assert_eq!(stats.lookup_count(), 4);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_zeroes_counters() {
        let stats = Stats::new();
        stats.record(&CacheOutcome::SearchHit);
        stats.reset();

        assert_eq!(stats.lookup_count(), 0);
        assert_eq!(stats.hit_rate(), 0.0);
    }
}
