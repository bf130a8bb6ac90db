//! Cache configuration.
//!
//! Supplied once when a [`QueryCache`](super::QueryCache) is built and never
//! mutated afterwards. Loaded from the `[cache]` section of `rowcache.toml`.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::CacheError;

// Default values for cache configuration
pub const DEFAULT_KEY_PREFIX: &str = "rowcache";
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const TTL_JITTER_RATIO: f64 = 0.2;

/// Which cache tiers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    /// Caching disabled; every hook is a pass-through.
    Off,
    /// Primary-key object tier only.
    PrimaryOnly,
    /// Query-result tier only.
    SearchOnly,
    /// Both tiers.
    #[default]
    All,
}

impl CacheLevel {
    pub fn primary(self) -> bool {
        matches!(self, Self::PrimaryOnly | Self::All)
    }

    pub fn search(self) -> bool {
        matches!(self, Self::SearchOnly | Self::All)
    }

    pub fn is_off(self) -> bool {
        self == Self::Off
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Off => "off",
            Self::PrimaryOnly => "primary_only",
            Self::SearchOnly => "search_only",
            Self::All => "all",
        };
        f.write_str(label)
    }
}

impl FromStr for CacheLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "off" | "none" => Ok(Self::Off),
            "primary" | "primary_only" => Ok(Self::PrimaryOnly),
            "search" | "search_only" => Ok(Self::SearchOnly),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown cache level `{other}` (expected off|primary_only|search_only|all)"
            )),
        }
    }
}

/// Cache configuration from `rowcache.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Active tiers.
    pub level: CacheLevel,
    /// Tables eligible for caching; empty means every table.
    pub tables: Vec<String>,
    /// Invalidate affected entries after successful writes.
    pub invalidate_on_write: bool,
    /// Dispatch cache writes and invalidations without awaiting them.
    pub async_write: bool,
    /// Entry TTL in milliseconds; 0 selects a long default.
    pub ttl_millis: u64,
    /// Results with more rows than this are never cached; 0 means unlimited.
    pub max_item_count: u64,
    /// Skip caching "not found" sentinels.
    pub disable_penetration_protection: bool,
    /// First segment of every cache key.
    pub key_prefix: String,
    /// Second segment of every cache key; random per instance when unset.
    pub instance_id: Option<String>,
    /// Capacity of the bundled in-process store.
    pub memory_capacity: usize,
    /// Log every hit/miss decision at debug level instead of trace.
    pub debug_mode: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            level: CacheLevel::All,
            tables: Vec::new(),
            invalidate_on_write: true,
            async_write: false,
            ttl_millis: 0,
            max_item_count: 0,
            disable_penetration_protection: false,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            instance_id: None,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            debug_mode: false,
        }
    }
}

impl CacheConfig {
    /// Check the configuration for combinations the cache cannot honour.
    pub fn validate(&self) -> Result<(), CacheError> {
        check_segment("cache.key_prefix", &self.key_prefix)?;

        if let Some(instance_id) = self.instance_id.as_deref() {
            check_segment("cache.instance_id", instance_id)?;
        }

        let mut seen = HashSet::with_capacity(self.tables.len());
        for table in &self.tables {
            check_segment("cache.tables", table)?;
            if table.chars().any(char::is_whitespace) {
                return Err(CacheError::configuration(
                    "cache.tables",
                    format!("table `{table}` must not contain whitespace"),
                ));
            }
            if !seen.insert(table.as_str()) {
                return Err(CacheError::configuration(
                    "cache.tables",
                    format!("table `{table}` is listed more than once"),
                ));
            }
        }

        if self.level.is_off() && !self.tables.is_empty() {
            return Err(CacheError::configuration(
                "cache.tables",
                "an allow-list cannot be combined with cache level `off`",
            ));
        }

        Ok(())
    }

    /// Returns true if the cache applies to `table` at all.
    pub fn table_enabled(&self, table: &str) -> bool {
        !self.level.is_off() && (self.tables.is_empty() || self.tables.iter().any(|t| t == table))
    }

    pub fn primary_enabled(&self, table: &str) -> bool {
        self.level.primary() && self.table_enabled(table)
    }

    pub fn search_enabled(&self, table: &str) -> bool {
        self.level.search() && self.table_enabled(table)
    }

    pub fn penetration_protection(&self) -> bool {
        !self.disable_penetration_protection
    }

    /// Configured TTL before jitter.
    pub fn ttl(&self) -> Duration {
        if self.ttl_millis == 0 {
            DEFAULT_TTL
        } else {
            Duration::from_millis(self.ttl_millis)
        }
    }

    /// TTL to apply to one write, with up to ±20% random jitter.
    pub fn jittered_ttl(&self) -> Duration {
        jitter(self.ttl())
    }

    /// Returns true if a result of `rows` rows is too large to cache.
    pub fn exceeds_item_limit(&self, rows: usize) -> bool {
        self.max_item_count != 0 && rows as u64 > self.max_item_count
    }

    /// Returns the memory store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Spread `base` by a random factor in `[-20%, +20%]`.
pub fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(-TTL_JITTER_RATIO..=TTL_JITTER_RATIO);
    base.mul_f64(1.0 + factor)
}

fn check_segment(key: &'static str, value: &str) -> Result<(), CacheError> {
    if value.trim().is_empty() {
        return Err(CacheError::configuration(key, "must not be empty"));
    }
    if value.contains(':') {
        return Err(CacheError::configuration(
            key,
            format!("`{value}` must not contain `:`"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.level, CacheLevel::All);
        assert!(config.tables.is_empty());
        assert!(config.invalidate_on_write);
        assert!(!config.async_write);
        assert_eq!(config.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.max_item_count, 0);
        assert!(config.penetration_protection());
        assert_eq!(config.key_prefix, "rowcache");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn level_controls_tiers() {
        assert!(CacheLevel::All.primary() && CacheLevel::All.search());
        assert!(CacheLevel::PrimaryOnly.primary() && !CacheLevel::PrimaryOnly.search());
        assert!(!CacheLevel::SearchOnly.primary() && CacheLevel::SearchOnly.search());
        assert!(!CacheLevel::Off.primary() && !CacheLevel::Off.search());
    }

    #[test]
    fn level_parses_from_cli_spellings() {
        assert_eq!("primary-only".parse::<CacheLevel>(), Ok(CacheLevel::PrimaryOnly));
        assert_eq!("SEARCH".parse::<CacheLevel>(), Ok(CacheLevel::SearchOnly));
        assert_eq!("off".parse::<CacheLevel>(), Ok(CacheLevel::Off));
        assert!("sometimes".parse::<CacheLevel>().is_err());
    }

    #[test]
    fn empty_allow_list_enables_every_table() {
        let config = CacheConfig::default();
        assert!(config.table_enabled("orders"));
        assert!(config.primary_enabled("users"));
    }

    #[test]
    fn allow_list_restricts_tables() {
        let config = CacheConfig {
            tables: vec!["orders".to_string()],
            level: CacheLevel::SearchOnly,
            ..Default::default()
        };
        assert!(config.search_enabled("orders"));
        assert!(!config.primary_enabled("orders"));
        assert!(!config.search_enabled("users"));
    }

    #[test]
    fn off_level_disables_every_table() {
        let config = CacheConfig {
            level: CacheLevel::Off,
            ..Default::default()
        };
        assert!(!config.table_enabled("orders"));
    }

    #[test]
    fn allow_list_with_off_level_is_rejected() {
        let config = CacheConfig {
            level: CacheLevel::Off,
            tables: vec!["orders".to_string()],
            ..Default::default()
        };
        let error = config.validate().expect_err("combination should be rejected");
        assert!(matches!(
            error,
            CacheError::Configuration {
                key: "cache.tables",
                ..
            }
        ));
    }

    #[test]
    fn duplicate_and_malformed_tables_are_rejected() {
        let duplicate = CacheConfig {
            tables: vec!["orders".to_string(), "orders".to_string()],
            ..Default::default()
        };
        assert!(duplicate.validate().is_err());

        let spaced = CacheConfig {
            tables: vec!["order items".to_string()],
            ..Default::default()
        };
        assert!(spaced.validate().is_err());

        let separator = CacheConfig {
            tables: vec!["a:b".to_string()],
            ..Default::default()
        };
        assert!(separator.validate().is_err());
    }

    #[test]
    fn prefix_and_instance_id_must_be_key_segments() {
        let empty_prefix = CacheConfig {
            key_prefix: " ".to_string(),
            ..Default::default()
        };
        assert!(empty_prefix.validate().is_err());

        let bad_instance = CacheConfig {
            instance_id: Some("node:1".to_string()),
            ..Default::default()
        };
        assert!(bad_instance.validate().is_err());
    }

    #[test]
    fn item_limit_zero_is_unlimited() {
        let config = CacheConfig::default();
        assert!(!config.exceeds_item_limit(1_000_000));

        let limited = CacheConfig {
            max_item_count: 1,
            ..Default::default()
        };
        assert!(!limited.exceeds_item_limit(1));
        assert!(limited.exceeds_item_limit(2));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_millis(1_000);
        for _ in 0..1_000 {
            let ttl = jitter(base);
            // one millisecond of slack for float rounding at the bounds
            assert!(ttl >= Duration::from_millis(799), "{ttl:?} below bound");
            assert!(ttl <= Duration::from_millis(1_201), "{ttl:?} above bound");
        }
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            memory_capacity: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_capacity_non_zero().get(), 1);
    }
}
