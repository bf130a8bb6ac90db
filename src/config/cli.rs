use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::cache::CacheLevel;

const DEFAULT_SIMULATE_READERS: usize = 32;
pub(super) const DEFAULT_SIMULATE_ROUNDS: usize = 20;
const DEFAULT_SIMULATE_TABLE: &str = "orders";

/// Command-line arguments for the rowcache binary.
#[derive(Debug, Parser)]
#[command(name = "rowcache", version, about = "Row and query cache for relational clients")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ROWCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate the configuration and print the resolved cache settings.
    Check(CheckArgs),
    /// Run a concurrent read/write workload against an in-process cache.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Concurrent readers per round.
    #[arg(long, default_value_t = DEFAULT_SIMULATE_READERS)]
    pub readers: usize,

    /// Read/write rounds to run.
    #[arg(long, default_value_t = DEFAULT_SIMULATE_ROUNDS)]
    pub rounds: usize,

    /// Name of the simulated table.
    #[arg(long, default_value = DEFAULT_SIMULATE_TABLE)]
    pub table: String,

    #[command(flatten)]
    pub overrides: CacheOverrides,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            readers: DEFAULT_SIMULATE_READERS,
            rounds: DEFAULT_SIMULATE_ROUNDS,
            table: DEFAULT_SIMULATE_TABLE.to_string(),
            overrides: CacheOverrides::default(),
        }
    }
}

#[derive(Debug, Args, Clone, Default)]
pub struct CacheOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the active cache tiers (off|primary_only|search_only|all).
    #[arg(long = "cache-level", value_name = "LEVEL")]
    pub cache_level: Option<CacheLevel>,

    /// Override the entry TTL in milliseconds.
    #[arg(long = "cache-ttl-millis", value_name = "MILLIS")]
    pub cache_ttl_millis: Option<u64>,

    /// Override the table allow-list (comma separated).
    #[arg(long = "cache-tables", value_name = "TABLES", value_delimiter = ',')]
    pub cache_tables: Option<Vec<String>>,

    /// Override the maximum number of rows cached per result.
    #[arg(long = "cache-max-item-count", value_name = "COUNT")]
    pub cache_max_item_count: Option<u64>,

    /// Dispatch cache writes and invalidations in the background.
    #[arg(
        long = "cache-async-write",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_async_write: Option<bool>,

    /// Log every cache decision at debug level.
    #[arg(
        long = "cache-debug",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_debug: Option<bool>,
}
