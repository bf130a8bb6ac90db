//! Concurrent read/write workload against an in-process cache.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::cache::{CacheableRow, QueryCache, ReadContext, WriteContext};
use crate::config::SimulateArgs;
use crate::infra::error::InfraError;

const SEEDED_ROWS: u64 = 8;
const QUERY_LATENCY: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRow {
    pub id: u64,
    pub version: u64,
    pub bucket: u64,
}

impl CacheableRow for SimRow {
    fn primary_key(&self) -> String {
        self.id.to_string()
    }
}

/// Query error of the simulated table; never produced, carried for the type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimError(pub String);

/// In-memory table standing in for the real store.
pub struct SimulatedTable {
    name: String,
    rows: RwLock<BTreeMap<u64, SimRow>>,
    executions: AtomicU64,
}

impl SimulatedTable {
    pub fn seeded(name: impl Into<String>) -> Self {
        let rows = (0..SEEDED_ROWS)
            .map(|id| {
                (
                    id,
                    SimRow {
                        id,
                        version: 0,
                        bucket: id % 2,
                    },
                )
            })
            .collect();
        Self {
            name: name.into(),
            rows: RwLock::new(rows),
            executions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of real queries run against the table.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    async fn select_by_id(&self, id: u64) -> Result<Vec<SimRow>, SimError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(QUERY_LATENCY).await;
        Ok(self.rows.read().await.get(&id).cloned().into_iter().collect())
    }

    async fn select_by_bucket(&self, bucket: u64) -> Result<Vec<SimRow>, SimError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(QUERY_LATENCY).await;
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.bucket == bucket)
            .cloned()
            .collect())
    }

    async fn bump(&self, id: u64) -> Result<u64, SimError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) => {
                row.version += 1;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn version_of(&self, id: u64) -> Option<u64> {
        self.rows.read().await.get(&id).map(|row| row.version)
    }
}

/// Summary printed by `rowcache simulate`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub rounds: usize,
    pub reads: u64,
    pub executions: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub stale_reads: u64,
    pub elapsed: Duration,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rounds:          {}", self.rounds)?;
        writeln!(f, "reads:           {}", self.reads)?;
        writeln!(f, "real executions: {}", self.executions)?;
        writeln!(f, "hits:            {}", self.hits)?;
        writeln!(f, "misses:          {}", self.misses)?;
        writeln!(f, "hit rate:        {:.1}%", self.hit_rate * 100.0)?;
        writeln!(f, "stale reads:     {}", self.stale_reads)?;
        write!(f, "elapsed:         {:?}", self.elapsed)
    }
}

fn by_id(table: &str, id: u64) -> ReadContext<SimRow, SimError> {
    ReadContext::new(table, format!("SELECT * FROM {table} WHERE id = ?"))
        .bind(id)
        .by_primary_key(id.to_string())
}

fn by_bucket(table: &str, bucket: u64) -> ReadContext<SimRow, SimError> {
    ReadContext::new(table, format!("SELECT * FROM {table} WHERE bucket = ?")).bind(bucket)
}

/// Run `args.rounds` rounds of `args.readers` concurrent reads followed by one
/// update, checking after each update that a fresh read sees the new version.
#[instrument(skip_all, fields(table = %args.table, readers = args.readers, rounds = args.rounds))]
pub async fn run(cache: QueryCache, args: &SimulateArgs) -> Result<SimulationReport, InfraError> {
    let table = Arc::new(SimulatedTable::seeded(args.table.clone()));
    let started = Instant::now();
    let mut reads = 0_u64;
    let mut stale_reads = 0_u64;

    for round in 0..args.rounds {
        let target = round as u64 % SEEDED_ROWS;

        let readers = (0..args.readers).map(|reader| {
            let cache = cache.clone();
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                let name = table.name().to_string();
                if reader % 2 == 0 {
                    cache
                        .query(by_id(&name, target), || table.select_by_id(target))
                        .await
                        .into_result()
                } else {
                    let bucket = target % 2;
                    cache
                        .query(by_bucket(&name, bucket), || table.select_by_bucket(bucket))
                        .await
                        .into_result()
                }
            })
        });
        try_join_all(readers)
            .await
            .map_err(|err| InfraError::task(format!("reader panicked: {err}")))?;
        reads += args.readers as u64;

        let write = WriteContext::update(table.name()).with_primary_keys([target.to_string()]);
        cache
            .execute(write, || table.bump(target))
            .await
            .map_err(|SimError(message)| InfraError::task(message))?;

        let fresh = cache
            .query(by_id(table.name(), target), || table.select_by_id(target))
            .await;
        reads += 1;
        let seen = fresh
            .into_single()
            .map_err(|SimError(message)| InfraError::task(message))?
            .map(|row| row.version);
        if seen != table.version_of(target).await {
            stale_reads += 1;
        }

        debug!(round, target, executions = table.executions(), "round complete");
    }

    let report = SimulationReport {
        rounds: args.rounds,
        reads,
        executions: table.executions(),
        hits: cache.hit_count(),
        misses: cache.miss_count(),
        hit_rate: cache.hit_rate(),
        stale_reads,
        elapsed: started.elapsed(),
    };
    info!(
        executions = report.executions,
        hits = report.hits,
        misses = report.misses,
        stale_reads = report.stale_reads,
        "simulation finished"
    );
    Ok(report)
}
