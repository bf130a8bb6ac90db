//! Lifecycle hooks wired into the host data-access runtime.
//!
//! [`QueryCache`] owns the configuration, the key namespace, the backing
//! store, the single-flight coordinator and the stats of one cache instance.
//! Independent instances never share state.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, instrument, trace, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::context::{CacheableRow, ReadContext, WriteContext};
use super::error::CacheError;
use super::interceptor::{ReadPlan, log_decision};
use super::invalidation::{InvalidationDispatcher, InvalidationPlan};
use super::keys::Namespace;
use super::outcome::CacheOutcome;
use super::singleflight::{Flight, FlightOwner, SingleFlight};
use super::stats::Stats;
use super::store::{KvStore, MemoryStore};

/// What the host should do after [`QueryCache::before_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    /// The context already holds the result; skip the real query.
    Resolved,
    /// Run the real query, then call [`QueryCache::after_read`].
    Execute,
}

/// Cache-aside interception layer for one data-access client.
#[derive(Clone)]
pub struct QueryCache {
    config: Arc<CacheConfig>,
    namespace: Namespace,
    store: Arc<dyn KvStore>,
    flights: SingleFlight,
    stats: Arc<Stats>,
    dispatcher: InvalidationDispatcher,
}

impl QueryCache {
    /// Build a cache instance over `store`.
    ///
    /// Fails only if the configuration is invalid.
    pub fn new(config: CacheConfig, store: Arc<dyn KvStore>) -> Result<Self, CacheError> {
        config.validate()?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let namespace = Namespace::new(&config.key_prefix, &instance_id);
        let config = Arc::new(config);
        let flights = SingleFlight::new();
        let dispatcher = InvalidationDispatcher::new(
            Arc::clone(&config),
            namespace.clone(),
            Arc::clone(&store),
            flights.clone(),
        );

        info!(
            level = %config.level,
            instance_id,
            tables = ?config.tables,
            ttl_ms = config.ttl().as_millis() as u64,
            async_write = config.async_write,
            "query cache ready"
        );

        Ok(Self {
            config,
            namespace,
            store,
            flights,
            stats: Arc::new(Stats::new()),
            dispatcher,
        })
    }

    /// Build a cache instance over a fresh [`MemoryStore`].
    pub fn with_memory_store(config: CacheConfig) -> Result<Self, CacheError> {
        let store = Arc::new(MemoryStore::new(&config));
        Self::new(config, store)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn single_flight(&self) -> &SingleFlight {
        &self.flights
    }

    /// Try to resolve a read before the real query runs.
    ///
    /// Joins an in-flight identical read if there is one. Otherwise this call
    /// becomes the owner of the read and must be followed by
    /// [`after_read`](Self::after_read) when the decision is
    /// [`ReadDecision::Execute`].
    #[instrument(skip_all, fields(table = ctx.table()))]
    pub async fn before_read<T, E>(&self, ctx: &mut ReadContext<T, E>) -> ReadDecision
    where
        T: CacheableRow,
        E: Clone + Send + Sync + 'static,
    {
        let Some(plan) = ReadPlan::for_read(&self.config, &self.namespace, ctx) else {
            return ReadDecision::Execute;
        };

        loop {
            match self.flights.enter(plan.search_key().as_str()) {
                Flight::Owner(owner) => {
                    let resolved = plan
                        .resolve::<T>(self.store.as_ref(), &self.config)
                        .await;

                    let Some((rows, outcome)) = resolved else {
                        self.record(&plan, &CacheOutcome::Miss);
                        ctx.outcome = CacheOutcome::Miss;
                        ctx.flight = Some(owner);
                        ctx.plan = Some(plan);
                        return ReadDecision::Execute;
                    };

                    let result: Result<Vec<T>, E> = Ok(rows);
                    let rows_affected = result.as_ref().map_or(0, |rows| rows.len() as u64);
                    owner.complete(outcome.clone(), &result, rows_affected);
                    self.record(&plan, &outcome);
                    ctx.set_result(result);
                    ctx.outcome = outcome;
                    return ReadDecision::Resolved;
                }
                Flight::Waiter(waiter) => {
                    let Some(completion) = waiter.wait().await else {
                        trace!("in-flight owner abandoned the read, retrying");
                        continue;
                    };

                    let Some(result) = completion.snapshot::<Result<Vec<T>, E>>() else {
                        warn!(
                            key = %plan.search_key(),
                            "in-flight read produced a different row type"
                        );
                        self.record(&plan, &CacheOutcome::Miss);
                        ctx.outcome = CacheOutcome::Miss;
                        ctx.plan = Some(plan);
                        return ReadDecision::Execute;
                    };

                    let outcome = CacheOutcome::single_flight(completion.outcome().clone());
                    self.record(&plan, &outcome);
                    ctx.set_result(result);
                    ctx.outcome = outcome;
                    return ReadDecision::Resolved;
                }
            }
        }
    }

    /// Cache the real query's result and release any waiters.
    ///
    /// A read whose flight was detached by a concurrent write still hands its
    /// rows to the waiters that joined it, but never writes them to the store.
    #[instrument(skip_all, fields(table = ctx.table()))]
    pub async fn after_read<T, E>(&self, ctx: &mut ReadContext<T, E>)
    where
        T: CacheableRow,
        E: Clone + Send + Sync + 'static,
    {
        let mut flight = ctx.flight.take();
        let Some(plan) = ctx.plan.take() else {
            return;
        };

        let Some(result) = ctx.take_result() else {
            // dropping the owner sends waiters back to run the query themselves
            warn!(key = %plan.search_key(), "read finished without a result, releasing waiters");
            return;
        };
        ctx.outcome = match &result {
            Ok(_) => CacheOutcome::Miss,
            Err(_) => CacheOutcome::Error,
        };
        let rows_affected = result.as_ref().map_or(0, |rows| rows.len() as u64);

        if let Ok(rows) = &result {
            if self.config.async_write {
                if let Some(owner) = flight.as_mut() {
                    owner.release(ctx.outcome.clone(), &result, rows_affected);
                }
                let owner = flight.take();
                let store = Arc::clone(&self.store);
                let config = Arc::clone(&self.config);
                let rows = rows.clone();
                tokio::spawn(async move {
                    populate_fresh(store.as_ref(), &config, &plan, &rows, owner.as_ref()).await;
                });
            } else {
                populate_fresh(self.store.as_ref(), &self.config, &plan, rows, flight.as_ref())
                    .await;
            }
        }

        if let Some(mut owner) = flight {
            let waiters = owner.release(ctx.outcome.clone(), &result, rows_affected);
            if waiters > 0 {
                trace!(waiters, outcome = %ctx.outcome, "released single-flight waiters");
            }
        }

        ctx.set_result(result);
    }

    /// Invalidate whatever a successful write may have made stale.
    pub async fn after_write(&self, ctx: &WriteContext) -> Option<InvalidationPlan> {
        self.dispatcher.after_write(ctx).await
    }

    /// Run a read through the whole hook lifecycle.
    ///
    /// `run` is only invoked when the read cannot be answered from cache.
    pub async fn query<T, E, F, Fut>(&self, mut ctx: ReadContext<T, E>, run: F) -> ReadContext<T, E>
    where
        T: CacheableRow,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
    {
        if self.before_read(&mut ctx).await == ReadDecision::Execute {
            let result = run().await;
            ctx.set_result(result);
            self.after_read(&mut ctx).await;
        }
        ctx
    }

    /// Run a write and invalidate after it succeeds.
    ///
    /// `run` returns the number of affected rows.
    pub async fn execute<E, F, Fut>(&self, mut ctx: WriteContext, run: F) -> Result<u64, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64, E>>,
    {
        let rows_affected = run().await?;
        ctx.set_rows_affected(rows_affected);
        self.after_write(&ctx).await;
        Ok(rows_affected)
    }

    /// Remove every search entry of `table`.
    pub async fn invalidate_search_cache(&self, table: &str) -> Result<u64, CacheError> {
        self.dispatcher.invalidate_search(table).await
    }

    /// Remove the primary entries of `keys` in `table`.
    pub async fn invalidate_primary_cache<I, S>(&self, table: &str, keys: I) -> Result<u64, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.dispatcher.invalidate_primary(table, &keys).await
    }

    /// Remove every primary entry of `table`.
    pub async fn invalidate_all_primary_cache(&self, table: &str) -> Result<u64, CacheError> {
        self.dispatcher.invalidate_all_primary(table).await
    }

    /// Remove every entry written by this instance.
    pub async fn reset_cache(&self) -> Result<u64, CacheError> {
        self.dispatcher.reset().await
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn hit_count(&self) -> u64 {
        self.stats.hit_count()
    }

    pub fn miss_count(&self) -> u64 {
        self.stats.miss_count()
    }

    pub fn lookup_count(&self) -> u64 {
        self.stats.lookup_count()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats.hit_rate()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn record(&self, plan: &ReadPlan, outcome: &CacheOutcome) {
        self.stats.record(outcome);
        log_decision(&self.config, plan.table(), plan.search_key(), outcome);
    }
}

/// Populate unless a write detached `owner`'s flight.
async fn populate_fresh<T: CacheableRow>(
    store: &dyn KvStore,
    config: &CacheConfig,
    plan: &ReadPlan,
    rows: &[T],
    owner: Option<&FlightOwner>,
) {
    let detached = || owner.is_some_and(FlightOwner::is_forgotten);
    if detached() {
        trace!(key = %plan.search_key(), "read overtaken by a write, not caching");
        return;
    }

    plan.populate(store, config, rows).await;

    // the write may have landed while the entries were being written
    if detached() {
        trace!(key = %plan.search_key(), "read overtaken by a write, evicting");
        plan.evict(store, rows).await;
    }
}
