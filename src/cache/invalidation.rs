//! Write-triggered invalidation.
//!
//! Every successful write removes the search tier of its table. Updates and
//! deletes also remove primary entries: the named keys when the write is
//! key-addressable, otherwise the whole primary tier of the table.

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use tracing::{info, instrument, trace, warn};

use super::config::CacheConfig;
use super::context::{WriteContext, WriteKind};
use super::error::{CacheError, absorb};
use super::keys::Namespace;
use super::metric_names::INVALIDATION_TOTAL;
use super::singleflight::SingleFlight;
use super::store::KvStore;

const SOURCE: &str = "cache::invalidation";

/// Primary-tier action for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryInvalidation {
    None,
    Keys(Vec<String>),
    All,
}

/// Tier actions computed for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub table: String,
    pub primary: PrimaryInvalidation,
    /// Whether every search entry of the table is removed.
    pub search: bool,
}

impl InvalidationPlan {
    pub fn for_write(ctx: &WriteContext) -> Self {
        let primary = match ctx.kind() {
            WriteKind::Create => PrimaryInvalidation::None,
            WriteKind::Update | WriteKind::Delete if ctx.primary_keys().is_empty() => {
                PrimaryInvalidation::All
            }
            WriteKind::Update | WriteKind::Delete => {
                PrimaryInvalidation::Keys(ctx.primary_keys().to_vec())
            }
        };

        Self {
            table: ctx.table().to_string(),
            primary,
            search: true,
        }
    }

    /// Drop actions on tiers the configuration never writes for this table.
    pub fn restrict_to(mut self, config: &CacheConfig) -> Self {
        if !config.primary_enabled(&self.table) {
            self.primary = PrimaryInvalidation::None;
        }
        if !config.search_enabled(&self.table) {
            self.search = false;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.primary == PrimaryInvalidation::None && !self.search
    }
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let primary = match &self.primary {
            PrimaryInvalidation::None => "none".to_string(),
            PrimaryInvalidation::Keys(keys) => format!("keys({})", keys.len()),
            PrimaryInvalidation::All => "all".to_string(),
        };
        write!(
            f,
            "InvalidationPlan {{ table: {}, primary: {primary}, search: {} }}",
            self.table, self.search
        )
    }
}

/// Applies invalidation plans against the backing store.
#[derive(Clone)]
pub(crate) struct InvalidationDispatcher {
    config: Arc<CacheConfig>,
    namespace: Namespace,
    store: Arc<dyn KvStore>,
    flights: SingleFlight,
}

impl InvalidationDispatcher {
    pub(crate) fn new(
        config: Arc<CacheConfig>,
        namespace: Namespace,
        store: Arc<dyn KvStore>,
        flights: SingleFlight,
    ) -> Self {
        Self {
            config,
            namespace,
            store,
            flights,
        }
    }

    /// Invalidate whatever `ctx` may have made stale.
    ///
    /// Returns the plan that was dispatched, or `None` if the write needs no
    /// invalidation.
    #[instrument(
        skip_all,
        fields(table = ctx.table(), kind = %ctx.kind(), rows_affected = ctx.rows_affected())
    )]
    pub(crate) async fn after_write(&self, ctx: &WriteContext) -> Option<InvalidationPlan> {
        if ctx.rows_affected() == 0
            || !self.config.invalidate_on_write
            || !self.config.table_enabled(ctx.table())
        {
            trace!("write needs no invalidation");
            return None;
        }

        let plan = InvalidationPlan::for_write(ctx).restrict_to(&self.config);
        if plan.is_empty() {
            return None;
        }
        self.dispatch(&plan).await;
        Some(plan)
    }

    /// Run both tier actions as independent tasks, awaited unless writes are async.
    async fn dispatch(&self, plan: &InvalidationPlan) {
        // every read of the table is keyed by its search key, whatever tier serves it;
        // readers arriving after this write must not join a pre-write flight
        self.detach_reads(&plan.table);

        let primary = (plan.primary != PrimaryInvalidation::None).then(|| {
            let store = Arc::clone(&self.store);
            let namespace = self.namespace.clone();
            let table = plan.table.clone();
            let action = plan.primary.clone();
            tokio::spawn(async move {
                match delete_primary(store.as_ref(), &namespace, &table, &action).await {
                    Ok(removed) => trace!(table, removed, "primary tier invalidated"),
                    Err(error) => absorb(SOURCE, error),
                }
            })
        });

        let search = plan.search.then(|| {
            let store = Arc::clone(&self.store);
            let namespace = self.namespace.clone();
            let table = plan.table.clone();
            tokio::spawn(async move {
                match delete_search(store.as_ref(), &namespace, &table).await {
                    Ok(removed) => trace!(table, removed, "search tier invalidated"),
                    Err(error) => absorb(SOURCE, error),
                }
            })
        });

        info!(plan = %plan, detached = self.config.async_write, "cache invalidation dispatched");
        if self.config.async_write {
            return;
        }

        for task in [primary, search].into_iter().flatten() {
            if let Err(error) = task.await {
                warn!(error = %error, "invalidation task failed");
            }
        }
    }

    fn detach_reads(&self, table: &str) {
        self.flights
            .forget_prefix(&self.namespace.search_prefix(table));
    }

    pub(crate) async fn invalidate_search(&self, table: &str) -> Result<u64, CacheError> {
        self.detach_reads(table);
        delete_search(self.store.as_ref(), &self.namespace, table).await
    }

    pub(crate) async fn invalidate_primary(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<u64, CacheError> {
        let action = PrimaryInvalidation::Keys(keys.to_vec());
        self.detach_reads(table);
        delete_primary(self.store.as_ref(), &self.namespace, table, &action).await
    }

    pub(crate) async fn invalidate_all_primary(&self, table: &str) -> Result<u64, CacheError> {
        self.detach_reads(table);
        delete_primary(
            self.store.as_ref(),
            &self.namespace,
            table,
            &PrimaryInvalidation::All,
        )
        .await
    }

    /// Remove every entry of this cache instance.
    pub(crate) async fn reset(&self) -> Result<u64, CacheError> {
        let prefix = self.namespace.instance_prefix();
        self.flights.forget_prefix(prefix);
        let removed = self
            .store
            .delete_by_prefix(prefix)
            .await
            .map_err(|error| CacheError::store("delete_by_prefix", error))?;
        counter!(INVALIDATION_TOTAL, "tier" => "all").increment(1);
        info!(removed, "cache reset");
        Ok(removed)
    }
}

async fn delete_primary(
    store: &dyn KvStore,
    namespace: &Namespace,
    table: &str,
    action: &PrimaryInvalidation,
) -> Result<u64, CacheError> {
    let removed = match action {
        PrimaryInvalidation::None => return Ok(0),
        PrimaryInvalidation::Keys(keys) => {
            let mut removed = 0;
            for key in namespace.primary_keys(table, keys) {
                let existed = store
                    .delete(key.as_str())
                    .await
                    .map_err(|error| CacheError::store("delete", error))?;
                removed += u64::from(existed);
            }
            removed
        }
        PrimaryInvalidation::All => store
            .delete_by_prefix(&namespace.primary_prefix(table))
            .await
            .map_err(|error| CacheError::store("delete_by_prefix", error))?,
    };
    counter!(INVALIDATION_TOTAL, "tier" => "primary").increment(1);
    Ok(removed)
}

async fn delete_search(
    store: &dyn KvStore,
    namespace: &Namespace,
    table: &str,
) -> Result<u64, CacheError> {
    let removed = store
        .delete_by_prefix(&namespace.search_prefix(table))
        .await
        .map_err(|error| CacheError::store("delete_by_prefix", error))?;
    counter!(INVALIDATION_TOTAL, "tier" => "search").increment(1);
    Ok(removed)
}
