//! Cache-hit state machine and post-read population.
//!
//! A [`ReadPlan`] is computed once per read. Resolution walks the tiers in
//! order (primary keys, query result, not-found sentinel) and any fault along
//! the way falls through to a miss so the real query runs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::config::CacheConfig;
use super::context::{CacheableRow, Lookup, ReadContext, ResultShape};
use super::error::{CacheError, StoreError, absorb};
use super::keys::{CacheKey, Namespace};
use super::outcome::CacheOutcome;
use super::store::KvStore;

const SOURCE: &str = "cache::interceptor";

/// Value stored under a search key when the query matched nothing.
pub(crate) const NOT_FOUND_SENTINEL: &[u8] = b"\0rowcache:not_found";

#[derive(Deserialize)]
struct SearchPayload<T> {
    row_count: u64,
    rows: Vec<T>,
}

#[derive(Serialize)]
struct SearchPayloadRef<'a, T> {
    row_count: u64,
    rows: &'a [T],
}

/// Keys and enabled tiers for one read.
#[derive(Debug, Clone)]
pub(crate) struct ReadPlan {
    table: String,
    search_key: CacheKey,
    primary_prefix: String,
    primary_keys: Vec<String>,
    shape: ResultShape,
    use_primary: bool,
    use_search: bool,
}

impl ReadPlan {
    /// `None` when neither tier applies to the read's table.
    pub(crate) fn for_read<T, E>(
        config: &CacheConfig,
        namespace: &Namespace,
        ctx: &ReadContext<T, E>,
    ) -> Option<Self> {
        let table = ctx.table();
        let use_primary = config.primary_enabled(table);
        let use_search = config.search_enabled(table);
        if !use_primary && !use_search {
            return None;
        }

        let primary_keys = match ctx.lookup() {
            Lookup::PrimaryKeys(keys) if use_primary => namespace
                .primary_keys(table, keys)
                .into_iter()
                .map(CacheKey::into_string)
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            table: table.to_string(),
            search_key: namespace.search_key(table, ctx.query(), ctx.params()),
            primary_prefix: namespace.primary_prefix(table),
            primary_keys,
            shape: ctx.shape(),
            use_primary,
            use_search,
        })
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn search_key(&self) -> &CacheKey {
        &self.search_key
    }

    /// Try to answer the read from cache.
    pub(crate) async fn resolve<T: CacheableRow>(
        &self,
        store: &dyn KvStore,
        config: &CacheConfig,
    ) -> Option<(Vec<T>, CacheOutcome)> {
        if let Some(rows) = self.resolve_primary(store).await {
            return Some((rows, CacheOutcome::PrimaryHit));
        }
        if self.use_search {
            return self.resolve_search(store, config).await;
        }
        None
    }

    async fn resolve_primary<T: CacheableRow>(&self, store: &dyn KvStore) -> Option<Vec<T>> {
        if self.primary_keys.is_empty() {
            return None;
        }
        if self.shape == ResultShape::Single && self.primary_keys.len() > 1 {
            return None;
        }

        match store.batch_exists(&self.primary_keys).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(error) => {
                absorb(SOURCE, CacheError::store("batch_exists", error));
                return None;
            }
        }

        let values = match store.batch_get(&self.primary_keys).await {
            Ok(values) => values,
            // expired between the two calls
            Err(StoreError::Missing(_)) => return None,
            Err(error) => {
                absorb(SOURCE, CacheError::store("batch_get", error));
                return None;
            }
        };

        values
            .iter()
            .map(|value| serde_json::from_slice::<T>(value).map_err(CacheError::deserialization))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| absorb(SOURCE, error))
            .ok()
    }

    async fn resolve_search<T: CacheableRow>(
        &self,
        store: &dyn KvStore,
        config: &CacheConfig,
    ) -> Option<(Vec<T>, CacheOutcome)> {
        let value = match store.get(self.search_key.as_str()).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(error) => {
                absorb(SOURCE, CacheError::store("get", error));
                return None;
            }
        };

        if value.as_ref() == NOT_FOUND_SENTINEL {
            return config
                .penetration_protection()
                .then(|| (Vec::new(), CacheOutcome::NotFoundHit));
        }

        match decode_search::<T>(&value) {
            Ok(rows) if self.shape == ResultShape::Single && rows.len() > 1 => None,
            Ok(rows) => Some((rows, CacheOutcome::SearchHit)),
            Err(error) => {
                absorb(SOURCE, error);
                None
            }
        }
    }

    /// Write a fresh result into every enabled tier.
    pub(crate) async fn populate<T: CacheableRow>(
        &self,
        store: &dyn KvStore,
        config: &CacheConfig,
        rows: &[T],
    ) {
        if rows.is_empty() {
            if self.use_search && config.penetration_protection() {
                let sentinel = Bytes::from_static(NOT_FOUND_SENTINEL);
                if let Err(error) = store
                    .set(self.search_key.as_str(), sentinel, config.jittered_ttl())
                    .await
                {
                    absorb(SOURCE, CacheError::store("set", error));
                }
            }
            return;
        }

        if config.exceeds_item_limit(rows.len()) {
            trace!(
                table = %self.table,
                rows = rows.len(),
                max_item_count = config.max_item_count,
                "result too large to cache"
            );
            return;
        }

        if self.use_primary {
            self.populate_primary(store, config, rows).await;
        }
        if self.use_search && !(self.shape == ResultShape::Single && rows.len() > 1) {
            self.populate_search(store, config, rows).await;
        }
    }

    /// Remove whatever [`populate`](Self::populate) may have written for `rows`.
    pub(crate) async fn evict<T: CacheableRow>(&self, store: &dyn KvStore, rows: &[T]) {
        let mut keys: Vec<String> = Vec::with_capacity(rows.len() + 1);
        if self.use_primary {
            keys.extend(
                rows.iter()
                    .map(|row| format!("{}{}", self.primary_prefix, row.primary_key())),
            );
        }
        if self.use_search {
            keys.push(self.search_key.as_str().to_string());
        }

        for key in &keys {
            if let Err(error) = store.delete(key).await {
                absorb(SOURCE, CacheError::store("delete", error));
            }
        }
    }

    async fn populate_primary<T: CacheableRow>(
        &self,
        store: &dyn KvStore,
        config: &CacheConfig,
        rows: &[T],
    ) {
        let entries = rows
            .iter()
            .map(|row| {
                let key = format!("{}{}", self.primary_prefix, row.primary_key());
                serde_json::to_vec(row)
                    .map(|encoded| (key, Bytes::from(encoded)))
                    .map_err(CacheError::serialization)
            })
            .collect::<Result<Vec<_>, _>>();

        let entries = match entries {
            Ok(entries) => entries,
            Err(error) => return absorb(SOURCE, error),
        };
        if let Err(error) = store.batch_set(entries, config.jittered_ttl()).await {
            absorb(SOURCE, CacheError::store("batch_set", error));
        }
    }

    async fn populate_search<T: CacheableRow>(
        &self,
        store: &dyn KvStore,
        config: &CacheConfig,
        rows: &[T],
    ) {
        let payload = SearchPayloadRef {
            row_count: rows.len() as u64,
            rows,
        };
        let encoded = match serde_json::to_vec(&payload) {
            Ok(encoded) => Bytes::from(encoded),
            Err(error) => return absorb(SOURCE, CacheError::serialization(error)),
        };
        if let Err(error) = store
            .set(self.search_key.as_str(), encoded, config.jittered_ttl())
            .await
        {
            absorb(SOURCE, CacheError::store("set", error));
        }
    }
}

fn decode_search<T: CacheableRow>(value: &[u8]) -> Result<Vec<T>, CacheError> {
    let payload: SearchPayload<T> =
        serde_json::from_slice(value).map_err(CacheError::deserialization)?;
    if payload.row_count != payload.rows.len() as u64 {
        return Err(CacheError::Deserialization(format!(
            "payload declares {} rows but carries {}",
            payload.row_count,
            payload.rows.len()
        )));
    }
    Ok(payload.rows)
}

/// Log one hit/miss decision, at debug level when `debug_mode` is set.
pub(crate) fn log_decision(config: &CacheConfig, table: &str, key: &CacheKey, outcome: &CacheOutcome) {
    if config.debug_mode {
        debug!(table, key = %key, outcome = %outcome, "cache decision");
    } else {
        trace!(table, key = %key, outcome = %outcome, "cache decision");
    }
}
