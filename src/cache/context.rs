//! Operation contexts passed through the hooks.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::interceptor::ReadPlan;
use super::keys::Param;
use super::outcome::CacheOutcome;
use super::singleflight::FlightOwner;

/// A row type the cache can store in both tiers.
///
/// The primary key is extracted by the row itself rather than discovered at
/// runtime, so the call site decides which column identifies a row.
pub trait CacheableRow: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn primary_key(&self) -> String;
}

/// Shape of the container a read fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// At most one row.
    Single,
    /// Any number of rows.
    Collection,
}

/// How a read selects its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Pure primary-key lookup with no other predicate.
    PrimaryKeys(Vec<String>),
    /// Anything else.
    Filtered,
}

/// Context of one read operation.
///
/// The host fills the result after running the real query; hooks may fill it
/// instead when the read is resolved from cache.
pub struct ReadContext<T, E> {
    table: String,
    query: String,
    params: Vec<Param>,
    lookup: Lookup,
    shape: ResultShape,
    result: Option<Result<Vec<T>, E>>,
    pub(crate) outcome: CacheOutcome,
    pub(crate) flight: Option<FlightOwner>,
    pub(crate) plan: Option<ReadPlan>,
}

impl<T, E> ReadContext<T, E> {
    pub fn new(table: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            query: query.into(),
            params: Vec::new(),
            lookup: Lookup::Filtered,
            shape: ResultShape::Collection,
            result: None,
            outcome: CacheOutcome::Miss,
            flight: None,
            plan: None,
        }
    }

    pub fn bind(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn bind_all<I, P>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Param>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Mark the read as a pure lookup of `keys`.
    pub fn by_primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookup = Lookup::PrimaryKeys(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Mark the read as a pure lookup of one row.
    pub fn by_primary_key(self, key: impl Into<String>) -> Self {
        self.by_primary_keys([key]).single()
    }

    pub fn single(mut self) -> Self {
        self.shape = ResultShape::Single;
        self
    }

    pub fn collection(mut self) -> Self {
        self.shape = ResultShape::Collection;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn lookup(&self) -> &Lookup {
        &self.lookup
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    pub fn outcome(&self) -> &CacheOutcome {
        &self.outcome
    }

    pub fn result(&self) -> Option<&Result<Vec<T>, E>> {
        self.result.as_ref()
    }

    /// Record the real query's result.
    pub fn set_result(&mut self, result: Result<Vec<T>, E>) {
        self.result = Some(result);
    }

    pub fn take_result(&mut self) -> Option<Result<Vec<T>, E>> {
        self.result.take()
    }

    /// Rows produced by the read, zero when it failed or has not run.
    pub fn rows_affected(&self) -> u64 {
        match &self.result {
            Some(Ok(rows)) => rows.len() as u64,
            _ => 0,
        }
    }

    /// Final result; a read that produced nothing resolves to no rows.
    pub fn into_result(mut self) -> Result<Vec<T>, E> {
        self.result.take().unwrap_or_else(|| Ok(Vec::new()))
    }

    /// Final result of a single-row read.
    pub fn into_single(self) -> Result<Option<T>, E> {
        self.into_result().map(|rows| rows.into_iter().next())
    }
}

impl<T, E> fmt::Debug for ReadContext<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadContext")
            .field("table", &self.table)
            .field("query", &self.query)
            .field("params", &self.params)
            .field("lookup", &self.lookup)
            .field("shape", &self.shape)
            .field("outcome", &self.outcome)
            .field("owner", &self.flight.is_some())
            .finish_non_exhaustive()
    }
}

/// Kind of a write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context of one write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    table: String,
    kind: WriteKind,
    rows_affected: u64,
    primary_keys: Vec<String>,
}

impl WriteContext {
    pub fn new(table: impl Into<String>, kind: WriteKind) -> Self {
        Self {
            table: table.into(),
            kind,
            rows_affected: 0,
            primary_keys: Vec::new(),
        }
    }

    pub fn create(table: impl Into<String>) -> Self {
        Self::new(table, WriteKind::Create)
    }

    pub fn update(table: impl Into<String>) -> Self {
        Self::new(table, WriteKind::Update)
    }

    pub fn delete(table: impl Into<String>) -> Self {
        Self::new(table, WriteKind::Delete)
    }

    /// Primary keys named by the write's filter, when it is key-addressable.
    pub fn with_primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = rows;
        self
    }

    pub fn set_rows_affected(&mut self, rows: u64) {
        self.rows_affected = rows;
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_defaults_to_filtered_collection() {
        let ctx: ReadContext<String, ()> = ReadContext::new("orders", "SELECT * FROM orders");
        assert_eq!(ctx.lookup(), &Lookup::Filtered);
        assert_eq!(ctx.shape(), ResultShape::Collection);
        assert_eq!(ctx.outcome(), &CacheOutcome::Miss);
        assert!(ctx.result().is_none());
    }

    #[test]
    fn primary_key_lookup_is_single() {
        let ctx: ReadContext<String, ()> =
            ReadContext::new("orders", "SELECT * FROM orders WHERE id = ?")
                .bind(5_i64)
                .by_primary_key("5");
        assert_eq!(ctx.lookup(), &Lookup::PrimaryKeys(vec!["5".to_string()]));
        assert_eq!(ctx.shape(), ResultShape::Single);
        assert_eq!(ctx.params(), &[Param::Int(5)]);
    }

    #[test]
    fn empty_read_resolves_to_no_rows() {
        let ctx: ReadContext<String, ()> = ReadContext::new("orders", "q");
        assert_eq!(ctx.into_result(), Ok(Vec::new()));
    }

    #[test]
    fn rows_affected_counts_successful_rows() {
        let mut ctx: ReadContext<u32, &str> = ReadContext::new("orders", "q");
        ctx.set_result(Ok(vec![1, 2]));
        assert_eq!(ctx.rows_affected(), 2);

        ctx.set_result(Err("boom"));
        assert_eq!(ctx.rows_affected(), 0);
        assert_eq!(ctx.into_single(), Err("boom"));
    }

    #[test]
    fn write_builder_collects_keys() {
        let ctx = WriteContext::update("orders")
            .with_primary_keys(["5", "6"])
            .with_rows_affected(2);
        assert_eq!(ctx.kind(), WriteKind::Update);
        assert_eq!(ctx.primary_keys(), &["5".to_string(), "6".to_string()]);
        assert_eq!(ctx.rows_affected(), 2);
    }
}
