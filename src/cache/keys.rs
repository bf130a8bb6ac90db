//! Cache key construction.
//!
//! Every key lives under `{prefix}:{instance}:` followed by a tier tag:
//!
//! - `p:{table}:{primary_key}` for the primary-key object tier
//! - `s:{table}:{signature}` for the query-result tier
//!
//! Tier prefixes end with the `:` separator so that a prefix for table
//! `order` never matches keys of table `orders`.

use std::fmt;

use serde::{Deserialize, Serialize};

const PRIMARY_TIER: &str = "p";
const SEARCH_TIER: &str = "s";
const PARAM_SEPARATOR: char = '|';

/// A bound query parameter, rendered into search-key signatures.
///
/// References convert to the same value as the owned form, so
/// `Param::from(&5_i64) == Param::from(5_i64)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Param {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Param {
    fn render(&self, out: &mut String) {
        use fmt::Write as _;

        // Writing into a String cannot fail.
        let _ = match self {
            Param::Null => write!(out, "null"),
            Param::Bool(value) => write!(out, "{value}"),
            Param::Int(value) => write!(out, "{value}"),
            Param::UInt(value) => write!(out, "{value}"),
            Param::Float(value) => write!(out, "{value:?}"),
            Param::Text(value) => write!(out, "{value:?}"),
            Param::Bytes(value) => {
                out.push_str("x'");
                for byte in value {
                    let _ = write!(out, "{byte:02x}");
                }
                write!(out, "'")
            }
        };
    }
}

macro_rules! param_from {
    ($variant:ident, $target:ty: $($source:ty),+) => {
        $(
            impl From<$source> for Param {
                fn from(value: $source) -> Self {
                    Param::$variant(<$target>::from(value))
                }
            }

            impl From<&$source> for Param {
                fn from(value: &$source) -> Self {
                    Param::from(value.clone())
                }
            }
        )+
    };
}

param_from!(Bool, bool: bool);
param_from!(Int, i64: i8, i16, i32, i64);
param_from!(UInt, u64: u8, u16, u32, u64);
param_from!(Float, f64: f32, f64);
param_from!(Text, String: String);
param_from!(Bytes, Vec<u8>: Vec<u8>);

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<&Param> for Param {
    fn from(value: &Param) -> Self {
        value.clone()
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(value: Option<T>) -> Self {
        value.map_or(Param::Null, Into::into)
    }
}

/// A fully namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Key builder scoped to one cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    pub fn new(prefix: &str, instance_id: &str) -> Self {
        Self {
            root: format!("{prefix}:{instance_id}:"),
        }
    }

    /// Prefix shared by every key of this instance.
    pub fn instance_prefix(&self) -> &str {
        &self.root
    }

    pub fn primary_key(&self, table: &str, primary_key: &str) -> CacheKey {
        CacheKey(format!("{}{primary_key}", self.primary_prefix(table)))
    }

    pub fn primary_keys<I, S>(&self, table: &str, primary_keys: I) -> Vec<CacheKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        primary_keys
            .into_iter()
            .map(|pk| self.primary_key(table, pk.as_ref()))
            .collect()
    }

    pub fn search_key(&self, table: &str, query: &str, params: &[Param]) -> CacheKey {
        let mut key = self.search_prefix(table);
        key.push_str(&signature(query, params));
        CacheKey(key)
    }

    pub fn primary_prefix(&self, table: &str) -> String {
        format!("{}{PRIMARY_TIER}:{table}:", self.root)
    }

    pub fn search_prefix(&self, table: &str) -> String {
        format!("{}{SEARCH_TIER}:{table}:", self.root)
    }
}

/// Normalized query text followed by every bound parameter.
pub fn signature(query: &str, params: &[Param]) -> String {
    let mut out = normalize_query(query);
    for param in params {
        out.push(PARAM_SEPARATOR);
        param.render(&mut out);
    }
    out
}

/// Collapse whitespace runs so formatting differences hash identically.
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}
