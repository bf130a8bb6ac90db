//! Runtime bootstrap for the rowcache binary.

pub mod error;
pub mod telemetry;
