//! Rollup scheduling core for sharded time-series storage.
//!
//! Time is cut into slots at several resolutions that wrap around a fixed
//! wheel. Ingested samples mark their slots active; once a slot stays idle
//! long enough it is scheduled for rollup, finer tiers first. Slot states are
//! pushed to and pulled from a shared store so several instances can divide
//! shards between them and fail over.

pub mod clock;
pub mod config;
pub mod export;
pub mod granularity;
pub mod ingest;
pub mod migrate;
pub mod rollup;
pub mod schedule;
pub mod service;
pub mod store;
pub mod sync;
