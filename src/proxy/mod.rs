//! Proxy module for filtering and checking proxies
//!
//! This module provides functionality for:
//! - Parsing proxy endpoints from strings and files
//! - Filtering stored proxies into a randomized list of check tasks
//! - Probing proxies through an IP-info endpoint
//! - Running probes on a cancellable worker pool
//! - Persisting results in a JSON proxy database

pub mod checker;
pub mod filter;
pub mod models;
pub mod parser;
pub mod pool;
pub mod status;
pub mod store;

pub use checker::{CheckerConfig, HttpProber, Prober};
pub use filter::{build_tasks, parse_duration, FilterCriteria};
pub use models::{fold_outcomes, CheckTask, FailureReason, ProbeOutcome, Protocol, ProxyRecord};
pub use parser::ProxyParser;
pub use pool::{CheckerPool, PoolConfig, PoolHandle, PoolReport, PoolStatus, Progress};
pub use status::{StatusReporter, StatusSnapshot};
pub use store::{JsonFileStore, RecordStore};
