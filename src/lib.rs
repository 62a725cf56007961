//! Proxion - Proxy Checker
//!
//! Keeps a database of proxies and checks them concurrently, recording
//! which protocols work, their latency and their exit country.

pub mod error;
pub mod logging;
pub mod proxy;

pub use error::{Error, Result};
pub use proxy::*;

use std::path::PathBuf;

/// Default proxy database file name
pub const DEFAULT_DB_FILE: &str = "proxydb.json";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the proxy database
    pub store_dir: PathBuf,
    /// Database file name inside `store_dir`
    pub db_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            store_dir: home.join(".cache").join("proxion"),
            db_file: DEFAULT_DB_FILE.to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = dir;
        self
    }

    pub fn with_db_file(mut self, name: String) -> Self {
        self.db_file = name;
        self
    }

    /// Full path of the proxy database
    pub fn db_path(&self) -> PathBuf {
        self.store_dir.join(&self.db_file)
    }
}
