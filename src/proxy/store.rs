//! Proxy database
//!
//! The checker only talks to persistence through [`RecordStore`]. The
//! bundled [`JsonFileStore`] keeps every record in one JSON object keyed by
//! endpoint:
//!
//! ```json
//! {
//!   "1.2.3.4:8080": {"protos": ["http"], "last_check": 1700000000.25, "last_lat": 0.4, "exit_country": "US"}
//! }
//! ```

use crate::error::Result;
use crate::proxy::models::{ProxyRecord, RecordInfo};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read/write access to persisted proxy records
pub trait RecordStore {
    /// Every stored record.
    fn load_all(&self) -> Result<Vec<ProxyRecord>>;

    /// Merge fresh records into the stored ones, adding unknown endpoints.
    /// Returns the number of records written.
    fn merge_many(&mut self, records: &[ProxyRecord]) -> Result<usize>;

    /// Add records whose endpoints are not stored yet. Returns how many were
    /// added.
    fn insert_new(&mut self, records: &[ProxyRecord]) -> Result<usize>;

    /// Remove the given endpoints. Returns how many were present.
    fn remove_many(&mut self, endpoints: &[String]) -> Result<usize>;
}

/// Record store backed by a single JSON file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, RecordInfo>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), records = entries.len(), "opened proxy database");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.entries.contains_key(endpoint)
    }

    pub fn get(&self, endpoint: &str) -> Result<Option<ProxyRecord>> {
        self.entries
            .get(endpoint)
            .map(|info| ProxyRecord::from_entry(endpoint, info.clone()))
            .transpose()
    }

    /// Write the database, replacing the file atomically.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.entries)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), records = self.entries.len(), "saved proxy database");
        Ok(())
    }
}

impl RecordStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<ProxyRecord>> {
        let mut records = Vec::with_capacity(self.entries.len());
        for (endpoint, info) in &self.entries {
            match ProxyRecord::from_entry(endpoint, info.clone()) {
                Ok(record) => records.push(record),
                Err(e) => warn!(%endpoint, error = %e, "skipping invalid database entry"),
            }
        }
        Ok(records)
    }

    fn merge_many(&mut self, records: &[ProxyRecord]) -> Result<usize> {
        for fresh in records {
            let merged = match self.get(fresh.endpoint())? {
                Some(mut existing) => {
                    existing.update(fresh)?;
                    existing
                }
                None => fresh.clone(),
            };
            let (endpoint, info) = merged.to_entry();
            self.entries.insert(endpoint, info);
        }
        if !records.is_empty() {
            self.save()?;
        }
        Ok(records.len())
    }

    fn insert_new(&mut self, records: &[ProxyRecord]) -> Result<usize> {
        let mut added = 0;
        for record in records {
            if self.contains(record.endpoint()) {
                continue;
            }
            let (endpoint, info) = record.to_entry();
            self.entries.insert(endpoint, info);
            added += 1;
        }
        if added > 0 {
            self.save()?;
        }
        Ok(added)
    }

    fn remove_many(&mut self, endpoints: &[String]) -> Result<usize> {
        let removed = endpoints
            .iter()
            .filter(|e| self.entries.remove(e.as_str()).is_some())
            .count();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::proxy::models::Protocol;
    use std::collections::BTreeSet;

    fn record(endpoint: &str, protocol: Protocol, latency: f64) -> ProxyRecord {
        let mut r = ProxyRecord::with_protocol(endpoint, protocol).unwrap();
        r.last_latency_secs = Some(latency);
        r.exit_country = Some("US".to_string());
        r
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("proxydb.json")).unwrap();
        assert!(store.is_empty());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_merge_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("proxydb.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        store
            .merge_many(&[record("1.1.1.1:80", Protocol::Http, 0.5)])
            .unwrap();
        store
            .merge_many(&[record("1.1.1.1:80", Protocol::Socks5, 0.2)])
            .unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        let stored = reopened.get("1.1.1.1:80").unwrap().unwrap();
        assert_eq!(
            stored.protocols,
            BTreeSet::from([Protocol::Socks5, Protocol::Http])
        );
        assert_eq!(stored.last_latency_secs, Some(0.2));
    }

    #[test]
    fn test_insert_new_keeps_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::open(dir.path().join("db.json")).unwrap();
        store
            .merge_many(&[record("1.1.1.1:80", Protocol::Http, 0.5)])
            .unwrap();

        let added = store
            .insert_new(&[
                ProxyRecord::new("1.1.1.1:80").unwrap(),
                ProxyRecord::new("2.2.2.2:80").unwrap(),
            ])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.len(), 2);
        let kept = store.get("1.1.1.1:80").unwrap().unwrap();
        assert_eq!(kept.last_latency_secs, Some(0.5));
    }

    #[test]
    fn test_remove_many() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileStore::open(dir.path().join("db.json")).unwrap();
        store
            .insert_new(&[
                ProxyRecord::new("1.1.1.1:80").unwrap(),
                ProxyRecord::new("2.2.2.2:80").unwrap(),
            ])
            .unwrap();

        let removed = store
            .remove_many(&["2.2.2.2:80".to_string(), "9.9.9.9:80".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.contains("1.1.1.1:80"));
        assert!(!store.contains("2.2.2.2:80"));
    }

    #[test]
    fn test_reads_persisted_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(
            &path,
            r#"{
                "1.2.3.4:8080": {"protos": ["https"], "last_check": 1700000000, "last_lat": 1.25, "exit_country": "FR"},
                "5.6.7.8:1080": {"protos": [], "last_check": null, "last_lat": null, "exit_country": null},
                "bogus": {"protos": []}
            }"#,
        )
        .unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].endpoint(), "1.2.3.4:8080");
        assert_eq!(records[0].exit_country.as_deref(), Some("FR"));
        assert!(records[1].last_checked_at.is_none());
    }

    #[test]
    fn test_fractional_check_times_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(
            &path,
            r#"{"1.2.3.4:8080": {"protos": ["socks4"], "last_check": 1700000000.532, "last_lat": 0.8, "exit_country": "BR"}}"#,
        )
        .unwrap();

        let mut store = JsonFileStore::open(&path).unwrap();
        let loaded = store.get("1.2.3.4:8080").unwrap().unwrap();
        let checked_at = chrono::DateTime::from_timestamp(1_700_000_000, 532_000_000);
        assert_eq!(loaded.last_checked_at, checked_at);

        store.merge_many(&[ProxyRecord::new("5.6.7.8:80").unwrap()]).unwrap();
        let reopened = JsonFileStore::open(&path).unwrap();
        let kept = reopened.get("1.2.3.4:8080").unwrap().unwrap();
        assert_eq!(kept, loaded);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(Error::Serialization(_))
        ));
    }
}
