//! Proxy parser module for reading proxy endpoints from strings and files

use crate::error::Result;
use crate::proxy::models::{Protocol, ProxyRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::warn;

/// `scheme://IP:PORT`, with an optional trailing slash
static URL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45])://([^/\s]+?)/?$").expect("valid proxy url regex")
});

/// Proxy parser for reading endpoints from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - scheme://IP:PORT (the scheme becomes the record's known protocol)
    ///
    /// Returns `Ok(None)` for blank lines and `#` comments.
    pub fn parse_line(line: &str) -> Result<Option<ProxyRecord>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        if let Some(caps) = URL_FORMAT.captures(line) {
            let protocol: Protocol = caps[1].parse()?;
            return ProxyRecord::with_protocol(&caps[2], protocol).map(Some);
        }

        ProxyRecord::new(line).map(Some)
    }

    /// Parse proxies from a string (multiple lines), skipping invalid lines
    pub fn parse_string(content: &str, source: &str) -> Vec<ProxyRecord> {
        content
            .lines()
            .enumerate()
            .filter_map(|(idx, line)| match Self::parse_line(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(source, line = idx + 1, error = %e, "invalid proxy line");
                    None
                }
            })
            .collect()
    }

    /// Parse proxies from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyRecord>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Ok(Self::parse_string(&content, &path.display().to_string()))
    }

    /// Save endpoints to a file, one per line
    pub fn save_to_file<P: AsRef<Path>>(records: &[ProxyRecord], path: P) -> Result<()> {
        let mut content = records
            .iter()
            .map(|r| r.endpoint())
            .collect::<Vec<_>>()
            .join("\n");
        content.push('\n');

        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::BTreeSet;

    #[test]
    fn test_parse_simple_format() {
        let record = ProxyParser::parse_line("192.168.1.1:8080").unwrap().unwrap();
        assert_eq!(record.endpoint(), "192.168.1.1:8080");
        assert!(record.protocols.is_empty());
    }

    #[test]
    fn test_parse_url_format_http() {
        let record = ProxyParser::parse_line("http://192.168.1.1:8080/")
            .unwrap()
            .unwrap();
        assert_eq!(record.endpoint(), "192.168.1.1:8080");
        assert_eq!(record.protocols, BTreeSet::from([Protocol::Http]));
    }

    #[test]
    fn test_parse_url_format_socks5() {
        let record = ProxyParser::parse_line("socks5://192.168.1.1:1080")
            .unwrap()
            .unwrap();
        assert_eq!(record.protocols, BTreeSet::from([Protocol::Socks5]));
    }

    #[test]
    fn test_parse_empty_and_comment_lines() {
        assert!(ProxyParser::parse_line("").unwrap().is_none());
        assert!(ProxyParser::parse_line("   ").unwrap().is_none());
        assert!(ProxyParser::parse_line("# This is a comment").unwrap().is_none());
    }

    #[test]
    fn test_parse_invalid_format() {
        for bad in [
            "invalid",
            "192.168.1.1",
            "192.168.1.1:abc",
            "192.168.1.1:8080:user:pass",
            "user:pass@192.168.1.1:8080",
            "socks5://example.com:1080",
        ] {
            assert!(
                matches!(ProxyParser::parse_line(bad), Err(Error::InvalidFormat(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_string_skips_invalid_lines() {
        let content = r#"
192.168.1.1:8080
not-a-proxy
# This is a comment
http://192.168.1.3:8080
10.0.0.1:99999
"#;
        let records = ProxyParser::parse_string(content, "inline");
        let endpoints: Vec<_> = records.iter().map(|r| r.endpoint()).collect();
        assert_eq!(endpoints, vec!["192.168.1.1:8080", "192.168.1.3:8080"]);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        let records = vec![
            ProxyRecord::new("1.2.3.4:80").unwrap(),
            ProxyRecord::new("5.6.7.8:3128").unwrap(),
        ];

        ProxyParser::save_to_file(&records, &path).unwrap();
        let loaded = ProxyParser::parse_file(&path).unwrap();
        assert_eq!(loaded, records);

        assert!(matches!(
            ProxyParser::parse_file(dir.path().join("missing.txt")),
            Err(Error::Io(_))
        ));
    }
}
