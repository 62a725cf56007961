//! Proxy data models

use crate::error::{Error, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// Proxy protocol enumeration
///
/// The declaration order is the order protocols are probed in when a record
/// expands into several tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Socks5,
    Socks4,
    Https,
    Http,
}

impl Protocol {
    /// Every protocol the checker knows how to probe.
    pub const ALL: [Protocol; 4] = [
        Protocol::Socks5,
        Protocol::Socks4,
        Protocol::Https,
        Protocol::Http,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Socks5 => "socks5",
            Protocol::Socks4 => "socks4",
            Protocol::Https => "https",
            Protocol::Http => "http",
        }
    }

    /// The full default protocol set.
    pub fn defaults() -> BTreeSet<Protocol> {
        Self::ALL.into_iter().collect()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socks5" => Ok(Protocol::Socks5),
            "socks4" => Ok(Protocol::Socks4),
            "https" => Ok(Protocol::Https),
            "http" => Ok(Protocol::Http),
            _ => Err(Error::UnknownProtocol(s.to_string())),
        }
    }
}

/// Check that `endpoint` is an `IPv4:port` pair.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let (ip, port) = endpoint
        .split_once(':')
        .ok_or_else(|| Error::invalid_format(endpoint))?;
    if port.contains(':') {
        return Err(Error::invalid_format(endpoint));
    }
    ip.parse::<Ipv4Addr>()
        .map_err(|_| Error::invalid_format(endpoint))?;
    port.parse::<u16>()
        .map_err(|_| Error::invalid_format(endpoint))?;
    Ok(())
}

/// Whether `endpoint` is an `IPv4:port` pair.
pub fn is_endpoint(endpoint: &str) -> bool {
    validate_endpoint(endpoint.trim()).is_ok()
}

/// Known state of one proxy endpoint.
///
/// The endpoint is fixed at construction. Everything else is replaced by
/// [`ProxyRecord::update`] when a fresh probe result comes in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, RecordInfo>",
    into = "BTreeMap<String, RecordInfo>"
)]
pub struct ProxyRecord {
    endpoint: String,
    pub protocols: BTreeSet<Protocol>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_latency_secs: Option<f64>,
    pub exit_country: Option<String>,
}

/// Persisted body of a record, keyed by its endpoint in the proxy database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordInfo {
    #[serde(default)]
    pub protos: Vec<Protocol>,
    #[serde(default, with = "epoch_seconds")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_lat: Option<f64>,
    #[serde(default)]
    pub exit_country: Option<String>,
}

/// `last_check` as fractional epoch seconds, kept to the microsecond.
/// Whole-second integers are read as well.
mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const MICROS_PER_SEC: f64 = 1_000_000.0;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_f64(at.timestamp_micros() as f64 / MICROS_PER_SEC),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) if secs.is_finite() => {
                DateTime::from_timestamp_micros((secs * MICROS_PER_SEC).round() as i64)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {secs}")))
            }
            Some(secs) => Err(de::Error::custom(format!("invalid timestamp: {secs}"))),
            None => Ok(None),
        }
    }
}

impl ProxyRecord {
    /// Create a record with no known state.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        validate_endpoint(endpoint)?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            protocols: BTreeSet::new(),
            last_checked_at: None,
            last_latency_secs: None,
            exit_country: None,
        })
    }

    /// Create a record with a single known protocol
    pub fn with_protocol(endpoint: &str, protocol: Protocol) -> Result<Self> {
        let mut record = Self::new(endpoint)?;
        record.protocols.insert(protocol);
        Ok(record)
    }

    /// Rebuild a record from its database entry.
    pub fn from_entry(endpoint: &str, info: RecordInfo) -> Result<Self> {
        let mut record = Self::new(endpoint)?;
        record.protocols = info.protos.into_iter().collect();
        record.last_checked_at = info.last_check;
        record.last_latency_secs = info.last_lat;
        record.exit_country = info.exit_country;
        Ok(record)
    }

    /// Split the record into its database key and body.
    pub fn to_entry(&self) -> (String, RecordInfo) {
        let info = RecordInfo {
            protos: self.protocols.iter().copied().collect(),
            last_check: self.last_checked_at,
            last_lat: self.last_latency_secs,
            exit_country: self.exit_country.clone(),
        };
        (self.endpoint.clone(), info)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Seconds since the last check, if the record was ever checked.
    pub fn check_age(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_checked_at.map(|at| (now - at).num_seconds())
    }

    /// Merge a fresh record for the same endpoint into this one.
    ///
    /// Known protocols are unioned, all other fields are replaced.
    pub fn update(&mut self, other: &ProxyRecord) -> Result<()> {
        if self.endpoint != other.endpoint {
            return Err(Error::MismatchedEndpoint {
                expected: self.endpoint.clone(),
                found: other.endpoint.clone(),
            });
        }
        self.protocols.extend(other.protocols.iter().copied());
        self.last_checked_at = other.last_checked_at;
        self.last_latency_secs = other.last_latency_secs;
        self.exit_country = other.exit_country.clone();
        Ok(())
    }
}

impl FromStr for ProxyRecord {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)
    }
}

impl TryFrom<BTreeMap<String, RecordInfo>> for ProxyRecord {
    type Error = Error;

    fn try_from(map: BTreeMap<String, RecordInfo>) -> Result<Self> {
        let mut entries = map.into_iter();
        match (entries.next(), entries.next()) {
            (Some((endpoint, info)), None) => Self::from_entry(&endpoint, info),
            _ => Err(Error::invalid_format("expected exactly one record entry")),
        }
    }
}

impl From<ProxyRecord> for BTreeMap<String, RecordInfo> {
    fn from(record: ProxyRecord) -> Self {
        BTreeMap::from([record.to_entry()])
    }
}

/// One `(endpoint, protocol)` pair to probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckTask {
    pub endpoint: String,
    pub protocol: Protocol,
}

impl CheckTask {
    pub fn new(endpoint: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            endpoint: endpoint.into(),
            protocol,
        }
    }

    /// Get the proxy URL string
    pub fn proxy_url(&self) -> String {
        format!("{}://{}", self.protocol, self.endpoint)
    }
}

impl fmt::Display for CheckTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.proxy_url())
    }
}

/// Why a probe did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Timeout,
    ConnectionError,
    /// The runtime cannot speak this proxy scheme at all. Not a property of
    /// the proxy being probed.
    ProtocolUnsupported,
    MalformedResponse,
    OtherError,
}

impl FailureReason {
    /// Whether the failure says something about the environment rather than
    /// the proxy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureReason::ProtocolUnsupported)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Timeout => "timed out",
            FailureReason::ConnectionError => "connection error",
            FailureReason::ProtocolUnsupported => "protocol unsupported",
            FailureReason::MalformedResponse => "malformed response",
            FailureReason::OtherError => "error",
        };
        f.write_str(s)
    }
}

/// Result of probing one task
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success {
        endpoint: String,
        protocol: Protocol,
        latency: Duration,
        exit_country: String,
        checked_at: DateTime<Utc>,
    },
    Failure {
        endpoint: String,
        protocol: Protocol,
        reason: FailureReason,
        /// Free-form diagnostics such as the raw status and body.
        detail: String,
    },
}

impl ProbeOutcome {
    pub fn success(task: &CheckTask, latency: Duration, exit_country: impl Into<String>) -> Self {
        ProbeOutcome::Success {
            endpoint: task.endpoint.clone(),
            protocol: task.protocol,
            latency,
            exit_country: exit_country.into(),
            // the database keeps microseconds
            checked_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub fn failure(task: &CheckTask, reason: FailureReason, detail: impl Into<String>) -> Self {
        ProbeOutcome::Failure {
            endpoint: task.endpoint.clone(),
            protocol: task.protocol,
            reason,
            detail: detail.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            ProbeOutcome::Success { endpoint, .. } | ProbeOutcome::Failure { endpoint, .. } => {
                endpoint
            }
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            ProbeOutcome::Success { protocol, .. } | ProbeOutcome::Failure { protocol, .. } => {
                *protocol
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ProbeOutcome::Failure { reason, .. } => Some(*reason),
            ProbeOutcome::Success { .. } => None,
        }
    }

    /// Convert a successful outcome into a fresh record for its endpoint.
    pub fn to_record(&self) -> Option<ProxyRecord> {
        match self {
            ProbeOutcome::Success {
                endpoint,
                protocol,
                latency,
                exit_country,
                checked_at,
            } => {
                let mut record = ProxyRecord::with_protocol(endpoint, *protocol).ok()?;
                record.last_checked_at = Some(*checked_at);
                record.last_latency_secs = Some(latency.as_secs_f64());
                record.exit_country = Some(exit_country.clone());
                Some(record)
            }
            ProbeOutcome::Failure { .. } => None,
        }
    }
}

/// Fold successful outcomes into one record per endpoint.
///
/// Several protocols can succeed for the same endpoint. Their protocols are
/// unioned and the latency and exit country come from the fastest success.
/// Records are returned in the order their endpoints first succeeded.
pub fn fold_outcomes(outcomes: &[ProbeOutcome]) -> Vec<ProxyRecord> {
    let mut folded: Vec<ProxyRecord> = Vec::new();

    for outcome in outcomes {
        let Some(fresh) = outcome.to_record() else {
            continue;
        };
        match folded.iter_mut().find(|r| r.endpoint == fresh.endpoint) {
            Some(existing) => {
                let faster = match (fresh.last_latency_secs, existing.last_latency_secs) {
                    (Some(new), Some(old)) => new < old,
                    _ => false,
                };
                if faster {
                    // endpoints match, update can not fail
                    let _ = existing.update(&fresh);
                } else {
                    existing.protocols.extend(fresh.protocols);
                }
            }
            None => folded.push(fresh),
        }
    }

    folded
}
