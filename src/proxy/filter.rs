//! Turning proxy records into check tasks
//!
//! [`build_tasks`] drops the records that do not match the [`FilterCriteria`]
//! and expands the rest into one [`CheckTask`] per protocol worth probing.

use crate::error::{Error, Result};
use crate::proxy::models::{CheckTask, Protocol, ProxyRecord};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Parse a duration such as `10s`, `20d`, `3mo` or `1y`.
///
/// Months are 30 days and years are 365 days.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::InvalidDuration(input.to_string()))?;
    let (quantity, suffix) = s.split_at(split);

    let multiplier = match suffix {
        "s" => 1,
        "m" => MINUTE,
        "h" => HOUR,
        "d" => DAY,
        "w" => 7 * DAY,
        "mo" => 30 * DAY,
        "y" => 365 * DAY,
        _ => return Err(Error::InvalidDuration(input.to_string())),
    };
    let quantity: u64 = quantity
        .parse()
        .map_err(|_| Error::InvalidDuration(input.to_string()))?;

    quantity
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::InvalidDuration(input.to_string()))
}

/// Which records to check and for which protocols
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterCriteria {
    /// Only ever probe these protocols. `None` means every protocol.
    pub protocols: Option<BTreeSet<Protocol>>,
    /// Skip records checked more recently than this.
    pub max_staleness: Option<Duration>,
    /// `N > 0` keeps records with latency <= N seconds, `N < 0` keeps records
    /// with latency >= |N| seconds. Zero disables the filter.
    pub latency_bound: Option<i64>,
    /// Keep records whose exit country is one of these (upper-case).
    pub exit_countries: Vec<String>,
    /// Exclude records that lack the data a criterion needs.
    pub strict: bool,
}

impl FilterCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict probing to the named protocols.
    pub fn with_protocol_names<S: AsRef<str>>(mut self, names: &[S]) -> Result<Self> {
        let protocols = names
            .iter()
            .map(|name| name.as_ref().parse::<Protocol>())
            .collect::<Result<BTreeSet<_>>>()?;
        if protocols.is_empty() {
            return Err(Error::NoProtocolsRequested);
        }
        self.protocols = Some(protocols);
        Ok(self)
    }

    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        self.protocols = Some(protocols.into_iter().collect());
        self
    }

    /// Skip records checked within `older` (e.g. `3mo`).
    pub fn with_staleness(mut self, older: &str) -> Result<Self> {
        self.max_staleness = Some(parse_duration(older)?);
        Ok(self)
    }

    pub fn with_latency_bound(mut self, bound: i64) -> Self {
        self.latency_bound = Some(bound);
        self
    }

    /// Keep only records exiting through one of `countries` (e.g. `US`).
    pub fn with_exit_countries<S: AsRef<str>>(mut self, countries: &[S]) -> Result<Self> {
        for country in countries {
            let country = country.as_ref().trim();
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(Error::InvalidCountry(country.to_string()));
            }
            self.exit_countries.push(country.to_ascii_uppercase());
        }
        Ok(self)
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn validate(&self) -> Result<()> {
        match &self.protocols {
            Some(protocols) if protocols.is_empty() => Err(Error::NoProtocolsRequested),
            _ => Ok(()),
        }
    }

    /// Whether the record passes the country, latency and staleness criteria.
    fn accepts(&self, record: &ProxyRecord, now: DateTime<Utc>) -> bool {
        if !self.exit_countries.is_empty() {
            match &record.exit_country {
                None if self.strict => return false,
                None => {}
                Some(country) => {
                    if !self
                        .exit_countries
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(country))
                    {
                        return false;
                    }
                }
            }
        }

        if let Some(bound) = self.latency_bound.filter(|b| *b != 0) {
            match record.last_latency_secs {
                None if self.strict => return false,
                None => {}
                Some(latency) => {
                    let limit = bound.unsigned_abs() as f64;
                    let keep = if bound > 0 {
                        latency <= limit
                    } else {
                        latency >= limit
                    };
                    if !keep {
                        return false;
                    }
                }
            }
        }

        if let Some(stale) = self.max_staleness {
            match record.check_age(now) {
                None if self.strict => return false,
                None => {}
                Some(age) => {
                    if age < stale.as_secs() as i64 {
                        debug!(endpoint = %record, age_secs = age, "skipping recently checked proxy");
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Protocols worth probing for this record.
    fn protocols_for(&self, record: &ProxyRecord) -> BTreeSet<Protocol> {
        let known = if !record.protocols.is_empty() {
            record.protocols.clone()
        } else if !self.strict {
            Protocol::defaults()
        } else {
            BTreeSet::new()
        };

        match &self.protocols {
            Some(requested) => known.intersection(requested).copied().collect(),
            None => known,
        }
    }
}

/// Build the task list for `records`.
///
/// With `shuffle` every new task lands at a random position of the list
/// built so far, otherwise tasks follow record order then protocol order.
pub fn build_tasks(
    records: &[ProxyRecord],
    criteria: &FilterCriteria,
    shuffle: bool,
) -> Result<Vec<CheckTask>> {
    build_tasks_at(records, criteria, shuffle, Utc::now(), &mut rand::thread_rng())
}

/// [`build_tasks`] with an explicit clock and random source.
pub fn build_tasks_at<R: Rng>(
    records: &[ProxyRecord],
    criteria: &FilterCriteria,
    shuffle: bool,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<Vec<CheckTask>> {
    criteria.validate()?;

    let mut tasks: Vec<CheckTask> = Vec::new();
    for record in records {
        if !criteria.accepts(record, now) {
            continue;
        }
        for protocol in criteria.protocols_for(record) {
            let task = CheckTask::new(record.endpoint(), protocol);
            if shuffle {
                let pos = rng.gen_range(0..=tasks.len());
                tasks.insert(pos, task);
            } else {
                tasks.push(task);
            }
        }
    }

    debug!(
        records = records.len(),
        tasks = tasks.len(),
        "built check task list"
    );
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn build(records: &[ProxyRecord], criteria: &FilterCriteria) -> Vec<CheckTask> {
        build_tasks_at(records, criteria, false, now(), &mut StdRng::seed_from_u64(7)).unwrap()
    }

    fn record(endpoint: &str) -> ProxyRecord {
        ProxyRecord::new(endpoint).unwrap()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap().as_secs(), 10);
        assert_eq!(parse_duration("5m").unwrap().as_secs(), 300);
        assert_eq!(parse_duration("2h").unwrap().as_secs(), 7200);
        assert_eq!(parse_duration("20d").unwrap().as_secs(), 20 * 86400);
        assert_eq!(parse_duration("1w").unwrap().as_secs(), 7 * 86400);
        assert_eq!(parse_duration("3mo").unwrap().as_secs(), 3 * 30 * 86400);
        assert_eq!(parse_duration("1y").unwrap().as_secs(), 365 * 86400);
    }

    #[test]
    fn test_parse_duration_invalid() {
        for bad in ["10x", "10", "s", "", "-5s", "1.5h", "3 mo", "99999999999999999999y"] {
            assert!(
                matches!(parse_duration(bad), Err(Error::InvalidDuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_record_expands_to_all_protocols() {
        let tasks = build(&[record("1.1.1.1:80")], &FilterCriteria::new());
        let protocols: Vec<_> = tasks.iter().map(|t| t.protocol).collect();
        assert_eq!(protocols, Protocol::ALL.to_vec());
        assert!(tasks.iter().all(|t| t.endpoint == "1.1.1.1:80"));
    }

    #[test]
    fn test_protocols_never_outside_known_or_requested() {
        let mut known = record("1.1.1.1:80");
        known.protocols = BTreeSet::from([Protocol::Http, Protocol::Socks4]);
        let unknown = record("2.2.2.2:80");

        let criteria = FilterCriteria::new().with_protocols([Protocol::Http, Protocol::Https]);
        let tasks = build(&[known.clone(), unknown], &criteria);

        assert_eq!(
            tasks,
            vec![
                CheckTask::new("1.1.1.1:80", Protocol::Http),
                CheckTask::new("2.2.2.2:80", Protocol::Https),
                CheckTask::new("2.2.2.2:80", Protocol::Http),
            ]
        );
        for task in tasks.iter().filter(|t| t.endpoint == known.endpoint()) {
            assert!(known.protocols.contains(&task.protocol));
        }
    }

    #[test]
    fn test_strict_without_known_protocols_gives_no_tasks() {
        let criteria = FilterCriteria::new().with_strict(true);
        assert!(build(&[record("1.1.1.1:80")], &criteria).is_empty());

        let known = ProxyRecord::with_protocol("1.1.1.1:80", Protocol::Socks5).unwrap();
        assert_eq!(build(&[known], &criteria).len(), 1);
    }

    #[test]
    fn test_exit_country_strict_and_lenient() {
        let no_country = record("1.1.1.1:80");
        let mut us = record("2.2.2.2:80");
        us.exit_country = Some("US".to_string());
        let mut de = record("3.3.3.3:80");
        de.exit_country = Some("DE".to_string());
        let records = [no_country, us, de];

        let strict = FilterCriteria::new()
            .with_exit_countries(&["us"])
            .unwrap()
            .with_strict(true);
        // strict needs known protocols too, so give everything one
        let with_protos: Vec<_> = records
            .iter()
            .cloned()
            .map(|mut r| {
                r.protocols.insert(Protocol::Http);
                r
            })
            .collect();
        let tasks = build(&with_protos, &strict);
        assert_eq!(tasks, vec![CheckTask::new("2.2.2.2:80", Protocol::Http)]);

        let lenient = FilterCriteria::new().with_exit_countries(&["US"]).unwrap();
        let endpoints: BTreeSet<_> = build(&records, &lenient)
            .into_iter()
            .map(|t| t.endpoint)
            .collect();
        assert_eq!(
            endpoints,
            BTreeSet::from(["1.1.1.1:80".to_string(), "2.2.2.2:80".to_string()])
        );
    }

    #[test]
    fn test_lenient_country_still_applies_other_criteria() {
        let mut slow = record("1.1.1.1:80");
        slow.last_latency_secs = Some(5.0);
        let criteria = FilterCriteria::new()
            .with_exit_countries(&["US"])
            .unwrap()
            .with_latency_bound(2);
        assert!(build(&[slow], &criteria).is_empty());
    }

    #[test]
    fn test_latency_sign_convention() {
        let mut r = record("1.1.1.1:80");
        r.last_latency_secs = Some(100.0);

        let at_least = FilterCriteria::new().with_latency_bound(-90);
        assert_eq!(build(&[r.clone()], &at_least).len(), 4);

        let at_most = FilterCriteria::new().with_latency_bound(90);
        assert!(build(&[r.clone()], &at_most).is_empty());

        let disabled = FilterCriteria::new().with_latency_bound(0);
        assert_eq!(build(&[r], &disabled).len(), 4);
    }

    #[test]
    fn test_latency_missing_data() {
        let unknown = record("1.1.1.1:80");
        let lenient = FilterCriteria::new().with_latency_bound(90);
        assert_eq!(build(&[unknown.clone()], &lenient).len(), 4);

        let strict = lenient.with_strict(true);
        let mut known_proto = unknown;
        known_proto.protocols.insert(Protocol::Http);
        assert!(build(&[known_proto], &strict).is_empty());
    }

    #[test]
    fn test_staleness() {
        let mut fresh = record("1.1.1.1:80");
        fresh.last_checked_at = Some(now() - chrono::Duration::seconds(30));
        let mut old = record("2.2.2.2:80");
        old.last_checked_at = Some(now() - chrono::Duration::days(2));
        let never = record("3.3.3.3:80");

        let criteria = FilterCriteria::new()
            .with_staleness("1d")
            .unwrap()
            .with_protocols([Protocol::Http]);
        let tasks = build(&[fresh.clone(), old.clone(), never.clone()], &criteria);
        assert_eq!(
            tasks,
            vec![
                CheckTask::new("2.2.2.2:80", Protocol::Http),
                CheckTask::new("3.3.3.3:80", Protocol::Http),
            ]
        );

        let strict = criteria.with_strict(true);
        let records: Vec<_> = [fresh, old, never]
            .into_iter()
            .map(|mut r| {
                r.protocols.insert(Protocol::Http);
                r
            })
            .collect();
        assert_eq!(
            build(&records, &strict),
            vec![CheckTask::new("2.2.2.2:80", Protocol::Http)]
        );
    }

    #[test]
    fn test_protocol_names_validation() {
        assert!(matches!(
            FilterCriteria::new().with_protocol_names(&["http", "gopher"]),
            Err(Error::UnknownProtocol(_))
        ));
        let empty: [&str; 0] = [];
        assert!(matches!(
            FilterCriteria::new().with_protocol_names(&empty),
            Err(Error::NoProtocolsRequested)
        ));

        let criteria = FilterCriteria::new().with_protocols(Vec::new());
        let result = build_tasks(&[record("1.1.1.1:80")], &criteria, false);
        assert!(matches!(result, Err(Error::NoProtocolsRequested)));
    }

    #[test]
    fn test_exit_country_validation() {
        assert!(matches!(
            FilterCriteria::new().with_exit_countries(&["USA"]),
            Err(Error::InvalidCountry(_))
        ));
        let criteria = FilterCriteria::new().with_exit_countries(&["gb"]).unwrap();
        assert_eq!(criteria.exit_countries, vec!["GB".to_string()]);
    }

    #[test]
    fn test_unshuffled_order_is_deterministic() {
        let records: Vec<_> = (1..=5).map(|i| record(&format!("10.0.0.{i}:8080"))).collect();
        let criteria = FilterCriteria::new();
        let first = build_tasks(&records, &criteria, false).unwrap();
        let second = build_tasks(&records, &criteria, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], CheckTask::new("10.0.0.1:8080", Protocol::Socks5));
        assert_eq!(first[19], CheckTask::new("10.0.0.5:8080", Protocol::Http));
    }

    #[test]
    fn test_shuffle_keeps_every_task() {
        let records: Vec<_> = (1..=10).map(|i| record(&format!("10.0.0.{i}:8080"))).collect();
        let criteria = FilterCriteria::new();
        let ordered = build(&records, &criteria);
        let shuffled = build_tasks_at(
            &records,
            &criteria,
            true,
            now(),
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();

        assert_eq!(shuffled.len(), ordered.len());
        assert_ne!(shuffled, ordered);
        let a: BTreeSet<_> = ordered.iter().map(|t| t.to_string()).collect();
        let b: BTreeSet<_> = shuffled.iter().map(|t| t.to_string()).collect();
        assert_eq!(a, b);
    }
}
