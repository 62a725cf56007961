//! Progress reporting for a running check

use crate::proxy::models::{ProbeOutcome, Protocol};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Default interval between periodic status lines
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// Point-in-time view of a pool's progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub completed: usize,
    pub total: usize,
    /// Working proxies found so far, by protocol
    pub working: BTreeMap<Protocol, usize>,
    /// Distinct endpoints with at least one working protocol
    pub working_endpoints: usize,
}

impl StatusSnapshot {
    pub fn new(completed: usize, total: usize, successes: &[ProbeOutcome]) -> Self {
        let mut working = BTreeMap::new();
        let mut endpoints = BTreeSet::new();
        for outcome in successes.iter().filter(|o| o.is_success()) {
            *working.entry(outcome.protocol()).or_insert(0) += 1;
            endpoints.insert(outcome.endpoint());
        }
        Self {
            completed,
            total,
            working,
            working_endpoints: endpoints.len(),
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    /// Working counts as `SOCKS5:3 HTTP:1`, or `none` when nothing works yet.
    pub fn working_summary(&self) -> String {
        let parts: Vec<String> = self
            .working
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(protocol, count)| {
                format!("{}:{}", protocol.as_str().to_ascii_uppercase(), count)
            })
            .collect();
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(" ")
        }
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Jobs done: [{}/{}] = {:.1}% | Working: {}",
            self.completed,
            self.total,
            self.percent(),
            self.working_summary()
        )
    }
}

/// Renders snapshots pulled from a running pool.
///
/// Read-only: the reporter never touches pool state, it only formats what
/// the snapshot source returns.
pub struct StatusReporter<S> {
    source: S,
    interval: Duration,
}

impl<S> StatusReporter<S>
where
    S: Fn() -> StatusSnapshot,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Render the current status line.
    pub fn render(&self) -> String {
        (self.source)().to_string()
    }

    /// Log the current status.
    pub fn report(&self) -> StatusSnapshot {
        let snapshot = (self.source)();
        info!(
            completed = snapshot.completed,
            total = snapshot.total,
            "{}",
            snapshot
        );
        snapshot
    }

    /// Log the status every interval until `done` resolves.
    pub async fn run_until<F>(&self, done: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(done);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = &mut done => break,
                _ = ticker.tick() => {
                    self.report();
                }
            }
        }
    }
}
