//! Shipping metrics: age of the last shipped entry per WAL group, plus
//! shipped/failed counters, exposed in Prometheus text exposition format.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Mutex;

use crate::entry::now_ms;
use crate::error::FailureClass;

/// Metrics sink the shipper reports into.
pub trait ShipMetrics: Send + Sync + 'static {
    /// A batch whose last entry was written at `write_time_ms` was fully shipped.
    fn set_age_of_last_shipped(&self, write_time_ms: u64, group: &str);

    /// A round failed; recompute the age from the last shipped write time so
    /// the gauge keeps growing while shipping is stuck.
    fn refresh_age_of_last_shipped(&self, group: &str);

    /// Entries were acknowledged by the peer.
    fn record_shipped(&self, _group: &str, _entries: usize, _size_bytes: u64) {}

    /// A retry round failed with the given class.
    fn record_failed_round(&self, _group: &str, _class: FailureClass) {}
}

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic count.
    Counter,
    /// Point-in-time value.
    Gauge,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Label set of one sample, in output order.
pub type Labels = Vec<(&'static str, String)>;

/// All samples of one metric name, rendered under a single HELP/TYPE header.
#[derive(Debug, Clone)]
pub struct MetricFamily {
    /// Metric name, e.g. `walship_shipped_entries_total`.
    pub name: &'static str,
    /// HELP text.
    pub help: &'static str,
    /// Metric type.
    pub kind: MetricKind,
    /// One value per label set.
    pub samples: Vec<(Labels, u64)>,
}

impl MetricFamily {
    fn new(name: &'static str, help: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            help,
            kind,
            samples: Vec::new(),
        }
    }

    /// Append this family in text exposition format. Families without
    /// samples render nothing.
    pub fn render(&self, out: &mut String) {
        if self.samples.is_empty() {
            return;
        }
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.kind.as_str());
        for (labels, value) in &self.samples {
            out.push_str(self.name);
            if !labels.is_empty() {
                out.push('{');
                for (i, (key, val)) in labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}=\"{}\"", key, escape_label(val));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", value);
        }
    }
}

/// Escape a label value; group names come from callers.
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Per-group snapshot held by [`SourceMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMetrics {
    /// Write time of the last entry shipped (ms since epoch), 0 if none.
    pub last_shipped_write_time_ms: u64,
    /// Age of the last shipped entry at the last update, in milliseconds.
    pub age_of_last_shipped_ms: u64,
    /// Entries acknowledged by the peer.
    pub shipped_entries: u64,
    /// Bytes acknowledged by the peer.
    pub shipped_bytes: u64,
    /// Failed retry rounds by class.
    pub failed_rounds: HashMap<FailureClass, u64>,
}

/// In-process [`ShipMetrics`] implementation.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    groups: Mutex<BTreeMap<String, GroupMetrics>>,
}

impl SourceMetrics {
    /// Create an empty metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one group's metrics.
    pub fn group(&self, group: &str) -> Option<GroupMetrics> {
        self.lock().get(group).cloned()
    }

    /// Age gauge for one group, in milliseconds.
    pub fn age_of_last_shipped_ms(&self, group: &str) -> Option<u64> {
        self.lock().get(group).map(|g| g.age_of_last_shipped_ms)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, GroupMetrics>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_age_at(&self, write_time_ms: u64, group: &str, now_ms: u64) {
        let mut groups = self.lock();
        let g = groups.entry(group.to_string()).or_default();
        g.last_shipped_write_time_ms = write_time_ms;
        g.age_of_last_shipped_ms = now_ms.saturating_sub(write_time_ms);
    }

    fn refresh_age_at(&self, group: &str, now_ms: u64) {
        let mut groups = self.lock();
        if let Some(g) = groups.get_mut(group) {
            if g.last_shipped_write_time_ms > 0 {
                g.age_of_last_shipped_ms = now_ms.saturating_sub(g.last_shipped_write_time_ms);
            }
        }
    }

    /// Snapshot every metric family, samples ordered by group.
    pub fn families(&self) -> Vec<MetricFamily> {
        let mut age = MetricFamily::new(
            "walship_age_of_last_shipped_ms",
            "Age of the last shipped WAL entry in milliseconds",
            MetricKind::Gauge,
        );
        let mut entries = MetricFamily::new(
            "walship_shipped_entries_total",
            "Entries acknowledged by the peer cluster",
            MetricKind::Counter,
        );
        let mut bytes = MetricFamily::new(
            "walship_shipped_bytes_total",
            "Bytes acknowledged by the peer cluster",
            MetricKind::Counter,
        );
        let mut failed = MetricFamily::new(
            "walship_failed_rounds_total",
            "Shipping rounds that failed, by failure class",
            MetricKind::Counter,
        );

        for (group, g) in self.lock().iter() {
            let labels = vec![("group", group.clone())];
            age.samples.push((labels.clone(), g.age_of_last_shipped_ms));
            entries.samples.push((labels.clone(), g.shipped_entries));
            bytes.samples.push((labels, g.shipped_bytes));

            let mut classes: Vec<_> = g.failed_rounds.iter().collect();
            classes.sort_by_key(|(class, _)| class.as_str());
            for (class, count) in classes {
                failed.samples.push((
                    vec![("group", group.clone()), ("class", class.as_str().to_string())],
                    *count,
                ));
            }
        }
        vec![age, entries, bytes, failed]
    }

    /// Format all metrics as Prometheus text exposition format.
    pub fn format_prometheus(&self) -> String {
        let mut out = String::new();
        for family in self.families() {
            family.render(&mut out);
        }
        out
    }
}

impl ShipMetrics for SourceMetrics {
    fn set_age_of_last_shipped(&self, write_time_ms: u64, group: &str) {
        self.set_age_at(write_time_ms, group, now_ms());
    }

    fn refresh_age_of_last_shipped(&self, group: &str) {
        self.refresh_age_at(group, now_ms());
    }

    fn record_shipped(&self, group: &str, entries: usize, size_bytes: u64) {
        let mut groups = self.lock();
        let g = groups.entry(group.to_string()).or_default();
        g.shipped_entries += entries as u64;
        g.shipped_bytes += size_bytes;
    }

    fn record_failed_round(&self, group: &str, class: FailureClass) {
        let mut groups = self.lock();
        let g = groups.entry(group.to_string()).or_default();
        *g.failed_rounds.entry(class).or_insert(0) += 1;
    }
}
