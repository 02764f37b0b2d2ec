//! Metrics sink used by every reconciliation component.
//!
//! Components only see the [`MetricsSink`] trait. [`MetricsRegistry`] is the
//! in-process implementation: counters, gauges and summaries keyed by metric
//! name plus sorted labels, readable back for tests and text exposition.

use std::fmt::Write as _;
use std::time::Instant;

use dashmap::DashMap;

pub const FEED_MATCHING_TIME: &str = "feedmessage_matching_time_seconds";
pub const FEED_ENTITY_ERRORS: &str = "feedentity_matching_errors_total";

pub const STOP_TIME_UPDATE_SUCCESSES: &str = "tripupdates_stoptimeupdate_matching_successes_total";
pub const STOP_TIME_UPDATE_FAILURES: &str = "tripupdates_stoptimeupdate_matching_failures_total";

pub const ALERTS_SKIPPED: &str = "alerts_matching_skipped_total";

pub const REPLACEMENT_CANCELED: &str = "tripreplperiods_nr_of_canceled_trip_updates_total";
pub const REPLACEMENT_QUERY_TIME: &str = "tripreplacementperiods_query_time_seconds";

pub const PREVIOUS_STORE_TIME: &str = "previous_stoptimeupdates_store_query_time_seconds";
pub const PREVIOUS_RESTORE_TIME: &str = "previous_stoptimeupdates_restore_query_time_seconds";
pub const PREVIOUS_CLEAN_TIME: &str = "previous_stoptimeupdates_clean_query_time_seconds";
pub const PREVIOUS_CLEANED: &str = "previous_stoptimeupdates_cleaned_total";

pub type Labels<'a> = [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn inc_counter(&self, name: &str, labels: &Labels<'_>);
    fn set_gauge(&self, name: &str, labels: &Labels<'_>, value: f64);
    fn observe_seconds(&self, name: &str, labels: &Labels<'_>, seconds: f64);
}

/// Seconds elapsed since `t0`, as reported to summaries.
pub fn elapsed_seconds(t0: Instant) -> f64 {
    t0.elapsed().as_secs_f64()
}

fn series_key(name: &str, labels: &Labels<'_>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut key = String::with_capacity(name.len() + 16 * sorted.len());
    key.push_str(name);
    key.push('{');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        let _ = write!(key, "{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""));
    }
    key.push('}');
    key
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SummaryValue {
    pub count: u64,
    pub sum: f64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    summaries: DashMap<String, SummaryValue>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &Labels<'_>) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| metric_name(e.key()) == name)
            .map(|e| *e.value())
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: &Labels<'_>) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }

    pub fn summary(&self, name: &str, labels: &Labels<'_>) -> Option<SummaryValue> {
        self.summaries.get(&series_key(name, labels)).map(|v| *v)
    }

    /// Number of observations of a summary across every label set.
    pub fn summary_count_total(&self, name: &str) -> u64 {
        self.summaries
            .iter()
            .filter(|e| metric_name(e.key()) == name)
            .map(|e| e.value().count)
            .sum()
    }

    /// Text exposition of every series, one per line, sorted by key.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for e in self.counters.iter() {
            lines.push(format!("{} {}", e.key(), e.value()));
        }
        for e in self.gauges.iter() {
            lines.push(format!("{} {}", e.key(), e.value()));
        }
        for e in self.summaries.iter() {
            let (name, labels) = split_key(e.key());
            lines.push(format!("{name}_count{labels} {}", e.value().count));
            lines.push(format!("{name}_sum{labels} {}", e.value().sum));
        }
        lines.sort();

        let mut out = String::new();
        for line in lines {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

fn metric_name(key: &str) -> &str {
    split_key(key).0
}

fn split_key(key: &str) -> (&str, &str) {
    match key.find('{') {
        Some(idx) => key.split_at(idx),
        None => (key, ""),
    }
}

impl MetricsSink for MetricsRegistry {
    fn inc_counter(&self, name: &str, labels: &Labels<'_>) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &str, labels: &Labels<'_>, value: f64) {
        self.gauges.insert(series_key(name, labels), value);
    }

    fn observe_seconds(&self, name: &str, labels: &Labels<'_>, seconds: f64) {
        let mut entry = self
            .summaries
            .entry(series_key(name, labels))
            .or_default();
        entry.count += 1;
        entry.sum += seconds;
    }
}
