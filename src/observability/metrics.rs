//! A small Prometheus-flavored metrics registry: counters, gauges, and
//! histograms, each addressable by name plus a label set.
//!
//! Adapted from `enterprise::tracing::metrics`; concurrency-safety comes from
//! `DashMap` sharding rather than a single global lock, so increments from
//! different rooms never contend.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::Mutex;

/// A label set, sorted so two equivalent label maps always hash/compare
/// equal regardless of insertion order.
pub type Labels = BTreeMap<String, String>;

fn label_key(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// A monotonically increasing counter, sharded by label set.
#[derive(Default)]
pub struct Counter {
    values: DashMap<String, u64>,
}

impl Counter {
    /// Increment the series identified by `labels` by `amount`.
    pub fn inc_by(&self, labels: &Labels, amount: u64) {
        *self.values.entry(label_key(labels)).or_insert(0) += amount;
    }

    /// Increment the series identified by `labels` by one.
    pub fn inc(&self, labels: &Labels) {
        self.inc_by(labels, 1);
    }

    /// Current value for a label set, `0` if never incremented.
    pub fn get(&self, labels: &Labels) -> u64 {
        self.values.get(&label_key(labels)).map(|v| *v).unwrap_or(0)
    }
}

/// A point-in-time value that can go up or down, sharded by label set.
#[derive(Default)]
pub struct Gauge {
    values: DashMap<String, f64>,
}

impl Gauge {
    /// Set the series identified by `labels` to `value`.
    pub fn set(&self, labels: &Labels, value: f64) {
        self.values.insert(label_key(labels), value);
    }

    /// Add `delta` (negative to subtract) to the series.
    pub fn add(&self, labels: &Labels, delta: f64) {
        *self.values.entry(label_key(labels)).or_insert(0.0) += delta;
    }

    /// Current value for a label set, `0.0` if never set.
    pub fn get(&self, labels: &Labels) -> f64 {
        self.values.get(&label_key(labels)).map(|v| *v).unwrap_or(0.0)
    }
}

/// Observations bucketed for a histogram series.
#[derive(Default, Clone)]
pub struct HistogramSnapshot {
    /// All raw observations recorded so far (bounded by the registry owner's
    /// retention policy; kept simple here since this is an in-process
    /// registry, not a durable time series store).
    pub observations: Vec<f64>,
}

impl HistogramSnapshot {
    /// Total number of observations.
    pub fn count(&self) -> usize {
        self.observations.len()
    }

    /// Sum of all observations.
    pub fn sum(&self) -> f64 {
        self.observations.iter().sum()
    }

    /// Arithmetic mean, `0.0` if there are no observations.
    pub fn mean(&self) -> f64 {
        if self.observations.is_empty() {
            0.0
        } else {
            self.sum() / self.observations.len() as f64
        }
    }
}

/// A distribution of observed values, sharded by label set.
#[derive(Default)]
pub struct Histogram {
    values: DashMap<String, Mutex<Vec<f64>>>,
}

impl Histogram {
    /// Record one observation for the series identified by `labels`.
    pub fn observe(&self, labels: &Labels, value: f64) {
        self.values
            .entry(label_key(labels))
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(value);
    }

    /// A snapshot of the current observations for a label set.
    pub fn snapshot(&self, labels: &Labels) -> HistogramSnapshot {
        self.values
            .get(&label_key(labels))
            .map(|v| HistogramSnapshot {
                observations: v.lock().clone(),
            })
            .unwrap_or_default()
    }
}

/// The process-wide metric registry: one counter/gauge/histogram map keyed
/// by series name.
#[derive(Default)]
pub struct MetricRegistry {
    counters: DashMap<&'static str, Counter>,
    gauges: DashMap<&'static str, Gauge>,
    histograms: DashMap<&'static str, Histogram>,
}

impl MetricRegistry {
    /// Construct an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register every series this kernel emits, so a scrape sees them
    /// at zero before any traffic arrives.
    pub fn with_default_series() -> Self {
        let registry = Self::new();
        for name in [
            super::series::FAIL_CLOSED_TOTAL,
            super::series::SYNC_INVALID_MESSAGES_TOTAL,
            super::series::SYNC_HANDSHAKE_FAILURES_TOTAL,
            super::series::VERIFICATION_OUTCOME_TOTAL,
            super::series::CONFLICT_RETRY_TOTAL,
        ] {
            registry.counters.insert(name, Counter::default());
        }
        for name in [
            super::series::UPDATE_APPLY_LATENCY_MS,
            super::series::MAPPING_DURATION_MS,
        ] {
            registry.histograms.insert(name, Histogram::default());
        }
        registry
    }

    /// Increment a counter series by one.
    pub fn incr_counter(&self, name: &'static str, labels: &Labels) {
        self.counters.entry(name).or_default().inc(labels);
    }

    /// Current value of a counter series.
    pub fn counter_value(&self, name: &'static str, labels: &Labels) -> u64 {
        self.counters.get(name).map(|c| c.get(labels)).unwrap_or(0)
    }

    /// Set a gauge series to a value.
    pub fn set_gauge(&self, name: &'static str, labels: &Labels, value: f64) {
        self.gauges.entry(name).or_default().set(labels, value);
    }

    /// Current value of a gauge series.
    pub fn gauge_value(&self, name: &'static str, labels: &Labels) -> f64 {
        self.gauges.get(name).map(|g| g.get(labels)).unwrap_or(0.0)
    }

    /// Record an observation on a histogram series.
    pub fn observe_histogram(&self, name: &'static str, labels: &Labels, value: f64) {
        self.histograms.entry(name).or_default().observe(labels, value);
    }

    /// Snapshot a histogram series.
    pub fn histogram_snapshot(&self, name: &'static str, labels: &Labels) -> HistogramSnapshot {
        self.histograms
            .get(name)
            .map(|h| h.snapshot(labels))
            .unwrap_or_default()
    }

    /// Render every series in a Prometheus text-exposition-format snapshot,
    /// for a `/metrics` scrape endpoint. Not a full exporter (no `# HELP`/
    /// `# TYPE` comments, no quantiles) — just enough for a human or a
    /// scraper to see current values.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for entry in self.counters.iter() {
            let name = *entry.key();
            for pair in entry.value().values.iter() {
                render_line(&mut out, name, pair.key(), *pair.value() as f64);
            }
        }
        for entry in self.gauges.iter() {
            let name = *entry.key();
            for pair in entry.value().values.iter() {
                render_line(&mut out, name, pair.key(), *pair.value());
            }
        }
        for entry in self.histograms.iter() {
            let name = *entry.key();
            for pair in entry.value().values.iter() {
                let snapshot = HistogramSnapshot {
                    observations: pair.value().lock().clone(),
                };
                render_line(&mut out, &format!("{name}_count"), pair.key(), snapshot.count() as f64);
                render_line(&mut out, &format!("{name}_sum"), pair.key(), snapshot.sum());
            }
        }
        out
    }
}

fn render_line(out: &mut String, name: &str, label_key: &str, value: f64) {
    use std::fmt::Write as _;
    if label_key.is_empty() {
        let _ = writeln!(out, "{name} {value}");
    } else {
        let _ = writeln!(out, "{name}{{{label_key}}} {value}");
    }
}

/// Build a one-entry label map; a small ergonomics helper since most of this
/// crate's metric calls carry exactly one label.
pub fn label(key: &str, value: impl Into<String>) -> Labels {
    let mut labels = Labels::new();
    labels.insert(key.to_string(), value.into());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_per_label_set_independently() {
        let registry = MetricRegistry::new();
        registry.incr_counter("requests", &label("route", "/a"));
        registry.incr_counter("requests", &label("route", "/a"));
        registry.incr_counter("requests", &label("route", "/b"));

        assert_eq!(registry.counter_value("requests", &label("route", "/a")), 2);
        assert_eq!(registry.counter_value("requests", &label("route", "/b")), 1);
    }

    #[test]
    fn default_series_are_registered_at_zero() {
        let registry = MetricRegistry::with_default_series();
        assert_eq!(
            registry.counter_value(super::super::series::FAIL_CLOSED_TOTAL, &Labels::new()),
            0
        );
    }

    #[test]
    fn histogram_tracks_observations() {
        let registry = MetricRegistry::new();
        registry.observe_histogram("latency", &Labels::new(), 10.0);
        registry.observe_histogram("latency", &Labels::new(), 30.0);
        let snapshot = registry.histogram_snapshot("latency", &Labels::new());
        assert_eq!(snapshot.count(), 2);
        assert_eq!(snapshot.mean(), 20.0);
    }

    #[test]
    fn gauge_set_then_add_accumulates() {
        let registry = MetricRegistry::new();
        registry.set_gauge("rooms", &Labels::new(), 3.0);
        registry.gauges.entry("rooms").or_default().add(&Labels::new(), 1.0);
        assert_eq!(registry.gauge_value("rooms", &Labels::new()), 4.0);
    }
}
