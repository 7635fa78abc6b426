//! The concrete metric registry and its Prometheus exposition.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;

use crate::sink::MetricsSink;

/// Histogram bucket upper bounds shared by every latency histogram.
pub const DEFAULT_BUCKETS: [f64; 6] = [0.2, 0.5, 1.0, 2.0, 4.0, 10.0];

static GLOBAL: OnceCell<Arc<Registry>> = OnceCell::new();

/// Returns the process-wide registry, constructing it on first use.
///
/// The first constructed instance wins; later calls return the same handle,
/// so re-initialisation across connector restarts is harmless.
#[must_use]
pub fn global() -> Arc<Registry> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(Registry::new())))
}

/// Identity of one metric series: name plus sorted label pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn label_block(&self) -> String {
        if self.labels.is_empty() {
            return String::new();
        }
        let body: Vec<String> = self
            .labels
            .iter()
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect();
        format!("{{{}}}", body.join(","))
    }

    fn label_block_with(&self, extra_key: &str, extra_value: &str) -> String {
        let mut body: Vec<String> = self
            .labels
            .iter()
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect();
        body.push(format!("{extra_key}=\"{extra_value}\""));
        format!("{{{}}}", body.join(","))
    }
}

#[derive(Debug, Clone)]
struct Histogram {
    counts: Vec<u64>,
    sum: f64,
    total: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: vec![0; DEFAULT_BUCKETS.len()],
            sum: 0.0,
            total: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (index, bound) in DEFAULT_BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.counts[index] += 1;
            }
        }
        self.sum += value;
        self.total += 1;
    }
}

/// Concrete metric registry.
///
/// All families are guarded by mutexes; a poisoned lock is recovered rather
/// than propagated so rendering keeps working after a panicking writer.
#[derive(Debug, Default)]
pub struct Registry {
    counters: Mutex<BTreeMap<MetricKey, u64>>,
    gauges: Mutex<BTreeMap<MetricKey, f64>>,
    histograms: Mutex<BTreeMap<MetricKey, Histogram>>,
}

impl Registry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of a counter series, zero when absent.
    #[must_use]
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters
            .get(&MetricKey::new(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the observation count of a histogram series, zero when absent.
    #[must_use]
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let histograms = self
            .histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        histograms
            .get(&MetricKey::new(name, labels))
            .map(|histogram| histogram.total)
            .unwrap_or(0)
    }
}

impl MetricsSink for Registry {
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *counters.entry(MetricKey::new(name, labels)).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        gauges.insert(MetricKey::new(name, labels), value);
    }

    fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut histograms = self
            .histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        histograms
            .entry(MetricKey::new(name, labels))
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    fn render(&self) -> String {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let gauges = self
            .gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let histograms = self
            .histograms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut output = String::new();

        let mut last_name = None::<String>;
        for (key, value) in &counters {
            if last_name.as_deref() != Some(key.name.as_str()) {
                let _ = writeln!(output, "# TYPE {} counter", key.name);
                last_name = Some(key.name.clone());
            }
            let _ = writeln!(output, "{}{} {value}", key.name, key.label_block());
        }

        last_name = None;
        for (key, value) in &gauges {
            if last_name.as_deref() != Some(key.name.as_str()) {
                let _ = writeln!(output, "# TYPE {} gauge", key.name);
                last_name = Some(key.name.clone());
            }
            let _ = writeln!(output, "{}{} {value}", key.name, key.label_block());
        }

        last_name = None;
        for (key, histogram) in &histograms {
            if last_name.as_deref() != Some(key.name.as_str()) {
                let _ = writeln!(output, "# TYPE {} histogram", key.name);
                last_name = Some(key.name.clone());
            }
            for (index, bound) in DEFAULT_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    output,
                    "{}_bucket{} {}",
                    key.name,
                    key.label_block_with("le", &bound.to_string()),
                    histogram.counts[index]
                );
            }
            let _ = writeln!(
                output,
                "{}_bucket{} {}",
                key.name,
                key.label_block_with("le", "+Inf"),
                histogram.total
            );
            let _ = writeln!(output, "{}_sum{} {}", key.name, key.label_block(), histogram.sum);
            let _ = writeln!(
                output,
                "{}_count{} {}",
                key.name,
                key.label_block(),
                histogram.total
            );
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let registry = Registry::new();
        registry.inc_counter("handle_api_success_count", &[("api", "t")]);
        registry.inc_counter("handle_api_success_count", &[("api", "t")]);
        registry.inc_counter("handle_api_success_count", &[("api", "other")]);

        assert_eq!(
            registry.counter_value("handle_api_success_count", &[("api", "t")]),
            2
        );
        assert_eq!(
            registry.counter_value("handle_api_success_count", &[("api", "other")]),
            1
        );
    }

    #[test]
    fn histogram_buckets_are_cumulative_in_render() {
        let registry = Registry::new();
        registry.observe("handle_api_success_time", &[("api", "t")], 0.1);
        registry.observe("handle_api_success_time", &[("api", "t")], 1.5);
        registry.observe("handle_api_success_time", &[("api", "t")], 50.0);

        let rendered = registry.render();
        assert!(rendered.contains("# TYPE handle_api_success_time histogram"));
        assert!(rendered.contains(r#"handle_api_success_time_bucket{api="t",le="0.2"} 1"#));
        assert!(rendered.contains(r#"handle_api_success_time_bucket{api="t",le="2"} 2"#));
        assert!(rendered.contains(r#"handle_api_success_time_bucket{api="t",le="+Inf"} 3"#));
        assert!(rendered.contains(r#"handle_api_success_time_count{api="t"} 3"#));
    }

    #[test]
    fn render_orders_series_deterministically() {
        let registry = Registry::new();
        registry.inc_counter("b_count", &[]);
        registry.inc_counter("a_count", &[]);

        let rendered = registry.render();
        let a_position = rendered.find("a_count").expect("a present");
        let b_position = rendered.find("b_count").expect("b present");
        assert!(a_position < b_position);
    }

    #[test]
    fn global_registry_is_first_wins() {
        let first = global();
        first.inc_counter("global_probe_count", &[]);
        let second = global();
        assert_eq!(second.counter_value("global_probe_count", &[]), 1);
    }

    #[test]
    fn gauges_overwrite_previous_values() {
        let registry = Registry::new();
        registry.set_gauge("queue_depth", &[], 3.0);
        registry.set_gauge("queue_depth", &[], 1.0);

        let rendered = registry.render();
        assert!(rendered.contains("queue_depth 1"));
        assert!(!rendered.contains("queue_depth 3"));
    }
}
