//! The metrics capability trait and its no-op implementation.

use std::time::Duration;

use strum::{Display, EnumString};

/// Capability interface for recording telemetry.
///
/// Components take an `Arc<dyn MetricsSink>` so tests can substitute
/// [`NoopMetrics`] without touching the process-wide registry.
pub trait MetricsSink: Send + Sync {
    /// Increments a monotonic counter by one.
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Sets a gauge to the given value.
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Records one observation into a histogram.
    fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Renders every registered metric in the Prometheus text format.
    fn render(&self) -> String;
}

/// Sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}

    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}

    fn observe(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}

    fn render(&self) -> String {
        String::new()
    }
}

/// Unit used when observing elapsed time into latency histograms.
///
/// The bucket boundaries are fixed; this knob decides whether an elapsed
/// duration is observed as milliseconds (the historical behaviour) or as
/// seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LatencyUnit {
    /// Observe elapsed time in milliseconds.
    #[default]
    Millis,
    /// Observe elapsed time in seconds.
    Seconds,
}

impl LatencyUnit {
    /// Converts an elapsed duration into an observation in this unit.
    #[must_use]
    pub fn scale(&self, elapsed: Duration) -> f64 {
        match self {
            Self::Millis => elapsed.as_secs_f64() * 1000.0,
            Self::Seconds => elapsed.as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_renders_empty() {
        let sink = NoopMetrics;
        sink.inc_counter("anything", &[("api", "t")]);
        assert_eq!(sink.render(), "");
    }

    #[test]
    fn latency_unit_scales_elapsed_time() {
        let elapsed = Duration::from_millis(1500);
        assert!((LatencyUnit::Millis.scale(elapsed) - 1500.0).abs() < f64::EPSILON);
        assert!((LatencyUnit::Seconds.scale(elapsed) - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_unit_parses_case_insensitively() {
        assert_eq!("SECONDS".parse::<LatencyUnit>().unwrap(), LatencyUnit::Seconds);
        assert_eq!("millis".parse::<LatencyUnit>().unwrap(), LatencyUnit::Millis);
    }
}
