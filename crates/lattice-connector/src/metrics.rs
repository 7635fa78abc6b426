//! Metric names and recording helpers for the connector.

use std::time::Duration;

use lattice_metrics::{LatencyUnit, MetricsSink};

/// Counter for successful inbound dispatches.
pub(crate) const HANDLE_SUCCESS_COUNT: &str = "handle_api_success_count";
/// Counter for failed inbound dispatches.
pub(crate) const HANDLE_FAILURE_COUNT: &str = "handle_api_failure_count";
/// Latency histogram for successful inbound dispatches.
pub(crate) const HANDLE_SUCCESS_TIME: &str = "handle_api_success_time";
/// Latency histogram for failed inbound dispatches.
pub(crate) const HANDLE_FAILURE_TIME: &str = "handle_api_failure_time";

/// Counter for successful outbound calls.
pub(crate) const CALL_SUCCESS_COUNT: &str = "call_api_success_count";
/// Counter for failed outbound calls.
pub(crate) const CALL_FAILURE_COUNT: &str = "call_api_failure_count";
/// Latency histogram for successful outbound calls.
pub(crate) const CALL_SUCCESS_TIME: &str = "call_api_success_time";
/// Latency histogram for failed outbound calls.
pub(crate) const CALL_FAILURE_TIME: &str = "call_api_failure_time";

/// Records one inbound dispatch with label `{api: <route>}`.
pub(crate) fn record_handle(
    sink: &dyn MetricsSink,
    route: &str,
    is_error: bool,
    elapsed: Duration,
    unit: LatencyUnit,
) {
    let labels = [("api", route)];
    let (count, time) = if is_error {
        (HANDLE_FAILURE_COUNT, HANDLE_FAILURE_TIME)
    } else {
        (HANDLE_SUCCESS_COUNT, HANDLE_SUCCESS_TIME)
    };
    sink.inc_counter(count, &labels);
    sink.observe(time, &labels, unit.scale(elapsed));
}

/// Records one outbound call with label `{api: "<service>.<method>"}`.
pub(crate) fn record_call(
    sink: &dyn MetricsSink,
    service: &str,
    method: &str,
    is_error: bool,
    elapsed: Duration,
    unit: LatencyUnit,
) {
    let api = format!("{service}.{method}");
    let labels = [("api", api.as_str())];
    let (count, time) = if is_error {
        (CALL_FAILURE_COUNT, CALL_FAILURE_TIME)
    } else {
        (CALL_SUCCESS_COUNT, CALL_SUCCESS_TIME)
    };
    sink.inc_counter(count, &labels);
    sink.observe(time, &labels, unit.scale(elapsed));
}
