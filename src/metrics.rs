use tracing::trace;

// Trace-based counters; the prometheus recorder in main exposes the
// process-level view, these keep per-event detail greppable.

pub fn inc_requests(route: &'static str) {
    trace!(target = "argus.metrics", route = route, "requests_total_inc");
}

pub fn external_call(operation: &str, declared_cost_usd: f64) {
    trace!(
        target = "argus.metrics",
        operation,
        declared_cost_usd,
        "external_call_total_inc"
    );
}

pub fn review_decision(decision: &'static str) {
    trace!(
        target = "argus.metrics",
        decision,
        "review_decisions_total_inc"
    );
}
