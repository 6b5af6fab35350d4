use tracing::trace;

// Trace-based counters; the Prometheus recorder picks up nothing from here but
// the events keep per-route and per-row volume visible in logs.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "catalog.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn row_processed(disposition: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        disposition = disposition,
        elapsed_ms = elapsed_ms as u64,
        "import_row_processed"
    );
}

pub fn run_finished(outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "import_run_finished"
    );
}
