use tracing::trace;

// Trace-based metric helpers; a subscriber can aggregate these without an exporter.

pub fn probe_latency(candidate: &str, latency_ms: u128, reachable: bool) {
    trace!(
        target = "shoppable.metrics",
        candidate = candidate,
        latency_ms = latency_ms as u64,
        reachable = reachable,
        "probe_latency"
    );
}

pub fn request_retry(operation: &'static str, attempt: u32) {
    trace!(
        target = "shoppable.metrics",
        operation = operation,
        attempt = attempt,
        "request_retry"
    );
}

pub fn poll_tick(job_id: &str, poll: u32, progress: Option<f32>) {
    trace!(
        target = "shoppable.metrics",
        job_id = job_id,
        poll = poll,
        progress = progress.unwrap_or_default() as f64,
        "poll_tick"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "shoppable.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
