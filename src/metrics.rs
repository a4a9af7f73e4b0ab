use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "podforge.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn job_elapsed(job_id: &str, elapsed_ms: u128) {
    trace!(
        target = "podforge.metrics",
        job_id = job_id,
        elapsed_ms = elapsed_ms as u64,
        "job_elapsed"
    );
}

pub fn published_listings(count: usize) {
    trace!(
        target = "podforge.metrics",
        count = count,
        "listings_published"
    );
}
