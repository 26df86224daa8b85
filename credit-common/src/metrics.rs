//! Prometheus exposition for `credit-worker`: the `/metrics` HTTP surface
//! plus the counters the worker pool emits for every job it dispatches
//! (spec §6, §4.4). Job-outcome counters are defined here rather than being
//! scattered `metrics::counter!` calls at each call site, so the full set of
//! series this binary exports lives in one place.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_router`, potentially with more routes added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router for a metrics endpoint.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request counts and latency for the `/_liveness`,
/// `/_readiness`, and `/metrics` routes this binary exposes.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("credit_http_requests_total", &labels).increment(1);
    metrics::histogram!("credit_http_request_duration_seconds", &labels).record(latency);

    response
}

/// A job was claimed off the queue and handed to its handler (spec §4.4 step 3).
pub fn record_job_dispatched(job_type: &str) {
    metrics::counter!("credit_jobs_dispatched_total", &[("job_type", job_type.to_owned())]).increment(1);
}

/// A job's handler returned successfully and the job was settled `Complete`.
pub fn record_job_completed(job_type: &str) {
    metrics::counter!("credit_jobs_completed_total", &[("job_type", job_type.to_owned())]).increment(1);
}

/// A job's handler errored, panicked, or timed out, and the job was settled
/// `Fail` (spec §4.4 steps 4-6, §7).
pub fn record_job_failed(job_type: &str) {
    metrics::counter!("credit_jobs_failed_total", &[("job_type", job_type.to_owned())]).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_metric_recorders_do_not_panic_without_an_installed_recorder() {
        // No PrometheusBuilder is installed in a unit test process; these
        // calls must still be infallible no-ops rather than panicking.
        record_job_dispatched("risk_evaluation");
        record_job_completed("risk_evaluation");
        record_job_failed("banking_info_fetch");
    }
}
