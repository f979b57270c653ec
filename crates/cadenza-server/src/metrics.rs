use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

pub fn render(st: &AppState) -> String {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let jobs = &st.sequencer.counters;
    let downloads = &st.coordinator.counters;

    let rows: [(&str, &str, u64); 15] = [
        ("cadenza_requests_total", "counter", load(&st.metrics.requests_total)),
        ("cadenza_requests_inflight", "gauge", load(&st.metrics.requests_inflight)),
        ("cadenza_responses_2xx", "counter", load(&st.metrics.status_2xx)),
        ("cadenza_responses_4xx", "counter", load(&st.metrics.status_4xx)),
        ("cadenza_responses_5xx", "counter", load(&st.metrics.status_5xx)),
        ("cadenza_jobs_admitted_total", "counter", load(&jobs.admitted)),
        ("cadenza_jobs_rejected_total", "counter", load(&jobs.rejected)),
        ("cadenza_jobs_completed_total", "counter", load(&jobs.completed)),
        ("cadenza_jobs_failed_total", "counter", load(&jobs.failed)),
        ("cadenza_model_downloads_started_total", "counter", load(&downloads.started)),
        ("cadenza_model_downloads_succeeded_total", "counter", load(&downloads.succeeded)),
        ("cadenza_model_downloads_failed_total", "counter", load(&downloads.failed)),
        ("cadenza_model_fetches_total", "counter", load(&downloads.fetches)),
        ("cadenza_queue_depth", "gauge", st.sequencer.depth()),
        ("cadenza_model_state", "gauge", u64::from(st.coordinator.state().as_gauge())),
    ];

    let mut body = String::new();
    for (name, kind, value) in rows {
        let _ = writeln!(body, "# TYPE {name} {kind}\n{name} {value}");
    }
    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&st),
    )
}

/// Holds one unit of the in-flight gauge; released even when the client
/// hangs up and the request future is dropped mid-handler.
struct InflightGuard<'a>(&'a AtomicU64);

impl<'a> InflightGuard<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let inflight = InflightGuard::enter(&st.metrics.requests_inflight);
    let resp = next.run(req).await;
    drop(inflight);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inflight_released_when_request_dropped() {
        let gauge = AtomicU64::new(0);
        let slow = async {
            let _inflight = InflightGuard::enter(&gauge);
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        };
        let res = tokio::time::timeout(std::time::Duration::from_millis(20), slow).await;
        assert!(res.is_err());
        assert_eq!(gauge.load(Ordering::Relaxed), 0);
    }
}
