use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::warn;

use crate::metrics::{MetricsSnapshot, ProcessingMetrics};
use crate::sinks::Sink;
use crate::source::Source;

/// Result of probing both ends of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthReport {
    Healthy(MetricsSnapshot),
    /// The named dependency did not answer its probe.
    Unhealthy { component: &'static str, reason: String },
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthReport::Healthy(_))
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        match self {
            HealthReport::Healthy(metrics) => (
                StatusCode::OK,
                format!(
                    "OK\nProcessed: {}\nErrors: {}",
                    metrics.processed, metrics.errors
                ),
            ),
            HealthReport::Unhealthy { component, reason } => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{component} connection error: {reason}"),
            ),
        }
        .into_response()
    }
}

/// Probes the sink, then the source, on every request. The counters come
/// from the same [`ProcessingMetrics`] the pipeline writes to.
#[derive(Clone)]
pub struct HealthReporter {
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    metrics: Arc<ProcessingMetrics>,
    probe_timeout: Duration,
}

impl HealthReporter {
    pub fn new(
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        metrics: Arc<ProcessingMetrics>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            source,
            sink,
            metrics,
            probe_timeout,
        }
    }

    pub async fn check(&self) -> HealthReport {
        let sink = self.sink.name();
        match tokio::time::timeout(self.probe_timeout, self.sink.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return unhealthy(sink, e.to_string()),
            Err(_) => return unhealthy(sink, format!("no answer within {:?}", self.probe_timeout)),
        }

        let source = self.source.name();
        match tokio::time::timeout(self.probe_timeout, self.source.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return unhealthy(source, e.to_string()),
            Err(_) => {
                return unhealthy(source, format!("no answer within {:?}", self.probe_timeout))
            }
        }

        HealthReport::Healthy(self.metrics.snapshot())
    }
}

fn unhealthy(component: &'static str, reason: String) -> HealthReport {
    warn!(component, "health probe failed: {}", reason);
    HealthReport::Unhealthy { component, reason }
}

async fn health(State(reporter): State<HealthReporter>) -> HealthReport {
    reporter.check().await
}

/// `/health` probes the dependencies, `/_liveness` only proves the process
/// is serving requests.
pub fn router(reporter: HealthReporter) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/_liveness", get(|| async { "ok" }))
        .with_state(reporter)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::test_utils::{MemorySink, MemorySource};

    struct Fixture {
        source: Arc<MemorySource>,
        sink: Arc<MemorySink>,
        metrics: Arc<ProcessingMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: Arc::new(MemorySource::default()),
                sink: Arc::new(MemorySink::default()),
                metrics: Arc::new(ProcessingMetrics::new()),
            }
        }

        fn reporter(&self) -> HealthReporter {
            HealthReporter::new(
                self.source.clone(),
                self.sink.clone(),
                self.metrics.clone(),
                Duration::from_secs(5),
            )
        }
    }

    async fn get_health(router: Router) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthy_reports_counters() {
        let fixture = Fixture::new();
        for _ in 0..1234 {
            fixture.metrics.record_processed();
        }
        fixture.metrics.record_errors(5);

        let (status, body) = get_health(router(fixture.reporter())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK\nProcessed: 1234\nErrors: 5");
    }

    #[tokio::test]
    async fn fresh_process_reports_zeroes() {
        let fixture = Fixture::new();

        let (status, body) = get_health(router(fixture.reporter())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK\nProcessed: 0\nErrors: 0");
    }

    #[tokio::test]
    async fn unreachable_store_names_the_store() {
        let fixture = Fixture::new();
        fixture.sink.set_unreachable(true);
        fixture.source.set_unreachable(true);

        let (status, body) = get_health(router(fixture.reporter())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.starts_with("memory connection error: "), "{body}");
        assert!(body.contains("store is down"), "{body}");
    }

    #[tokio::test]
    async fn unreachable_broker_names_the_broker() {
        let fixture = Fixture::new();
        fixture.source.set_unreachable(true);

        let report = fixture.reporter().check().await;
        assert!(!report.is_healthy());
        match report {
            HealthReport::Unhealthy { component, reason } => {
                assert_eq!(component, "memory");
                assert!(reason.contains("broker is down"), "{reason}");
            }
            HealthReport::Healthy(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn liveness_does_not_probe() {
        let fixture = Fixture::new();
        fixture.sink.set_unreachable(true);

        let response = router(fixture.reporter())
            .oneshot(Request::get("/_liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
