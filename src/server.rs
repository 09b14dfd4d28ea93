use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::snapshot::{self, SnapshotSlot};

pub fn router(slot: Arc<SnapshotSlot>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(slot)
}

/// Renders whatever snapshot is current. Never blocks on the refresh task;
/// before the first cycle this is a 200 with an empty body.
async fn metrics(State(slot): State<Arc<SnapshotSlot>>) -> impl IntoResponse {
    let body = snapshot::render(&slot.current());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

/// Liveness: healthy as soon as the port is bound, even before the first
/// collection cycle completes.
async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{MetricSample, MetricsSnapshot, PV_USED_BYTES};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn scrape_before_first_cycle_is_empty_200() {
        let slot = Arc::new(SnapshotSlot::new());
        let (status, body) = get_body(router(slot), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn scrape_serves_published_snapshot() {
        let slot = Arc::new(SnapshotSlot::new());
        slot.publish(MetricsSnapshot {
            samples: vec![MetricSample {
                name: PV_USED_BYTES,
                value: 2048.0,
                labels: vec![("pvc".to_string(), "claim-a".to_string())],
            }],
            collected_at: Some(Utc::now()),
            degraded: false,
            node: "node-1".to_string(),
        });

        let (status, body) = get_body(router(slot), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("local_storage_pv_used_bytes{pvc=\"claim-a\"} 2048\n"));
    }

    #[tokio::test]
    async fn healthz_is_ok_immediately() {
        let slot = Arc::new(SnapshotSlot::new());
        let (status, body) = get_body(router(slot), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ok"}"#);
    }
}
