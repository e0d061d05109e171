use crate::collectors::inventory::GuestKind;
use crate::engine::Engine;
use crate::metrics::Metrics;
use crate::session::HostCredential;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub engine: Engine,
    pub hosts: Arc<HashMap<String, HostCredential>>,
}

pub fn build_router(
    metrics: Arc<Metrics>,
    engine: Engine,
    hosts: Arc<HashMap<String, HostCredential>>,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/hosts/:name/status", get(status_handler))
        .route("/api/hosts/:name/vms", get(vms_handler))
        .route("/api/hosts/:name/containers", get(containers_handler))
        .route("/api/hosts/:name/templates", get(templates_handler))
        .with_state(HttpAppState {
            metrics,
            engine,
            hosts,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn lookup(state: &HttpAppState, name: &str) -> Result<HostCredential, Response> {
    state.hosts.get(name).cloned().ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, format!("хост '{name}' не найден"))
    })
}

async fn status_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
) -> Response {
    let credential = match lookup(&state, &name) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let snapshot = state.engine.status(credential).await;
    state.metrics.update_from_snapshot(&name, &snapshot);
    state.metrics.inc_operation("status", snapshot.online);
    Json(snapshot).into_response()
}

async fn inventory_response(state: HttpAppState, name: String, kind: GuestKind) -> Response {
    let credential = match lookup(&state, &name) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let operation = match kind {
        GuestKind::Vm => "vms",
        GuestKind::Container => "containers",
    };
    match state.engine.inventory(credential, kind).await {
        Ok(items) => {
            state.metrics.inc_operation(operation, true);
            Json(items).into_response()
        }
        Err(err) => {
            warn!(host = %name, error = %err, "не удалось получить инвентарь");
            state.metrics.inc_operation(operation, false);
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
    }
}

async fn vms_handler(State(state): State<HttpAppState>, Path(name): Path<String>) -> Response {
    inventory_response(state, name, GuestKind::Vm).await
}

async fn containers_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
) -> Response {
    inventory_response(state, name, GuestKind::Container).await
}

async fn templates_handler(
    State(state): State<HttpAppState>,
    Path(name): Path<String>,
) -> Response {
    let credential = match lookup(&state, &name) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let templates = state.engine.templates(credential).await;
    state.metrics.inc_operation("templates", true);
    Json(templates).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::{credential, FakeConnector, FakeShell};
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(connector: FakeConnector) -> (Router, Arc<Metrics>) {
        let metrics = Metrics::new().expect("инициализация метрик");
        let engine = Engine::new(
            Arc::new(connector),
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        let hosts = Arc::new(HashMap::from([("pve1".to_string(), credential())]));
        (build_router(metrics.clone(), engine, hosts), metrics)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _) = app(FakeConnector::new(FakeShell::new()));
        let (status, body) = get_text(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn status_is_collected_and_exported() {
        let shell = FakeShell::new()
            .on("free -m", "Mem: 1000 400 600 0 0 0\nSwap: 0 0 0")
            .on("thermal_zone", "45000");
        let (app, _) = app(FakeConnector::new(shell));

        let (status, body) = get_text(app.clone(), "/api/hosts/pve1/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["online"], true);
        assert_eq!(json["mem_usage"], 40.0);
        assert_eq!(json["cpu_temp"], 45.0);
        assert!(json["disk_temp"].is_null());

        let (_, metrics) = get_text(app, "/metrics").await;
        assert!(metrics.contains("pve_host_up{host=\"pve1\"} 1"));
        assert!(metrics.contains("pve_memory_usage_percent{host=\"pve1\"} 40"));
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let connector = FakeConnector::new(FakeShell::new());
        let (app, _) = app(connector.clone());
        let (status, body) = get_text(app, "/api/hosts/nope/vms").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("nope"));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn inventory_failure_is_bad_gateway() {
        let (app, metrics) = app(FakeConnector::unreachable("refused"));
        let (status, body) = get_text(app, "/api/hosts/pve1/containers").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.contains("refused"));
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("pve_operations_total{operation=\"containers\",outcome=\"error\"} 1"));
    }

    #[tokio::test]
    async fn vms_are_listed() {
        let shell = FakeShell::new().on("qm list", "VMID NAME STATUS\n101 - running");
        let (app, _) = app(FakeConnector::new(shell));
        let (status, body) = get_text(app, "/api/hosts/pve1/vms").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json[0]["display_name"], "VM-101");
        assert_eq!(json[0]["kind"], "vm");
    }
}
