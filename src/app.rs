use crate::admission::{Admission, AdmissionGate};
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::errors::{bad_request_response, internal_error_response, PurchaseError};
use crate::ledger::Ledger;
use crate::metrics::{Metrics, Outcome};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    gate: AdmissionGate,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(gate: AdmissionGate, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            gate,
            clock,
            metrics,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuyCornRequest {
    #[serde(default)]
    client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseHistoryResponse {
    client_id: String,
    purchase_count: u64,
}

/// API router with default configuration and an explicit time source.
pub fn build_app_with_clock(ledger: Ledger, clock: Arc<dyn Clock>) -> Router {
    let config = ServerConfig::default();
    let state = build_state(&config, ledger, clock, Arc::new(Metrics::new()));
    build_api_router(state, &config)
}

/// Returns (api_router, management_router) sharing the same Metrics instance.
/// Used in production: API on the configured bind, management on its own port.
pub fn build_app_pair(config: &ServerConfig, ledger: Ledger) -> (Router, Router) {
    let metrics = Arc::new(Metrics::new());
    let state = build_state(config, ledger, Arc::new(SystemClock), Arc::clone(&metrics));
    let api = build_api_router(state, config);
    let mgmt = build_management_app(metrics);
    (api, mgmt)
}

/// Builds the management router serving health and prometheus endpoints.
pub fn build_management_app(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/actuator/health", get(management_health))
        .route("/actuator/prometheus", get(prometheus))
        .with_state(metrics)
}

pub fn build_state(
    config: &ServerConfig,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
) -> AppState {
    let gate = AdmissionGate::new(ledger)
        .with_window(config.window)
        .with_retry_after_policy(config.retry_after);
    AppState::new(gate, clock, metrics)
}

pub fn build_api_router(state: AppState, config: &ServerConfig) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/buy-corn", post(buy_corn))
        .route("/api/purchases", get(missing_client_id))
        .route("/api/purchases/", get(missing_client_id))
        .route("/api/purchases/{client_id}", get(purchase_history))
        .with_state(state);
    if config.cors_permissive {
        router = router.layer(CorsLayer::permissive());
    }
    if config.request_logging {
        router = router.layer(TraceLayer::new_for_http());
    }
    router
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "OK", "message": "Server is running" }))
}

async fn management_health() -> Json<Value> {
    Json(json!({ "status": "UP" }))
}

async fn prometheus(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encode failed");
            internal_error_response()
        }
    }
}

async fn buy_corn(
    State(state): State<AppState>,
    payload: Result<Json<BuyCornRequest>, JsonRejection>,
) -> Response {
    let client_id = match payload {
        Ok(Json(request)) => request.client_id.unwrap_or_default(),
        Err(rejection) => {
            warn!(reason = %rejection.body_text(), "unreadable buy-corn body");
            String::new()
        }
    };
    let now = state.clock.now_millis();
    let gate = state.gate.clone();
    let decision = {
        let client_id = client_id.clone();
        run_blocking(move || gate.try_purchase(&client_id, now)).await
    };

    match decision.and_then(Admission::into_result) {
        Ok((record_id, _)) => {
            state.metrics.purchase(Outcome::Admitted);
            info!(client_id = %client_id, record_id, "corn purchase admitted");
            Json(json!({
                "success": true,
                "message": "Corn purchase successful",
                "emoji": "🌽"
            }))
            .into_response()
        }
        Err(err) => {
            record_failure(&state, "buy_corn", &client_id, &err);
            err.into_response()
        }
    }
}

async fn purchase_history(
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let gate = state.gate.clone();
    let lookup = {
        let client_id = client_id.clone();
        run_blocking(move || gate.purchase_history(&client_id)).await
    };

    match lookup {
        Ok(purchase_count) => {
            state.metrics.history_query();
            Json(PurchaseHistoryResponse {
                client_id,
                purchase_count,
            })
            .into_response()
        }
        Err(err) => {
            record_failure(&state, "purchase_history", &client_id, &err);
            err.into_response()
        }
    }
}

async fn missing_client_id() -> Response {
    bad_request_response()
}

fn record_failure(state: &AppState, operation: &str, client_id: &str, err: &PurchaseError) {
    match err {
        PurchaseError::StorageFailure(reason) => {
            state.metrics.storage_failure(operation);
            if operation == "buy_corn" {
                state.metrics.purchase(Outcome::Error);
            }
            error!(operation, client_id, error = %reason, "ledger operation failed");
        }
        PurchaseError::InvalidRequest => {
            if operation == "buy_corn" {
                state.metrics.purchase(Outcome::Invalid);
            }
        }
        PurchaseError::RateLimited {
            retry_after_seconds,
        } => {
            state.metrics.purchase(Outcome::Denied);
            info!(client_id, retry_after_seconds, "corn purchase rate limited");
        }
    }
}

/// Runs ledger work off the async executor.
async fn run_blocking<T, F>(f: F) -> Result<T, PurchaseError>
where
    F: FnOnce() -> Result<T, PurchaseError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PurchaseError::storage(format!("ledger task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn buy(client_id: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/buy-corn")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "clientId": client_id }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn storage_failure_maps_to_internal_error() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.break_schema_for_test();
        let metrics = Arc::new(Metrics::new());
        let config = ServerConfig::default();
        let state = build_state(
            &config,
            ledger,
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Arc::clone(&metrics),
        );
        let app = build_api_router(state, &config);

        let res = app.clone().oneshot(buy("alice")).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(res).await,
            json!({ "error": "Internal Server Error" })
        );
        assert_eq!(metrics.purchase_count(Outcome::Error), 1);

        let history = Request::builder()
            .uri("/api/purchases/alice")
            .body(Body::empty())
            .unwrap();
        let res = app.oneshot(history).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        let metrics = Arc::new(Metrics::new());
        let config = ServerConfig::default();
        let state = build_state(
            &config,
            Ledger::open_in_memory().unwrap(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Arc::clone(&metrics),
        );
        let app = build_api_router(state, &config);

        for client_id in ["alice", "alice", ""] {
            app.clone().oneshot(buy(client_id)).await.unwrap();
        }

        assert_eq!(metrics.purchase_count(Outcome::Admitted), 1);
        assert_eq!(metrics.purchase_count(Outcome::Denied), 1);
        assert_eq!(metrics.purchase_count(Outcome::Invalid), 1);
    }

    #[tokio::test]
    async fn cors_layer_follows_config() {
        let config = ServerConfig::default();
        let state = build_state(
            &config,
            Ledger::open_in_memory().unwrap(),
            Arc::new(SystemClock),
            Arc::new(Metrics::new()),
        );
        let app = build_api_router(state.clone(), &config);
        let request = || {
            Request::builder()
                .uri("/api/health")
                .header("origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap()
        };

        let res = app.oneshot(request()).await.unwrap();
        assert_eq!(
            res.headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );

        let strict = ServerConfig {
            cors_permissive: false,
            ..ServerConfig::default()
        };
        let res = build_api_router(state, &strict)
            .oneshot(request())
            .await
            .unwrap();
        assert!(res.headers().get("access-control-allow-origin").is_none());
    }
}
