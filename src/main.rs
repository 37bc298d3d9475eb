mod catalog;
mod gateway;
mod http;
mod idempotency;
mod jobs;
mod ledger;
mod metrics;
mod models;
mod pipeline;
mod processor;
mod replicate;
mod security;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use catalog::{ProductCatalog, ShopifyClient};
use gateway::{GatewayError, ProcessingGateway};
use jobs::JobQueue;
use ledger::CostLedger;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, ApprovalRecord, PendingPage, ProductUpdateEvent, WebhookAck, WebhookStatus,
};
use pipeline::IngestPipeline;
use processor::ImageSetProcessor;
use replicate::{ReplicateClient, ReplicateConfig};
use security::{AuthState, ReviewerContext, require_review_auth};
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{ApprovalStore, StoreError};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "argus.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let store = ApprovalStore::new(env_path("APPROVALS_DB_PATH", "data/approvals.db"));
    store.init().await?;
    let cost_ledger = CostLedger::new(env_path("COST_LEDGER_DB_PATH", "data/costs.db"));
    cost_ledger.init().await?;

    let model = Arc::new(ReplicateClient::new(ReplicateConfig::from_env()));
    let gateway = Arc::new(ProcessingGateway::from_env(model, cost_ledger));
    let processor = Arc::new(ImageSetProcessor::new(gateway.clone()));
    let shopify: Arc<dyn ProductCatalog> = Arc::new(ShopifyClient::from_env());
    if shopify.enabled() && !shopify.verify_connection().await {
        warn!(
            target = "argus.catalog",
            "catalog connection check failed at startup, ingestion will retry per event"
        );
    }
    let pipeline = IngestPipeline::new(shopify.clone(), processor, store.clone());
    let (queue, _worker) = JobQueue::spawn(pipeline);

    let auth_state = AuthState::from_env();
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok());

    let state = AppState {
        store,
        gateway,
        catalog: shopify,
        queue,
        openapi: Arc::new(openapi),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/approvals", get(list_approvals))
        .route("/approvals/{id}", get(get_approval))
        .route("/approvals/{id}/approve", post(approve_approval))
        .route("/approvals/{id}/reject", post(reject_approval))
        .route("/ingest/all", post(trigger_sweep))
        .route("/jobs/{id}", get(get_job_status))
        .route("/costs/today", get(costs_today))
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            require_review_auth,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/webhook/product_updated", post(product_updated_webhook))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "argus.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: ApprovalStore,
    gateway: Arc<ProcessingGateway>,
    catalog: Arc<dyn ProductCatalog>,
    queue: JobQueue,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "argus-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized("docs"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Argus Review API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Product-update notification from the storefront.
///
/// - Method: `POST`
/// - Path: `/webhook/product_updated`
/// - Auth: none (delivery dedup via `X-Webhook-Id` when redis is wired)
/// - Response: `WebhookAck`, always HTTP 200 so the sender stops retrying
async fn product_updated_webhook(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(event): Json<ProductUpdateEvent>,
) -> Json<WebhookAck> {
    crate::metrics::inc_requests("/webhook/product_updated");
    let product_id = event.id.into_string();

    if !state.catalog.enabled() {
        return Json(WebhookAck {
            status: WebhookStatus::ShopifyDisabled,
            product_id: Some(product_id),
        });
    }

    let delivery_key = headers
        .get("X-Webhook-Id")
        .and_then(|v| v.to_str().ok())
        .map(|s| format!("webhook:{}", s.trim()))
        .filter(|s| s.len() > "webhook:".len());
    if let (Some(key), Some(client)) = (&delivery_key, &state.redis)
        && let Some(existing) = idempotency::redis_get(client, key).await
    {
        info!(
            target = "argus.api",
            product_id, "webhook_delivery_replayed"
        );
        return Json(existing);
    }

    // Update payloads often omit tags; the catalog copy is authoritative
    // for routing.
    let tags = if event.tags.is_empty() {
        state
            .catalog
            .get_product_tags(&product_id)
            .await
            .unwrap_or_default()
    } else {
        event.tags
    };

    let ack = match state.queue.enqueue_ingest(product_id.clone(), tags).await {
        Ok(job_id) => {
            info!(
                target = "argus.api",
                product_id,
                job_id = %job_id,
                "ingestion_enqueued"
            );
            WebhookAck {
                status: WebhookStatus::ProcessingStarted,
                product_id: Some(product_id),
            }
        }
        Err(err) => {
            warn!(
                target = "argus.api",
                product_id,
                error = %err.error,
                "ingestion_enqueue_failed"
            );
            WebhookAck {
                status: WebhookStatus::Error,
                product_id: Some(product_id),
            }
        }
    };

    if let (Some(key), Some(client)) = (&delivery_key, &state.redis) {
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);
        idempotency::redis_set(client, key, &ack, ttl).await;
    }

    Json(ack)
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    per_page: Option<usize>,
}

/// Pending review queue, most recent first.
///
/// - Method: `GET`
/// - Path: `/approvals?page=&per_page=`
/// - Auth: `Authorization: Bearer <key>` or `X-Argus-Key: <key>`
///
/// An empty queue is a 200 with an empty page; a store failure is a 500,
/// so "nothing to review" and "store unreachable" stay distinguishable.
async fn list_approvals(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<PendingPage>, AppError> {
    crate::metrics::inc_requests("/approvals");
    let pending = state.store.list_pending().await?;
    Ok(Json(PendingPage::slice(
        pending,
        params.page.unwrap_or(1),
        params.per_page.unwrap_or(20),
    )))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ApprovalRecord>, AppError> {
    crate::metrics::inc_requests("/approvals/{id}");
    Ok(Json(state.store.get(id).await?))
}

async fn approve_approval(
    State(state): State<AppState>,
    Extension(reviewer): Extension<ReviewerContext>,
    Path(id): Path<i64>,
) -> Result<Json<ApprovalRecord>, AppError> {
    crate::metrics::inc_requests("/approvals/{id}/approve");
    let record = state.store.approve(id).await?;
    crate::metrics::review_decision("approved");
    info!(
        target = "argus.api",
        record_id = id,
        product_ref = %record.product_ref,
        reviewer = %reviewer.reviewer_id,
        "approval_granted"
    );

    if parse_env_bool("PUBLISH_ON_APPROVE") && state.catalog.enabled() {
        let catalog = state.catalog.clone();
        let product_ref = record.product_ref.clone();
        let images = record.processed_images.clone();
        // Best-effort: the approval stands even if the storefront push
        // fails; the record keeps the image set for a manual retry.
        tokio::spawn(async move {
            if let Err(err) = catalog.update_product_images(&product_ref, &images).await {
                warn!(
                    target = "argus.api",
                    product_ref,
                    error = %err,
                    "approved_images_publish_failed"
                );
            }
        });
    }

    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn reject_approval(
    State(state): State<AppState>,
    Extension(reviewer): Extension<ReviewerContext>,
    Path(id): Path<i64>,
    Json(body): Json<RejectRequest>,
) -> Result<Json<ApprovalRecord>, AppError> {
    crate::metrics::inc_requests("/approvals/{id}/reject");
    let record = state.store.reject(id, body.reason).await?;
    crate::metrics::review_decision("rejected");
    info!(
        target = "argus.api",
        record_id = id,
        product_ref = %record.product_ref,
        reviewer = %reviewer.reviewer_id,
        reason = record.reject_reason.as_deref().unwrap_or_default(),
        "approval_rejected"
    );
    Ok(Json(record))
}

#[derive(Debug, serde::Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Kicks off a full catalog sweep as a background job.
async fn trigger_sweep(
    State(state): State<AppState>,
    Extension(reviewer): Extension<ReviewerContext>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/ingest/all");
    if !state.catalog.enabled() {
        return Err(AppError::CatalogDisabled);
    }
    let id = state
        .queue
        .enqueue_sweep()
        .await
        .map_err(|err| AppError::QueueUnavailable(err.error))?;
    info!(
        target = "argus.api",
        job_id = %id,
        reviewer = %reviewer.reviewer_id,
        "catalog_sweep_enqueued"
    );
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::InvalidJobId);
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::JobNotFound),
    }
}

async fn costs_today(
    State(state): State<AppState>,
) -> Result<Json<gateway::CostReport>, AppError> {
    crate::metrics::inc_requests("/costs/today");
    Ok(Json(state.gateway.daily_report().await?))
}

#[derive(Debug)]
enum AppError {
    Store(StoreError),
    Gateway(GatewayError),
    CatalogDisabled,
    QueueUnavailable(String),
    InvalidJobId,
    JobNotFound,
    Unauthorized(&'static str),
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Store(StoreError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "not_found".to_string(),
                Some(format!("approval {id} does not exist")),
            ),
            AppError::Store(err @ StoreError::InvalidTransition { .. }) => (
                StatusCode::CONFLICT,
                "invalid_transition".to_string(),
                Some(err.to_string()),
            ),
            AppError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_unreachable".to_string(),
                Some(err.to_string()),
            ),
            AppError::Gateway(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "cost_ledger_unreachable".to_string(),
                Some(err.to_string()),
            ),
            AppError::CatalogDisabled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "shopify_disabled".to_string(),
                Some("catalog credentials are not configured".to_string()),
            ),
            AppError::QueueUnavailable(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "queue_unavailable".to_string(),
                Some(detail),
            ),
            AppError::InvalidJobId => (
                StatusCode::BAD_REQUEST,
                "invalid_job_id".to_string(),
                None,
            ),
            AppError::JobNotFound => (StatusCode::NOT_FOUND, "job_not_found".to_string(), None),
            AppError::Unauthorized(scope) => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".to_string(),
                Some(scope.to_string()),
            ),
        };
        let payload = ApiError { error, detail };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn env_path(key: &str, default: &str) -> std::path::PathBuf {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .into()
}

fn parse_env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
