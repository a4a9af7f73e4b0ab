mod config;
mod fetch;
mod fulfillment;
mod genai;
mod http;
mod jobs;
mod marketplace;
mod metrics;
mod models;
mod pipeline;
mod poller;
mod publish;
mod session;
mod snapshot;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fetch::{Fetcher, RateLimitTracker};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CatalogProduct, CreatedListing, GenerationBrief, PlacementSelection};
use pipeline::{GenerationPipeline, PipelineError, PipelineErrorKind, Workflow};
use publish::{CardView, PublishSummary, Publisher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session::SessionSnapshot;
use snapshot::SnapshotStore;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "podforge.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let fetcher = Fetcher::from_env();
    let limits = fetcher.limits();
    let store = SnapshotStore::from_env();
    let workflow = Workflow::new(store, GenerationPipeline::from_env(&fetcher));
    let (queue, _worker) = jobs::BatchQueue::spawn(workflow.clone());
    let publisher = Arc::new(Publisher::from_env(fetcher));
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        workflow,
        queue,
        publisher,
        limits,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/navigate", post(navigate))
        .route("/sessions/{id}/designs", post(set_designs))
        .route("/sessions/{id}/generate", post(enqueue_generation))
        .route("/sessions/{id}/price", post(price_batch))
        .route("/sessions/{id}/publish", post(publish_all))
        .route("/sessions/{id}/cards", get(list_cards))
        .route("/sessions/{id}/cards/publish", post(publish_one_card))
        .route("/jobs/{id}", get(get_batch_status))
        .route("/limits", get(rate_limits))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "podforge.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    workflow: Workflow,
    queue: jobs::BatchQueue,
    publisher: Arc<Publisher>,
    limits: Arc<RateLimitTracker>,
    prometheus_handle: PrometheusHandle,
}

/// Outbound services whose rate-limit headers the fetch layer tracks.
const TRACKED_SERVICES: [&str; 5] = ["content", "images", "pricing", "mockups", "marketplace"];

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "podforge-api-rs",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
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
                .unwrap_or_default();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    session_id: String,
}

/// Start a new listing session at the product-selection step.
///
/// - Method: `POST`
/// - Path: `/sessions`
async fn create_session(State(state): State<AppState>) -> Json<SessionCreated> {
    crate::metrics::inc_requests("/sessions");
    let session_id = state.workflow.create_session().await;
    info!(target = "podforge.api", session_id = %session_id, "session created");
    Json(SessionCreated { session_id })
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let session = state
        .workflow
        .get(&id)
        .await
        .ok_or_else(|| PipelineError::invalid_input("session", "unknown_session"))?;
    Ok(Json(session.to_snapshot()))
}

#[derive(Debug, Deserialize)]
struct NavigateRequest {
    step: u8,
}

#[derive(Debug, Serialize)]
struct NavigateResponse {
    current_step: u8,
    moved: bool,
}

/// Move a session to another wizard step. Forward moves are validated;
/// out-of-range targets are a no-op.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/navigate`
async fn navigate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<NavigateRequest>,
) -> Result<Json<NavigateResponse>, AppError> {
    crate::metrics::inc_requests("/sessions/navigate");
    let mut moved = false;
    let session = state
        .workflow
        .update(&id, |session| {
            moved = session
                .navigate_to_step(payload.step)
                .map_err(|err| PipelineError::invalid_input("navigate", err.to_string()))?
                .is_some();
            Ok(())
        })
        .await?;
    Ok(Json(NavigateResponse {
        current_step: session.current_step,
        moved,
    }))
}

#[derive(Debug, Deserialize)]
struct DesignsRequest {
    #[serde(default)]
    selected_products: Vec<String>,
    #[serde(default)]
    product_designs: BTreeMap<String, Vec<PlacementSelection>>,
    #[serde(default)]
    catalog_products: Vec<CatalogProduct>,
}

/// Replace the session's product selection, placement designs, and catalog
/// data in one call.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/designs`
async fn set_designs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<DesignsRequest>,
) -> Result<Json<SessionSnapshot>, AppError> {
    crate::metrics::inc_requests("/sessions/designs");
    let session = state
        .workflow
        .update(&id, |session| {
            session.selected_products = payload.selected_products.iter().cloned().collect();
            session.product_designs = payload.product_designs.clone();
            for product in &payload.catalog_products {
                session
                    .catalog_products
                    .insert(product.id.clone(), product.clone());
            }
            Ok(())
        })
        .await?;
    Ok(Json(session.to_snapshot()))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    batch_id: String,
}

/// Queue a generation batch for every selected placement.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/generate`
/// - Body: `GenerationBrief`
/// - Response: batch id to poll on `/jobs/{id}`
async fn enqueue_generation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(brief): Json<GenerationBrief>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/sessions/generate");
    if state.workflow.get(&id).await.is_none() {
        return Err(PipelineError::invalid_input("generate", "unknown_session").into());
    }
    let batch_id = state
        .queue
        .enqueue_generation(id, brief)
        .await
        .map_err(|err| PipelineError::internal("enqueue", err))?;
    Ok(Json(EnqueueResponse {
        batch_id: batch_id.to_string(),
    }))
}

async fn get_batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::BatchInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(PipelineError::invalid_input("jobs", "invalid_batch_id").into());
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(PipelineError::invalid_input("jobs", "not_found").into())
    }
}

/// Price every generated image and start mockup polling for cards whose
/// mockups are still rendering.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/price`
async fn price_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CardView>>, AppError> {
    crate::metrics::inc_requests("/sessions/price");
    let session = state
        .workflow
        .get(&id)
        .await
        .ok_or_else(|| PipelineError::invalid_input("pricing", "unknown_session"))?;
    let cards = state.publisher.price_batch(&id, &session).await?;
    Ok(Json(cards.into_iter().map(CardView::from).collect()))
}

/// The session's product cards, each with a base64 payload the client can
/// echo back to `/sessions/{id}/cards/publish`.
///
/// - Method: `GET`
/// - Path: `/sessions/{id}/cards`
async fn list_cards(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<CardView>> {
    Json(state.publisher.cards(&id).await)
}

#[derive(Debug, Serialize)]
struct ServiceLimits {
    remaining: Option<u64>,
    reset_epoch: Option<i64>,
    /// Seconds until the in-flight 429 retry fires, when one is waiting.
    retrying_in: Option<u64>,
    low_remaining: bool,
}

/// Per-service rate-limit telemetry for clients that surface throttling.
///
/// - Method: `GET`
/// - Path: `/limits`
async fn rate_limits(State(state): State<AppState>) -> Json<BTreeMap<&'static str, ServiceLimits>> {
    let mut report = BTreeMap::new();
    for service in TRACKED_SERVICES {
        let snapshot = state.limits.snapshot(service).unwrap_or_default();
        report.insert(
            service,
            ServiceLimits {
                remaining: snapshot.remaining,
                reset_epoch: snapshot.reset_epoch,
                retrying_in: state.limits.retrying_in(service),
                low_remaining: state.limits.low_remaining(service),
            },
        );
    }
    Json(report)
}

/// Publish every priced card to the fulfillment store and the marketplace.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/publish`
/// - Response: `PublishSummary` with per-card failures
async fn publish_all(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PublishSummary>, AppError> {
    crate::metrics::inc_requests("/sessions/publish");
    let mut session = state
        .workflow
        .get(&id)
        .await
        .ok_or_else(|| PipelineError::invalid_input("publish", "unknown_session"))?;
    let summary = state.publisher.publish_all(&id, &mut session).await?;
    state.workflow.replace(&id, session).await;
    crate::metrics::published_listings(summary.success_count);
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct CardPublishRequest {
    payload: String,
}

/// Publish a single card from the payload echoed back by the client, for
/// retrying one failed card without re-running the whole batch.
///
/// - Method: `POST`
/// - Path: `/sessions/{id}/cards/publish`
async fn publish_one_card(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CardPublishRequest>,
) -> Result<Json<CreatedListing>, AppError> {
    crate::metrics::inc_requests("/sessions/cards/publish");
    let mut session = state
        .workflow
        .get(&id)
        .await
        .ok_or_else(|| PipelineError::invalid_input("publish", "unknown_session"))?;
    let listing = state
        .publisher
        .publish_one(&id, &mut session, &request.payload)
        .await?;
    state.workflow.replace(&id, session).await;
    crate::metrics::published_listings(1);
    Ok(Json(listing))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Fatal => StatusCode::CONFLICT,
                    PipelineErrorKind::CredentialExpired => StatusCode::UNAUTHORIZED,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
