//! HTTP API Server for Recommendations
//!
//! Live and stored recommendations for the frontend, plus an admin
//! trigger for retraining.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::recommendation::{
    ModelHandle, ModelTrainer, RecommendationCandidate, RecommendationRow, Recommender,
};
use crate::store::{CatalogStore, RecommendationReader, UserDirectory};

/// Shared application state
pub struct AppState {
    pub recommender: Recommender,
    pub trainer: ModelTrainer,
    pub reader: Arc<dyn RecommendationReader>,
    pub users: Arc<dyn UserDirectory>,
    pub catalog: Arc<dyn CatalogStore>,
    pub model: ModelHandle,
    pub max_count: usize,
}

const DEFAULT_COUNT: usize = 10;

#[derive(Debug, Deserialize)]
pub struct RecommendationsQuery {
    pub count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    pub user_id: Uuid,
    pub items: Vec<RecommendationCandidate>,
    pub total: usize,
}

/// A stored row with the show's current title, if the show still exists
#[derive(Debug, Serialize)]
pub struct SavedRecommendation {
    #[serde(flatten)]
    pub row: RecommendationRow,
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SavedRecommendationsResponse {
    pub user_id: Uuid,
    pub items: Vec<SavedRecommendation>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub status: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model_loaded: bool,
}

/// Build the router with its middleware stack
pub fn router(state: Arc<AppState>, config: &ApiConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/recommendations/train", post(train_model))
        .route("/api/v1/recommendations/:user_id", get(get_recommendations))
        .route(
            "/api/v1/recommendations/:user_id/saved",
            get(get_saved_recommendations),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(cors_layer(&config.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    cors.allow_origin(allowed)
}

/// Start the API server and serve until `shutdown` resolves
pub async fn start_server(
    state: Arc<AppState>,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state, config);

    let addr = format!("{}:{}", config.host, config.port);
    info!("🚀 Starting recommendation API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_loaded: state.model.is_loaded(),
    })
}

fn parse_user_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::bad_request(format!("Invalid user id: {}", raw)))
}

/// Live recommendations, computed on request
async fn get_recommendations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<RecommendationsQuery>,
) -> Result<Json<RecommendationsResponse>> {
    let user_id = parse_user_id(&user_id)?;
    let count = query
        .count
        .unwrap_or(DEFAULT_COUNT)
        .clamp(1, state.max_count.max(1));

    let items = state.recommender.recommend(user_id, count).await?;
    Ok(Json(RecommendationsResponse {
        user_id,
        total: items.len(),
        items,
    }))
}

/// Rows written by the last materialization pass. 404 for unknown users.
async fn get_saved_recommendations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<SavedRecommendationsResponse>> {
    let user_id = parse_user_id(&user_id)?;
    if !state.users.user_exists(user_id).await? {
        return Err(Error::not_found("user", user_id.to_string()));
    }

    let rows = state.reader.list_user_recommendations(user_id).await?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let title = state.catalog.get_show(row.show_id).await?.map(|s| s.title);
        items.push(SavedRecommendation { row, title });
    }

    Ok(Json(SavedRecommendationsResponse {
        user_id,
        total: items.len(),
        items,
    }))
}

/// Queue a training run in the background
async fn train_model(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<TrainResponse>)> {
    let run = state.trainer.spawn_training()?;
    tokio::spawn(async move {
        match run.await {
            Ok(outcome) => info!("Manual training run finished: {:?}", outcome),
            Err(e) => warn!("Manual training task failed: {}", e),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TrainResponse {
            status: "accepted",
            message: "Model training started",
        }),
    ))
}
