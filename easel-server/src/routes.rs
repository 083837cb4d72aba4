use axum::{
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use easel_core::{encode_png, GenerationRequest, ModelInfo};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{ApiError, AppState};

const INDEX_HTML: &str = include_str!("../static/index.html");
const SCRIPT_JS: &str = include_str!("../static/script.js");

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/static/script.js", get(script))
        .route("/health", get(health))
        .route("/model-info", get(model_info))
        .route("/generate", post(generate_image_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/javascript")], SCRIPT_JS)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    model_loaded: bool,
}

async fn health(State(state): State<AppState>) -> Result<Json<Health>, ApiError> {
    if !state.is_ready() {
        return Err(ApiError::NotReady);
    }
    Ok(Json(Health {
        status: "healthy",
        model_loaded: true,
    }))
}

async fn model_info(State(state): State<AppState>) -> Result<Json<ModelInfo>, ApiError> {
    let model = state.model().ok_or(ApiError::NotReady)?;
    Ok(Json(model.info().clone()))
}

async fn generate_image_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    request.validate()?;
    let model = state.model().ok_or(ApiError::NotReady)?;

    info!(
        width = request.width,
        height = request.height,
        steps = request.num_inference_steps,
        guidance_scale = request.guidance_scale,
        seed = ?request.seed,
        "generating image"
    );

    // Sampling is long and CPU/GPU bound, keep it off the async workers.
    let png = tokio::task::spawn_blocking(move || {
        let image = model.run(&request)?;
        encode_png(&image)
    })
    .await
    .map_err(anyhow::Error::from)
    .and_then(|result| result)
    .map_err(|e| {
        error!("Image generation failed: {e:#}");
        ApiError::Generation(format!("{e:#}"))
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CONTENT_DISPOSITION, "inline; filename=generated.png"),
        ],
        png,
    ))
}
