use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
};

mod analyze;
mod config;
mod gemini;
mod models;
mod normalize;

use analyze::AppState;
use config::Settings;
use gemini::GeminiBackend;
use models::HealthResponse;

const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("SenseSketch API server is starting up");

    let settings = Settings::from_env()?;
    let backend = GeminiBackend::new(&settings)?;
    tracing::info!("primary model: {}", settings.resolved_model_name());

    let bind_addr = settings.bind_addr;
    let state = AppState {
        settings: Arc::new(settings),
        backend: Arc::new(backend),
    };

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(health))
        .route("/api/v1/analyze", post(analyze::analyze))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::custom(analyze::panic_response))
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        message: "SenseSketch API is running",
        status: "ok",
    })
}
