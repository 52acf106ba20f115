mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use self::state::*;
pub use self::types::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::tile_handler,
        api::bounds_handler,
        api::health_handler,
        api::search_handler,
        api::relabel_handler,
        api::extract_handler,
        api::metrics_handler,
    ),
    components(schemas(
        types::SearchRequest,
        types::ExtractRequest,
        types::ExtractResponse,
        types::HealthResponse,
        types::ErrorResponse,
        crate::search::SearchResult,
        crate::relabel::RelabelRequest,
        crate::relabel::RelabelResult,
        crate::tiles::TileBounds,
    ))
)]
pub struct ApiDoc;

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tiles/{viewport}/{layer}/{z}/{x}/{y}", get(api::tile_handler))
        .route("/bounds/{viewport}/{layer}", get(api::bounds_handler))
        .route("/health", get(api::health_handler))
        .route("/search", post(api::search_handler))
        .route("/relabel", post(api::relabel_handler))
        .route("/embeddings/extract", post(api::extract_handler))
        .route("/metrics", get(api::metrics_handler))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        // 请求体限制：32M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 32))
        .with_state(state)
}
