use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use log::info;
use tokio::task::spawn_blocking;

use super::error::Result;
use super::state::AppState;
use super::types::*;
use crate::error::Error;
use crate::metrics;
use crate::raster::RasterView;
use crate::relabel::{RelabelRequest, RelabelResult};
use crate::search::{PixelCoord, SearchQuery, SearchResult};
use crate::tiles::{TileBounds, validate_viewport};

/// 获取一张 PNG 瓦片
///
/// 数据缺失时返回全透明瓦片，只有非法参数才会返回错误。
#[utoipa::path(
    get,
    path = "/tiles/{viewport}/{layer}/{z}/{x}/{y}",
    params(
        ("viewport" = String, Path, description = "视口名"),
        ("layer" = String, Path, description = "图层名，年份或 satellite / rgb 等"),
        ("z" = u32, Path),
        ("x" = u32, Path),
        ("y" = String, Path, description = "形如 `123.png`"),
    ),
    responses(
        (status = 200, content_type = "image/png", body = Vec<u8>),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn tile_handler(
    State(state): State<Arc<AppState>>,
    Path((viewport, layer, z, x, y)): Path<(String, String, u32, u32, String)>,
) -> Result<Response> {
    let y = y
        .strip_suffix(".png")
        .unwrap_or(&y)
        .parse::<u32>()
        .map_err(|_| Error::config(format!("非法的瓦片坐标: {y}")))?;
    let png = spawn_blocking(move || state.tiles.get_tile(&viewport, &layer, z, x, y)).await??;
    Ok((
        [(header::CONTENT_TYPE, "image/png"), (header::CACHE_CONTROL, "public, max-age=3600")],
        png,
    )
        .into_response())
}

/// 获取图层的地理范围
#[utoipa::path(
    get,
    path = "/bounds/{viewport}/{layer}",
    params(
        ("viewport" = String, Path, description = "视口名"),
        ("layer" = String, Path, description = "图层名"),
    ),
    responses(
        (status = 200, body = TileBounds),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn bounds_handler(
    State(state): State<Arc<AppState>>,
    Path((viewport, layer)): Path<(String, String)>,
) -> Result<Json<TileBounds>> {
    let bounds = spawn_blocking(move || state.tiles.bounds(&viewport, &layer)).await??;
    Ok(Json(bounds))
}

/// 服务状态与可用图层
#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let layers = spawn_blocking(move || state.tiles.available_layers()).await?;
    Ok(Json(HealthResponse { status: "ok".to_string(), layers }))
}

/// 搜索与查询嵌入相似的像素
#[utoipa::path(
    post,
    path = "/search",
    request_body = SearchRequest,
    responses(
        (status = 200, body = SearchResult),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResult>> {
    validate_viewport(&req.viewport)?;
    if !req.threshold.is_finite() || req.threshold < 0.0 {
        return Err(Error::config(format!("无效的阈值: {}", req.threshold)).into());
    }
    let mode = req.mode.unwrap_or(state.search.mode);
    let query = SearchQuery::new(req.threshold)
        .max_results(req.max_results.unwrap_or(state.search.max_results))
        .nprobe(req.nprobe.unwrap_or(state.search.nprobe));

    info!("{} 搜索 {}/{}，阈值 {}", mode.as_str(), req.viewport, req.year, req.threshold);
    let result = spawn_blocking(move || -> crate::Result<SearchResult> {
        let index = state.index(&req.viewport, req.year)?;
        index.get(mode).search(&req.embedding, &query)
    })
    .await??;

    let stats = &result.query_stats;
    metrics::observe_search(mode.as_str(), stats.computation_time_ms / 1000.0, stats.matches_found);
    info!(
        "{} / {} 个像素匹配，耗时 {:.2}ms",
        stats.matches_found, stats.total_pixels, stats.computation_time_ms
    );
    Ok(Json(result))
}

/// 根据标签均值重新标注像素
#[utoipa::path(
    post,
    path = "/relabel",
    request_body = RelabelRequest,
    responses(
        (status = 200, body = RelabelResult),
        (status = 400, body = ErrorResponse),
    )
)]
pub async fn relabel_handler(Json(req): Json<RelabelRequest>) -> Result<Json<RelabelResult>> {
    let result = spawn_blocking(move || req.run()).await??;
    Ok(Json(result))
}

/// 提取某个经纬度处的嵌入向量
#[utoipa::path(
    post,
    path = "/embeddings/extract",
    request_body = ExtractRequest,
    responses(
        (status = 200, body = ExtractResponse),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
    )
)]
pub async fn extract_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>> {
    validate_viewport(&req.viewport)?;
    let path = state.data_dir.mosaic(&req.viewport, req.year);
    let (lat, lon) = (req.lat, req.lon);
    let (embedding, (x, y)) =
        spawn_blocking(move || -> crate::Result<_> { RasterView::open(&path)?.sample_lonlat(lon, lat) })
            .await??;
    Ok(Json(ExtractResponse {
        dim: embedding.len(),
        embedding,
        pixel: PixelCoord { x: x as i32, y: y as i32 },
        lat,
        lon,
    }))
}

/// Prometheus 文本格式的指标
#[utoipa::path(get, path = "/metrics", responses((status = 200, content_type = "text/plain", body = String)))]
pub async fn metrics_handler() -> Result<Response> {
    let text = metrics::gather_text()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}
