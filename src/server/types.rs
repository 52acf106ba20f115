use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::search::{PixelCoord, SearchMode};

/// 相似度搜索请求
#[derive(Debug, Deserialize, ToSchema)]
pub struct SearchRequest {
    pub viewport: String,
    pub year: u16,
    /// 查询嵌入，维度必须与索引一致
    pub embedding: Vec<f32>,
    /// 最大 L2 距离（含）
    pub threshold: f32,
    /// 不填则使用服务器默认的搜索方式
    pub mode: Option<SearchMode>,
    /// 近似搜索扫描的倒排列表数量
    pub nprobe: Option<usize>,
    /// 返回结果的最大数量
    pub max_results: Option<usize>,
}

/// 提取某个位置的嵌入
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtractRequest {
    pub viewport: String,
    pub year: u16,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExtractResponse {
    pub embedding: Vec<f32>,
    pub dim: usize,
    /// 嵌入栅格中的像素坐标
    pub pixel: PixelCoord,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// 每个视口下可用的图层
    pub layers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}
