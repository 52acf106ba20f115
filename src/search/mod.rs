//! 嵌入相似度搜索
//!
//! 同一个 [`SimilaritySearch`] 接口有两种实现：
//! - [`ExactIndex`]：区域内所有像素的完整嵌入矩阵，暴力计算 L2 距离
//! - [`IvfPqIndex`]：对降采样后的像素构建的 IVF-PQ 近似索引

mod builder;
mod exact;
mod ivfpq;
mod kmeans;

use std::time::Instant;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use self::builder::*;
pub use self::exact::*;
pub use self::ivfpq::*;
pub use self::kmeans::*;
use crate::error::{Error, Result};
use crate::geo::{GeoTransform, pixel_to_lonlat};

/// 单次搜索返回结果的上限
pub const DEFAULT_MAX_RESULTS: usize = 10_000;
/// 近似搜索默认扫描的倒排列表数量
pub const DEFAULT_NPROBE: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// 完整嵌入矩阵上的精确搜索
    #[default]
    Exact,
    /// 降采样 IVF-PQ 索引上的近似搜索
    Approximate,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Approximate => "approximate",
        }
    }
}

/// 搜索参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchQuery {
    /// 最大 L2 距离（含）
    pub threshold: f32,
    pub max_results: usize,
    pub nprobe: usize,
}

impl SearchQuery {
    pub fn new(threshold: f32) -> Self {
        Self { threshold, max_results: DEFAULT_MAX_RESULTS, nprobe: DEFAULT_NPROBE }
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe;
        self
    }

    /// 检查阈值与查询向量维度
    pub fn validate(&self, query: &[f32], dim: usize) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(Error::config(format!("无效的阈值: {}", self.threshold)));
        }
        if query.len() != dim {
            return Err(Error::config(format!("查询向量维度为 {}，索引维度为 {dim}", query.len())));
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(Error::config("查询向量包含 NaN 或无穷大"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PixelCoord {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Match {
    pub lat: f64,
    pub lon: f64,
    pub distance: f32,
    pub pixel: PixelCoord,
}

/// 搜索统计，距离统计针对所有参与比较的向量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QueryStats {
    pub total_pixels: usize,
    pub matches_found: usize,
    pub threshold: f32,
    pub distance_min: Option<f32>,
    pub distance_max: Option<f32>,
    pub distance_mean: Option<f32>,
    pub distance_median: Option<f32>,
    pub computation_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SearchResult {
    pub matches: Vec<Match>,
    pub query_stats: QueryStats,
}

/// 阈值相似度搜索
pub trait SimilaritySearch: Send + Sync {
    /// 向量维度
    fn dim(&self) -> usize;

    /// 索引中的向量数量
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 返回与 `query` 距离不超过阈值的所有像素，按距离升序排列
    fn search(&self, query: &[f32], q: &SearchQuery) -> Result<SearchResult>;
}

#[inline]
pub fn l2_sqr(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[inline]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    l2_sqr(a, b).sqrt()
}

/// 由所有候选 `(序号, 距离)` 生成搜索结果：先排序再截断
pub(crate) fn collect_result<F>(
    candidates: Vec<(usize, f32)>,
    coord: F,
    transform: &GeoTransform,
    q: &SearchQuery,
    start: Instant,
) -> SearchResult
where
    F: Fn(usize) -> (i32, i32),
{
    let total_pixels = candidates.len();
    let mut distances = candidates.iter().map(|(_, d)| *d).collect::<Vec<_>>();
    let (min, max, mean, median) = distance_stats(&mut distances);

    let mut matched = candidates.into_iter().filter(|(_, d)| *d <= q.threshold).collect::<Vec<_>>();
    matched.sort_unstable_by(|a, b| a.1.total_cmp(&b.1));
    matched.truncate(q.max_results);

    let matches = matched
        .into_iter()
        .map(|(i, distance)| {
            let (x, y) = coord(i);
            let (lon, lat) = pixel_to_lonlat(x as f64, y as f64, transform);
            Match { lat, lon, distance, pixel: PixelCoord { x, y } }
        })
        .collect::<Vec<_>>();

    SearchResult {
        query_stats: QueryStats {
            total_pixels,
            matches_found: matches.len(),
            threshold: q.threshold,
            distance_min: min,
            distance_max: max,
            distance_mean: mean,
            distance_median: median,
            computation_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        },
        matches,
    }
}

type Stats = (Option<f32>, Option<f32>, Option<f32>, Option<f32>);

/// 最小值、最大值、平均值、中位数，会打乱 `distances` 的顺序
fn distance_stats(distances: &mut [f32]) -> Stats {
    let n = distances.len();
    if n == 0 {
        return (None, None, None, None);
    }
    let min = distances.iter().copied().fold(f32::INFINITY, f32::min);
    let max = distances.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mean = (distances.iter().map(|&d| d as f64).sum::<f64>() / n as f64) as f32;

    let (_, &mut upper, _) = distances.select_nth_unstable_by(n / 2, f32::total_cmp);
    let median = if n % 2 == 1 {
        upper
    } else {
        // 偶数个时取中间两个数的平均值
        let lower = distances[..n / 2].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (lower + upper) / 2.0
    };
    (Some(min), Some(max), Some(mean), Some(median))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_stats() {
        let mut d = vec![3.0, 1.0, 4.0, 1.0, 5.0];
        assert_eq!(distance_stats(&mut d), (Some(1.0), Some(5.0), Some(2.8), Some(3.0)));
        let mut d = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(distance_stats(&mut d), (Some(1.0), Some(4.0), Some(2.5), Some(2.5)));
        assert_eq!(distance_stats(&mut []), (None, None, None, None));
    }

    #[test]
    fn test_validate_query() {
        let q = SearchQuery::new(1.0);
        assert!(q.validate(&[0.0; 4], 4).is_ok());
        assert!(matches!(q.validate(&[0.0; 3], 4), Err(Error::Configuration(_))));
        assert!(matches!(SearchQuery::new(-1.0).validate(&[0.0; 4], 4), Err(Error::Configuration(_))));
        assert!(matches!(SearchQuery::new(f32::NAN).validate(&[0.0; 4], 4), Err(Error::Configuration(_))));
        assert!(matches!(q.validate(&[f32::NAN; 4], 4), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_collect_sorts_then_truncates() {
        let candidates = vec![(0, 0.9), (1, 0.1), (2, 0.5), (3, 2.0)];
        let gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        let q = SearchQuery::new(1.0).max_results(2);
        let r = collect_result(candidates, |i| (i as i32, 0), &gt, &q, Instant::now());
        let got = r.matches.iter().map(|m| (m.pixel.x, m.distance)).collect::<Vec<_>>();
        assert_eq!(got, vec![(1, 0.1), (2, 0.5)]);
        assert_eq!(r.query_stats.total_pixels, 4);
        assert_eq!(r.query_stats.matches_found, 2);
        assert_eq!(r.query_stats.distance_min, Some(0.1));
        assert_eq!(r.query_stats.distance_max, Some(2.0));
        assert_eq!(r.matches[0].lon, 1.0);
    }
}
