use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;

use crate::cli::*;
use crate::geo::BoundingBox;
use crate::pyramid::{DEFAULT_NEAREST_LEVELS, DEFAULT_OUTPUT_SIZE, MAX_LEVELS};
use crate::search::{DEFAULT_MAX_RESULTS, DEFAULT_NPROBE, SearchMode};

static DATA_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "tessmap", "tessmap")
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string())
});

fn default_data_dir() -> &'static str {
    DATA_DIR.as_str()
}

#[derive(Parser, Debug, Clone)]
pub struct TileOptions {
    /// 年份图层第 0 层对应的缩放级别
    #[arg(long, value_name = "Z", default_value_t = 18)]
    pub year_base_zoom: i32,
    /// 命名图层 (satellite、rgb) 第 0 层对应的缩放级别
    #[arg(long, value_name = "Z", default_value_t = 12)]
    pub rgb_base_zoom: i32,
    /// 客户端缩放级别修正值
    #[arg(long, value_name = "N", default_value_t = 0, allow_hyphen_values = true)]
    pub zoom_offset: i32,
    /// 最大金字塔层级
    #[arg(long, value_name = "LEVEL", default_value_t = MAX_LEVELS - 1)]
    pub max_level: usize,
    /// 瓦片边长
    #[arg(long, value_name = "PIXELS", default_value_t = 256)]
    pub tile_size: u32,
    /// 除年份外允许访问的图层名
    #[arg(long, value_name = "NAMES", value_delimiter = ',', default_value = "satellite,rgb")]
    pub layers: Vec<String>,
    /// 路径解析缓存的容量
    #[arg(long, value_name = "N", default_value_t = 1024)]
    pub path_cache: usize,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self {
            year_base_zoom: 18,
            rgb_base_zoom: 12,
            zoom_offset: 0,
            max_level: MAX_LEVELS - 1,
            tile_size: 256,
            layers: vec!["satellite".into(), "rgb".into()],
            path_cache: 1024,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct PyramidOptions {
    /// 金字塔层数，范围 1 ~ 6
    #[arg(short = 'l', long, value_name = "N", default_value_t = MAX_LEVELS)]
    pub num_levels: usize,
    /// 每一层的输出边长
    #[arg(long, value_name = "PIXELS", default_value_t = DEFAULT_OUTPUT_SIZE)]
    pub output_size: usize,
    /// 使用最近邻重采样的层数，其余层使用 Lanczos
    #[arg(long, value_name = "N", default_value_t = DEFAULT_NEAREST_LEVELS)]
    pub nearest_levels: usize,
    /// 源数据的地面采样距离，单位为米
    #[arg(long, value_name = "METERS", default_value_t = 10.0)]
    pub gsd: f64,
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 构建近似索引时的空间采样步长
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub step: usize,
    /// 只索引该范围内的像素，格式为 min_lon,min_lat,max_lon,max_lat
    #[arg(long, value_name = "BBOX", value_parser = parse_bbox, allow_hyphen_values = true)]
    pub bbox: Option<BoundingBox>,
    /// k-means 最大迭代次数
    #[arg(long, value_name = "N", default_value_t = 25)]
    pub max_iter: usize,
    /// 训练使用的随机种子
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 搜索方式
    #[arg(long, value_enum, default_value_t = SearchMode::Exact)]
    pub mode: SearchMode,
    /// 近似搜索时扫描的倒排列表数量
    #[arg(long, value_name = "N", default_value_t = DEFAULT_NPROBE)]
    pub nprobe: usize,
    /// 返回结果的最大数量
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_MAX_RESULTS)]
    pub max_results: usize,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tessmap", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 数据目录
    #[arg(short, long, default_value = default_data_dir())]
    pub data_dir: DataDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 为视口图层构建固定尺寸的影像金字塔
    Pyramid(PyramidCommand),
    /// 为嵌入栅格构建 2x2 均值池化金字塔
    Coarsen(CoarsenCommand),
    /// 从嵌入栅格提取 RGB 预览
    Rgb(RgbCommand),
    /// 构建相似度搜索索引
    Index(IndexCommand),
    /// 搜索与指定位置相似的像素
    Search(SearchCommand),
    /// 根据标签均值重新标注像素
    Relabel(RelabelCommand),
    /// 启动 HTTP 瓦片与搜索服务
    Server(ServerCommand),
}

/// 数据目录，所有产物都按固定结构放在其中
#[derive(Debug, Clone)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回某一年嵌入栅格的路径
    pub fn mosaic(&self, viewport: &str, year: u16) -> PathBuf {
        self.path.join("mosaics").join(format!("{viewport}_embeddings_{year}.npy"))
    }

    /// 返回 RGB 预览栅格的路径
    pub fn rgb_mosaic(&self, viewport: &str, year: u16) -> PathBuf {
        self.path.join("mosaics").join(format!("{viewport}_rgb_{year}.npy"))
    }

    /// 返回金字塔根目录
    pub fn pyramids(&self) -> PathBuf {
        self.path.join("pyramids")
    }

    /// 返回某个图层的金字塔目录
    pub fn pyramid(&self, viewport: &str, layer: &str) -> PathBuf {
        self.pyramids().join(viewport).join(layer)
    }

    /// 返回嵌入金字塔目录
    pub fn coarsened(&self, viewport: &str, year: u16) -> PathBuf {
        self.path.join("coarsened").join(viewport).join(year.to_string())
    }

    /// 返回索引产物目录
    pub fn index(&self, viewport: &str, year: u16) -> PathBuf {
        self.path.join("indices").join(viewport).join(year.to_string())
    }
}

impl FromStr for DataDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

fn parse_bbox(s: &str) -> anyhow::Result<BoundingBox> {
    let parts = s.split(',').map(|v| v.trim().parse::<f64>()).collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        &[min_lon, min_lat, max_lon, max_lat] if min_lon < max_lon && min_lat < max_lat => {
            Ok(BoundingBox::new(min_lon, min_lat, max_lon, max_lat))
        }
        _ => Err(anyhow::anyhow!("无效的范围: {}", s)),
    }
}
