//! 影像金字塔
//!
//! 视觉金字塔的每一层都与输出尺寸相同（默认 4408x4408），只有有效分辨率随层级降低；
//! 嵌入金字塔（见 [`CoarsenedBuilder`]）则是真正的 2x2 均值池化，每层尺寸减半。

mod coarsen;
mod resample;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::{Deserialize, Serialize};

pub use self::coarsen::*;
pub use self::resample::*;
use crate::error::{Error, Result};
use crate::geo::GeoTransform;
use crate::raster::{Raster, RasterData, extract_rgb};
use crate::utils::{file_mtime_secs, read_json, remove_if_exists, write_json};

pub const PYRAMID_METADATA: &str = "pyramid_metadata.json";
pub const MAX_LEVELS: usize = 6;
pub const DEFAULT_OUTPUT_SIZE: usize = 4408;
pub const DEFAULT_NEAREST_LEVELS: usize = 3;

/// 第 `level` 层的数据文件名
pub fn level_file(level: usize) -> String {
    format!("level_{level}.npy")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelMetadata {
    pub level: usize,
    pub file: String,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    /// 为空表示 2x2 均值池化
    pub resampling: Option<Resampling>,
    /// 有效地面采样距离，单位为米
    pub gsd: f64,
    pub transform: GeoTransform,
    pub size_bytes: u64,
}

impl LevelMetadata {
    fn new(level: usize, raster: &Raster, resampling: Option<Resampling>, size_bytes: u64) -> Self {
        Self {
            level,
            file: level_file(level),
            width: raster.meta.width,
            height: raster.meta.height,
            bands: raster.meta.bands,
            resampling,
            gsd: raster.meta.gsd,
            transform: raster.meta.transform,
            size_bytes,
        }
    }
}

/// 金字塔构建结果，同时也是缓存元数据文件的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidMetadata {
    pub source: PathBuf,
    /// 构建时源文件的修改时间
    pub source_mtime: f64,
    pub source_gsd: f64,
    /// 视觉金字塔的固定输出尺寸，嵌入金字塔为空
    pub output_size: Option<usize>,
    pub created_at: f64,
    pub levels: Vec<LevelMetadata>,
    /// 本次调用是否直接命中了缓存
    #[serde(default)]
    pub cached: bool,
}

impl PyramidMetadata {
    fn new(source: &Path, source_mtime: f64, source_gsd: f64, output_size: Option<usize>) -> Self {
        let created_at =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
        Self {
            source: source.to_path_buf(),
            source_mtime,
            source_gsd,
            output_size,
            created_at,
            levels: vec![],
            cached: false,
        }
    }
}

/// 读取缓存的元数据，只有源文件未更新、输出尺寸一致且所有层级文件都存在时才视为有效
pub(crate) fn load_cached(
    output_dir: &Path,
    metadata_file: &str,
    source_mtime: f64,
    num_levels: usize,
    output_size: Option<usize>,
) -> Result<Option<PyramidMetadata>> {
    let Some(mut meta) = read_json::<PyramidMetadata>(output_dir.join(metadata_file))? else {
        return Ok(None);
    };
    if source_mtime > meta.source_mtime {
        debug!("源文件已更新：{} > {}", source_mtime, meta.source_mtime);
        return Ok(None);
    }
    if meta.output_size != output_size {
        debug!("输出尺寸已改变：{:?} -> {:?}", meta.output_size, output_size);
        return Ok(None);
    }
    if meta.levels.len() != num_levels
        || meta.levels.iter().any(|level| !output_dir.join(&level.file).exists())
    {
        debug!("缓存的层级不完整");
        return Ok(None);
    }
    meta.cached = true;
    Ok(Some(meta))
}

/// 检查层数与源文件，返回源文件修改时间
pub(crate) fn check_source(source: &Path, num_levels: usize) -> Result<f64> {
    if !(1..=MAX_LEVELS).contains(&num_levels) {
        return Err(Error::config(format!("层数必须在 1 到 {MAX_LEVELS} 之间，当前为 {num_levels}")));
    }
    if !source.exists() {
        return Err(Error::not_found(format!("源文件 {}", source.display())));
    }
    file_mtime_secs(source)
}

/// 固定输出尺寸的视觉金字塔构建器
#[derive(Debug, Clone)]
pub struct PyramidBuilder {
    num_levels: usize,
    output_size: usize,
    nearest_levels: usize,
}

impl Default for PyramidBuilder {
    fn default() -> Self {
        Self {
            num_levels: MAX_LEVELS,
            output_size: DEFAULT_OUTPUT_SIZE,
            nearest_levels: DEFAULT_NEAREST_LEVELS,
        }
    }
}

impl PyramidBuilder {
    pub fn new(num_levels: usize) -> Self {
        Self { num_levels, ..Default::default() }
    }

    pub fn output_size(mut self, output_size: usize) -> Self {
        self.output_size = output_size;
        self
    }

    pub fn nearest_levels(mut self, nearest_levels: usize) -> Self {
        self.nearest_levels = nearest_levels;
        self
    }

    /// 构建金字塔，源文件未更新时直接返回缓存的元数据
    pub fn build(
        &self,
        source: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        source_gsd: f64,
    ) -> Result<PyramidMetadata> {
        let (source, output_dir) = (source.as_ref(), output_dir.as_ref());
        let source_mtime = check_source(source, self.num_levels)?;
        if self.output_size == 0 {
            return Err(Error::config("输出尺寸不能为 0"));
        }

        let cached = load_cached(output_dir, PYRAMID_METADATA, source_mtime, self.num_levels, Some(self.output_size))?;
        if let Some(meta) = cached {
            if meta.levels.iter().all(|l| l.resampling == Some(self.resampling(l.level))) {
                info!("金字塔缓存有效，跳过构建：{}", output_dir.display());
                return Ok(meta);
            }
            debug!("重采样方式已改变，重新构建");
        }

        fs::create_dir_all(output_dir)?;
        // 先删除旧的元数据，构建中途失败时不会留下看似有效的缓存
        remove_if_exists(output_dir.join(PYRAMID_METADATA))?;

        let mut raster = Raster::read(source)?;
        if let RasterData::F32(_) = raster.data {
            info!("源文件为浮点嵌入，提取前三个波段作为 RGB");
            raster = extract_rgb(&raster);
        }

        let mut meta = PyramidMetadata::new(source, source_mtime, source_gsd, Some(self.output_size));
        let mut prev = self.level_zero(&raster, source_gsd)?;
        for level in 0..self.num_levels {
            let resampling = self.resampling(level);
            if level > 0 {
                prev = self.next_level(&prev, resampling)?;
            }
            let size = prev.write(output_dir.join(level_file(level)))?;
            info!(
                "第 {level} 层：{}x{} @ {:.1}m/像素 [{:?}] ({:.1} KB)",
                prev.meta.width,
                prev.meta.height,
                prev.meta.gsd,
                resampling,
                size as f64 / 1024.0
            );
            meta.levels.push(LevelMetadata::new(level, &prev, Some(resampling), size));
        }

        write_json(output_dir.join(PYRAMID_METADATA), &meta)?;
        Ok(meta)
    }

    fn resampling(&self, level: usize) -> Resampling {
        match level {
            0 => Resampling::Nearest,
            _ => Resampling::for_level(level, self.nearest_levels),
        }
    }

    /// 第 0 层：尺寸与输出尺寸不一致时用最近邻缩放
    fn level_zero(&self, raster: &Raster, source_gsd: f64) -> Result<Raster> {
        let RasterData::U8(data) = &raster.data else {
            return Err(Error::integrity("第 0 层必须为 8 位影像"));
        };
        let (h, w, _) = data.dim();
        let n = self.output_size;
        let gsd = source_gsd * (w as f64 / n as f64).max(1.0);
        let transform = raster.meta.transform.scale(w as f64 / n as f64, h as f64 / n as f64);
        let data = resize_u8(data.view(), n, n, Resampling::Nearest)?;
        Ok(Raster::new(RasterData::U8(data), transform, gsd))
    }

    /// 由上一层生成下一层：先缩小一半，再放大回输出尺寸
    fn next_level(&self, prev: &Raster, resampling: Resampling) -> Result<Raster> {
        let RasterData::U8(data) = &prev.data else {
            return Err(Error::integrity("金字塔层级必须为 8 位影像"));
        };
        let (h, w, _) = data.dim();
        let (hw, hh) = ((w / 2).max(1), (h / 2).max(1));
        let n = self.output_size;

        let half = resize_u8(data.view(), hw, hh, resampling)?;
        let transform = prev.meta.transform.scale(w as f64 / hw as f64, h as f64 / hh as f64);
        let data = resize_u8(half.view(), n, n, resampling)?;
        let transform = transform.scale(hw as f64 / n as f64, hh as f64 / n as f64);
        Ok(Raster::new(RasterData::U8(data), transform, prev.meta.gsd * 2.0))
    }
}
