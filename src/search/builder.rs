//! 索引产物的构建与加载
//!
//! 每个 (viewport, year) 对应一组产物：
//! - `ivfpq.bin`：降采样后的近似索引
//! - `all_embeddings.npy`：区域内全部像素的 `n x D` 嵌入矩阵
//! - `pixel_coords.npy`：`n x 2` 的像素坐标表
//! - `metadata.json`：地理变换等元数据，最后写入
//!
//! 四个文件必须同时存在，缺少任意一个都视为整组缺失。

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use ndarray::prelude::*;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};

use super::{ExactIndex, IvfPqIndex, SearchMode, SimilaritySearch};
use crate::error::{Error, Result};
use crate::geo::{BoundingBox, GeoTransform};
use crate::raster::{PixelWindow, RasterView};
use crate::utils::{TimeMeasure, read_json, remove_if_exists, write_json};

pub const IVFPQ_FILE: &str = "ivfpq.bin";
pub const EMBEDDINGS_FILE: &str = "all_embeddings.npy";
pub const COORDS_FILE: &str = "pixel_coords.npy";
pub const METADATA_FILE: &str = "metadata.json";

/// 产物文件，元数据排在最后
pub const ARTIFACTS: [&str; 4] = [IVFPQ_FILE, EMBEDDINGS_FILE, COORDS_FILE, METADATA_FILE];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub viewport: String,
    pub year: u16,
    pub source: PathBuf,
    pub dim: usize,
    /// 精确索引中的像素数量
    pub total_pixels: usize,
    /// 近似索引中的像素数量
    pub sampled_pixels: usize,
    pub sampling_factor: usize,
    pub nlist: usize,
    pub m: usize,
    /// 源栅格中的像素窗口 `[x0, y0, x1, y1]`，半开区间
    pub window: [usize; 4],
    pub bbox: BoundingBox,
    pub geotransform: GeoTransform,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct IndexBuilder {
    step: usize,
    bbox: Option<BoundingBox>,
    max_iter: usize,
    seed: u64,
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self { step: 4, bbox: None, max_iter: 25, seed: 42 }
    }
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 近似索引的空间采样步长
    pub fn step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn bbox(mut self, bbox: Option<BoundingBox>) -> Self {
        self.bbox = bbox;
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(
        &self,
        source: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        viewport: &str,
        year: u16,
    ) -> Result<IndexMetadata> {
        let (source, output_dir) = (source.as_ref(), output_dir.as_ref());
        if self.step == 0 {
            return Err(Error::config("采样步长不能为 0"));
        }

        let view = RasterView::open(source)?;
        let meta = view.meta().clone();
        let window = match &self.bbox {
            Some(bbox) => meta
                .window_for_bbox(bbox)
                .ok_or_else(|| Error::config(format!("范围 {:?} 与栅格没有交集", bbox.to_array())))?,
            None => meta.full_window(),
        };
        if window.is_empty() {
            return Err(Error::config("索引区域为空"));
        }
        info!("读取 {} 的像素窗口 {:?}，共 {} 个像素", source.display(), window, window.len());

        let mut tm = TimeMeasure::new();
        let mut embeddings = tm.measure("read", || view.read_vectors(window))?;
        check_embeddings(&mut embeddings)?;
        let dim = embeddings.ncols();
        let coords = pixel_coords(window);

        // 每 step x step 个像素取一个
        let sampled = (0..window.len())
            .filter(|&i| (i / window.width()) % self.step == 0 && (i % window.width()) % self.step == 0)
            .collect::<Vec<_>>();
        let sample = embeddings.select(Axis(0), &sampled);
        let sample_coords = sampled.iter().map(|&i| (coords[[i, 0]], coords[[i, 1]])).collect::<Vec<_>>();
        info!("降采样 {}x{}：{} 个像素用于近似索引", self.step, self.step, sampled.len());

        let flat = sample.as_standard_layout();
        let flat = flat.as_slice().ok_or_else(|| Error::Computation("采样矩阵不连续".into()))?;
        let ivf = tm.measure("train", || {
            IvfPqIndex::train(flat, dim, sample_coords, meta.transform, self.max_iter, self.seed)
        })?;

        fs::create_dir_all(output_dir)?;
        // 先删除旧的元数据，写入中途失败时整组产物视为缺失
        remove_if_exists(output_dir.join(METADATA_FILE))?;

        tm.measure("write", || -> Result<()> {
            let writer = BufWriter::new(File::create(output_dir.join(IVFPQ_FILE))?);
            bincode::serialize_into(writer, &ivf)?;
            write_npy(output_dir.join(EMBEDDINGS_FILE), &embeddings)?;
            write_npy(output_dir.join(COORDS_FILE), &coords)?;
            Ok(())
        })?;

        let metadata = IndexMetadata {
            viewport: viewport.to_string(),
            year,
            source: source.to_path_buf(),
            dim,
            total_pixels: embeddings.nrows(),
            sampled_pixels: sampled.len(),
            sampling_factor: self.step,
            nlist: ivf.nlist(),
            m: ivf.m(),
            window: [window.x0, window.y0, window.x1, window.y1],
            bbox: meta.window_bounds(window),
            geotransform: meta.transform,
            created_at: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0),
        };
        write_json(output_dir.join(METADATA_FILE), &metadata)?;
        info!("索引产物已写入 {}", output_dir.display());
        debug!(
            "读取 {:.2}ms，训练 {:.2}ms，写入 {:.2}ms",
            tm.get_ms("read"),
            tm.get_ms("train"),
            tm.get_ms("write")
        );
        Ok(metadata)
    }
}

/// 非有限值置零，全零矩阵视为损坏的数据
fn check_embeddings(embeddings: &mut Array2<f32>) -> Result<()> {
    let mut invalid = 0usize;
    embeddings.map_inplace(|v| {
        if !v.is_finite() {
            *v = 0.0;
            invalid += 1;
        }
    });
    if invalid > 0 {
        warn!("{invalid} 个嵌入值为 NaN 或无穷大，已置零");
    }
    if embeddings.iter().all(|&v| v == 0.0) {
        return Err(Error::integrity("嵌入矩阵全部为零，源数据可能已损坏"));
    }
    Ok(())
}

/// 窗口内每个像素在源栅格中的 `(x, y)`，按行优先排列
fn pixel_coords(window: PixelWindow) -> Array2<i32> {
    let w = window.width();
    Array2::from_shape_fn((window.len(), 2), |(i, j)| match j {
        0 => (window.x0 + i % w) as i32,
        _ => (window.y0 + i / w) as i32,
    })
}

/// 加载后的一整组索引产物
#[derive(Debug)]
pub struct IndexArtifacts {
    pub metadata: IndexMetadata,
    pub exact: ExactIndex,
    pub approximate: IvfPqIndex,
}

impl IndexArtifacts {
    /// 缺失的产物文件
    pub fn missing(dir: impl AsRef<Path>) -> Vec<&'static str> {
        ARTIFACTS.into_iter().filter(|f| !dir.as_ref().join(f).exists()).collect()
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let missing = Self::missing(dir);
        if !missing.is_empty() {
            return Err(Error::not_found(format!("索引 {} 缺少 {:?}", dir.display(), missing)));
        }

        let metadata = read_json::<IndexMetadata>(dir.join(METADATA_FILE))?
            .ok_or_else(|| Error::not_found(format!("{}", dir.join(METADATA_FILE).display())))?;
        let embeddings: Array2<f32> = read_npy(dir.join(EMBEDDINGS_FILE))?;
        let coords: Array2<i32> = read_npy(dir.join(COORDS_FILE))?;
        let reader = BufReader::new(File::open(dir.join(IVFPQ_FILE))?);
        let approximate: IvfPqIndex = bincode::deserialize_from(reader)?;

        if embeddings.ncols() != metadata.dim || approximate.dim() != metadata.dim {
            return Err(Error::integrity(format!(
                "索引维度不一致：元数据 {}，嵌入矩阵 {}，近似索引 {}",
                metadata.dim,
                embeddings.ncols(),
                approximate.dim()
            )));
        }
        let exact = ExactIndex::new(embeddings, coords, metadata.geotransform)?;
        info!("加载索引 {}：{} 个像素", dir.display(), exact.len());
        Ok(Self { metadata, exact, approximate })
    }

    pub fn get(&self, mode: SearchMode) -> &dyn SimilaritySearch {
        match mode {
            SearchMode::Exact => &self.exact,
            SearchMode::Approximate => &self.approximate,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::raster::{Raster, RasterData};
    use crate::search::SearchQuery;

    fn write_embeddings(dir: &Path, data: Array3<f32>) -> PathBuf {
        let path = dir.join("emb.npy");
        let gt = GeoTransform::north_up(0.0, 10.0, 0.25, 0.25);
        Raster::new(RasterData::F32(data), gt, 10.0).write(&path).unwrap();
        path
    }

    #[test]
    fn test_pixel_coords() {
        let coords = pixel_coords(PixelWindow { x0: 2, y0: 5, x1: 4, y1: 7 });
        assert_eq!(coords, array![[2, 5], [3, 5], [2, 6], [3, 6]]);
    }

    #[test]
    fn test_all_zero_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = write_embeddings(dir.path(), Array3::zeros((8, 8, 4)));
        let out = dir.path().join("index");
        let err = IndexBuilder::new().build(&source, &out, "v", 2024).unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
        assert!(IndexArtifacts::load(&out).unwrap_err().is_not_found());
    }

    #[test]
    fn test_build_clip_and_load() {
        let dir = TempDir::new().unwrap();
        let data = Array3::from_shape_fn((20, 20, 4), |(y, x, b)| (y * 20 + x) as f32 + b as f32 * 0.5);
        let source = write_embeddings(dir.path(), data.clone());
        let out = dir.path().join("index");

        // 经度 1.25 ~ 3.75，纬度 7.5 ~ 8.75 对应像素 x 5..15，y 5..10
        let bbox = BoundingBox::new(1.25, 7.5, 3.75, 8.75);
        let meta = IndexBuilder::new().step(2).bbox(Some(bbox)).build(&source, &out, "v", 2024).unwrap();
        assert_eq!(meta.window, [5, 5, 15, 10]);
        assert_eq!(meta.total_pixels, 50);
        assert_eq!(meta.sampled_pixels, 15);
        assert_eq!(meta.bbox, bbox);
        assert!(IndexArtifacts::missing(&out).is_empty());

        let artifacts = IndexArtifacts::load(&out).unwrap();
        assert_eq!(artifacts.exact.len(), 50);
        assert_eq!(artifacts.approximate.len(), 15);

        let query = data.slice(s![7, 9, ..]).to_vec();
        let r = artifacts.get(SearchMode::Exact).search(&query, &SearchQuery::new(0.0)).unwrap();
        assert_eq!(r.matches.len(), 1);
        assert_eq!((r.matches[0].pixel.x, r.matches[0].pixel.y), (9, 7));

        // 缺少任意一个产物都视为整组缺失
        fs::remove_file(out.join(COORDS_FILE)).unwrap();
        assert!(IndexArtifacts::load(&out).unwrap_err().is_not_found());
    }

    #[test]
    fn test_bbox_outside_raster() {
        let dir = TempDir::new().unwrap();
        let source = write_embeddings(dir.path(), Array3::ones((8, 8, 2)));
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let err = IndexBuilder::new().bbox(Some(bbox)).build(&source, dir.path().join("i"), "v", 2024);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = IndexBuilder::new().build(dir.path().join("none.npy"), dir.path(), "v", 2024).unwrap_err();
        assert!(err.is_not_found());
    }
}
