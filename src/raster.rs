//! 栅格文件读写
//!
//! 一个栅格由两个文件组成：
//! - `<stem>.npy`：C 顺序的 `(height, width, bands)` 数组，视觉栅格为 `u8`，嵌入栅格为 `f32`
//! - `<stem>.json`：[`RasterMeta`]，记录仿射变换、尺寸、波段数等信息
//!
//! 读取瓦片时使用 mmap 只访问需要的窗口，不会把整个文件读入内存。

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use ndarray::prelude::*;
use ndarray_npy::{ViewNpyExt, read_npy, write_npy};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geo::{BoundingBox, GeoTransform, bbox_to_pixel_window, lonlat_to_pixel, pixel_to_lonlat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Float32,
}

fn default_crs() -> String {
    "EPSG:4326".to_string()
}

/// 栅格元数据，保存在与 `.npy` 同名的 `.json` 文件中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterMeta {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub dtype: DType,
    /// 地面采样距离，单位为米
    pub gsd: f64,
    #[serde(default = "default_crs")]
    pub crs: String,
}

/// 栅格数据文件对应的元数据文件路径
pub fn sidecar_path(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref().with_extension("json")
}

impl RasterMeta {
    /// 读取 `path` 对应的元数据文件
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let sidecar = sidecar_path(path);
        if !sidecar.exists() {
            return Err(Error::not_found(format!("栅格元数据 {}", sidecar.display())));
        }
        Ok(serde_json::from_slice(&fs::read(&sidecar)?)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(sidecar_path(path), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn bounds(&self) -> BoundingBox {
        self.transform.bounds(self.width, self.height)
    }

    /// 像素窗口的地理范围
    pub fn window_bounds(&self, win: PixelWindow) -> BoundingBox {
        let (lon, lat) = pixel_to_lonlat(win.x0 as f64, win.y0 as f64, &self.transform);
        let sub = GeoTransform { c: lon, f: lat, ..self.transform };
        sub.bounds(win.width(), win.height())
    }

    pub fn full_window(&self) -> PixelWindow {
        PixelWindow { x0: 0, y0: 0, x1: self.width, y1: self.height }
    }

    /// 将经纬度范围转换为像素窗口并裁剪到栅格范围内，没有交集时返回 `None`
    pub fn window_for_bbox(&self, bbox: &BoundingBox) -> Option<PixelWindow> {
        let (x0, y0, x1, y1) = bbox_to_pixel_window(bbox, &self.transform)?;
        let clamp = |v: f64, max: usize| v.clamp(0.0, max as f64) as usize;
        let window = PixelWindow {
            x0: clamp(x0.floor(), self.width),
            y0: clamp(y0.floor(), self.height),
            x1: clamp(x1.ceil(), self.width),
            y1: clamp(y1.ceil(), self.height),
        };
        (!window.is_empty()).then_some(window)
    }

    fn check_shape(&self, shape: &[usize], dtype: DType) -> Result<()> {
        if shape != [self.height, self.width, self.bands] || dtype != self.dtype {
            return Err(Error::integrity(format!(
                "栅格数据 {:?}/{:?} 与元数据 {:?}/{:?} 不一致",
                shape,
                dtype,
                [self.height, self.width, self.bands],
                self.dtype
            )));
        }
        Ok(())
    }
}

/// 半开区间的像素窗口 `[x0, x1) x [y0, y1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl PixelWindow {
    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn len(&self) -> usize {
        self.width() * self.height()
    }
}

/// 内存中的栅格像素
#[derive(Debug, Clone, PartialEq)]
pub enum RasterData {
    U8(Array3<u8>),
    F32(Array3<f32>),
}

impl RasterData {
    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::Uint8,
            Self::F32(_) => DType::Float32,
        }
    }

    /// `(height, width, bands)`
    pub fn dim(&self) -> (usize, usize, usize) {
        match self {
            Self::U8(a) => a.dim(),
            Self::F32(a) => a.dim(),
        }
    }
}

/// 完整读入内存的栅格
#[derive(Debug, Clone)]
pub struct Raster {
    pub meta: RasterMeta,
    pub data: RasterData,
}

impl Raster {
    pub fn new(data: RasterData, transform: GeoTransform, gsd: f64) -> Self {
        let (height, width, bands) = data.dim();
        let meta = RasterMeta {
            transform,
            width,
            height,
            bands,
            dtype: data.dtype(),
            gsd,
            crs: default_crs(),
        };
        Self { meta, data }
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::not_found(format!("栅格文件 {}", path.display())));
        }
        let meta = RasterMeta::load(path)?;
        let data = match meta.dtype {
            DType::Uint8 => RasterData::U8(read_npy(path)?),
            DType::Float32 => RasterData::F32(read_npy(path)?),
        };
        let (h, w, b) = data.dim();
        meta.check_shape(&[h, w, b], data.dtype())?;
        Ok(Self { meta, data })
    }

    /// 写入数据文件和元数据文件，返回数据文件的字节数
    pub fn write(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        match &self.data {
            RasterData::U8(a) => write_npy(path, a)?,
            RasterData::F32(a) => write_npy(path, a)?,
        }
        self.meta.save(path)?;
        let size = fs::metadata(path)?.len();
        debug!("写入栅格 {} ({} 字节)", path.display(), size);
        Ok(size)
    }
}

/// 基于 mmap 的只读栅格
pub struct RasterView {
    meta: RasterMeta,
    mmap: Mmap,
    path: PathBuf,
}

impl RasterView {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::not_found(format!("栅格文件 {}", path.display())));
        }
        let meta = RasterMeta::load(path)?;
        let file = File::open(path)?;
        // 文件在构建完成后只读，不会被并发修改
        let mmap = unsafe { Mmap::map(&file)? };
        let view = Self { meta, mmap, path: path.to_path_buf() };
        match view.meta.dtype {
            DType::Uint8 => view.meta.check_shape(view.view_u8()?.shape(), DType::Uint8)?,
            DType::Float32 => view.meta.check_shape(view.view_f32()?.shape(), DType::Float32)?,
        }
        Ok(view)
    }

    pub fn meta(&self) -> &RasterMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn view_u8(&self) -> Result<ArrayView3<'_, u8>> {
        Ok(ArrayView3::<u8>::view_npy(&self.mmap)?)
    }

    fn view_f32(&self) -> Result<ArrayView3<'_, f32>> {
        Ok(ArrayView3::<f32>::view_npy(&self.mmap)?)
    }

    /// 只读取并复制窗口内的像素
    pub fn read_window(&self, win: PixelWindow) -> Result<RasterData> {
        if win.x1 > self.meta.width || win.y1 > self.meta.height || win.is_empty() {
            return Err(Error::config(format!(
                "窗口 {:?} 超出栅格范围 {}x{}",
                win, self.meta.width, self.meta.height
            )));
        }
        let slice = s![win.y0..win.y1, win.x0..win.x1, ..];
        Ok(match self.meta.dtype {
            DType::Uint8 => RasterData::U8(self.view_u8()?.slice(slice).to_owned()),
            DType::Float32 => RasterData::F32(self.view_f32()?.slice(slice).to_owned()),
        })
    }

    /// 读取窗口内的全部像素向量，返回 `(像素数, 波段数)` 的 f32 矩阵，按行优先排列
    pub fn read_vectors(&self, win: PixelWindow) -> Result<Array2<f32>> {
        let bands = self.meta.bands;
        let data = match self.read_window(win)? {
            RasterData::F32(a) => a,
            RasterData::U8(a) => a.mapv(f32::from),
        };
        Ok(data.into_shape_with_order((win.len(), bands))?)
    }

    /// 读取经纬度所在像素的嵌入向量，返回向量和像素坐标
    pub fn sample_lonlat(&self, lon: f64, lat: f64) -> Result<(Vec<f32>, (usize, usize))> {
        let (px, py) = lonlat_to_pixel(lon, lat, &self.meta.transform)
            .ok_or_else(|| Error::integrity("地理变换不可逆"))?;
        if !(0.0..self.meta.width as f64).contains(&px)
            || !(0.0..self.meta.height as f64).contains(&py)
        {
            return Err(Error::config(format!("坐标 ({lat}, {lon}) 超出栅格范围")));
        }
        let (x, y) = (px as usize, py as usize);
        let win = PixelWindow { x0: x, y0: y, x1: x + 1, y1: y + 1 };
        let v = self.read_vectors(win)?;
        Ok((v.row(0).to_vec(), (x, y)))
    }
}

/// 使用 2% / 98% 分位数把一个波段拉伸到 0..=255，忽略 NaN
fn normalize_band(band: ArrayView2<f32>) -> Array2<u8> {
    let mut valid = band.iter().copied().filter(|v| !v.is_nan()).collect::<Vec<_>>();
    if valid.is_empty() {
        return Array2::zeros(band.dim());
    }
    valid.par_sort_unstable_by(|a, b| a.total_cmp(b));
    let (p2, p98) = (percentile(&valid, 2.0), percentile(&valid, 98.0));
    band.mapv(|v| {
        let scaled = if p98 > p2 { (v - p2) / (p98 - p2) * 255.0 } else { v * 255.0 };
        if scaled.is_nan() { 0 } else { scaled.clamp(0.0, 255.0) as u8 }
    })
}

/// 对已排序的数据做线性插值分位数，与 numpy 的默认行为一致
fn percentile(sorted: &[f32], q: f32) -> f32 {
    let pos = q / 100.0 * (sorted.len() - 1) as f32;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32)
}

/// 从嵌入栅格的前三个波段生成 RGB 预览栅格
///
/// 波段不足三个时补零；`u8` 栅格直接截取 / 补齐波段。
pub fn extract_rgb(raster: &Raster) -> Raster {
    let (h, w, bands) = raster.data.dim();
    let mut rgb = Array3::<u8>::zeros((h, w, 3));
    match &raster.data {
        RasterData::F32(a) => {
            let normalized = (0..bands.min(3))
                .into_par_iter()
                .map(|b| normalize_band(a.index_axis(Axis(2), b)))
                .collect::<Vec<_>>();
            for (b, band) in normalized.into_iter().enumerate() {
                rgb.index_axis_mut(Axis(2), b).assign(&band);
            }
        }
        RasterData::U8(a) => {
            for b in 0..bands.min(3) {
                rgb.index_axis_mut(Axis(2), b).assign(&a.index_axis(Axis(2), b));
            }
        }
    }
    Raster::new(RasterData::U8(rgb), raster.meta.transform, raster.meta.gsd)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn gradient_raster() -> Raster {
        let data = Array3::from_shape_fn((4, 6, 2), |(y, x, b)| (y * 10 + x + b * 100) as f32);
        Raster::new(RasterData::F32(data), GeoTransform::north_up(10.0, 20.0, 1.0, 1.0), 10.0)
    }

    #[test]
    fn test_write_then_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grid.npy");
        gradient_raster().write(&path).unwrap();

        let view = RasterView::open(&path).unwrap();
        assert_eq!(view.meta().width, 6);
        let win = PixelWindow { x0: 2, y0: 1, x1: 5, y1: 3 };
        match view.read_window(win).unwrap() {
            RasterData::F32(a) => {
                assert_eq!(a.dim(), (2, 3, 2));
                assert_eq!(a[[0, 0, 0]], 12.0);
                assert_eq!(a[[1, 2, 1]], 124.0);
            }
            other => panic!("unexpected dtype {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_mismatched_sidecar_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grid.npy");
        let raster = gradient_raster();
        raster.write(&path).unwrap();
        let mut meta = raster.meta.clone();
        meta.bands = 3;
        meta.save(&path).unwrap();
        assert!(matches!(RasterView::open(&path), Err(Error::DataIntegrity(_))));
        assert!(matches!(Raster::read(&path), Err(Error::DataIntegrity(_))));
    }

    #[test]
    fn test_missing_raster() {
        let dir = TempDir::new().unwrap();
        let err = RasterView::open(dir.path().join("nope.npy")).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_window_for_bbox_clamps() {
        let meta = gradient_raster().meta;
        // 栅格范围：经度 10..16，纬度 16..20
        let win = meta.window_for_bbox(&BoundingBox::new(12.5, 0.0, 100.0, 19.5)).unwrap();
        assert_eq!(win, PixelWindow { x0: 2, y0: 0, x1: 6, y1: 4 });
        assert!(meta.window_for_bbox(&BoundingBox::new(50.0, 50.0, 60.0, 60.0)).is_none());
    }

    #[test]
    fn test_sample_lonlat() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grid.npy");
        gradient_raster().write(&path).unwrap();
        let view = RasterView::open(&path).unwrap();

        let (v, pixel) = view.sample_lonlat(13.5, 18.5).unwrap();
        assert_eq!(pixel, (3, 1));
        assert_eq!(v, vec![13.0, 113.0]);
        assert!(matches!(view.sample_lonlat(0.0, 0.0), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_extract_rgb_pads_and_normalizes() {
        let rgb = extract_rgb(&gradient_raster());
        assert_eq!(rgb.meta.bands, 3);
        assert_eq!(rgb.meta.dtype, DType::Uint8);
        let RasterData::U8(a) = &rgb.data else { panic!("expected u8") };
        // 第三个波段不存在，补零
        assert!(a.index_axis(Axis(2), 2).iter().all(|&v| v == 0));
        // 拉伸后最小值为 0，最大值为 255
        assert_eq!(a[[0, 0, 0]], 0);
        assert_eq!(a[[3, 5, 0]], 255);
    }

    #[test]
    fn test_percentile_matches_numpy() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 50.0), 3.0);
        assert!((percentile(&v, 2.0) - 1.08).abs() < 1e-6);
    }
}
