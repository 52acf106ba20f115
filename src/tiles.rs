//! 瓦片服务
//!
//! 根据 `(z, x, y)` 选择金字塔层级，只读取与瓦片相交的窗口，缩放后编码为 PNG。
//! 文件缺失或读取失败时返回全透明瓦片，渲染永远不会失败。

use std::collections::BTreeMap;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, RgbaImage};
use log::{debug, warn};
use lru::LruCache;
use ndarray::prelude::*;
use regex::Regex;
use serde::Serialize;
use utoipa::ToSchema;
use walkdir::WalkDir;

use crate::config::TileOptions;
use crate::error::{Error, Result};
use crate::geo::{BoundingBox, bbox_to_pixel_window, tile_to_bbox};
use crate::metrics;
use crate::pyramid::level_file;
use crate::raster::{RasterData, RasterMeta, RasterView};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("failed to build regex"));
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}$").expect("failed to build regex"));

pub const MAX_ZOOM: u32 = 30;

/// 视口名只允许字母、数字、下划线和连字符
pub fn validate_viewport(viewport: &str) -> Result<()> {
    if !NAME_RE.is_match(viewport) {
        return Err(Error::config(format!("非法的视口名: {viewport:?}")));
    }
    Ok(())
}

/// 构建金字塔时的图层名，规则与视口名相同
pub fn validate_layer_name(layer: &str) -> Result<()> {
    if !NAME_RE.is_match(layer) {
        return Err(Error::config(format!("非法的图层名: {layer:?}")));
    }
    Ok(())
}

/// 年份图层名必须为四位数字
pub fn is_year_layer(layer: &str) -> bool {
    YEAR_RE.is_match(layer)
}

/// 图层的地理范围
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TileBounds {
    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub bounds: [f64; 4],
    /// `[lat, lon]`
    pub center: [f64; 2],
}

pub struct TileServer {
    root: PathBuf,
    opts: TileOptions,
    cache: Mutex<LruCache<(String, String, usize), PathBuf>>,
    placeholder: Vec<u8>,
}

impl TileServer {
    /// `root` 为金字塔根目录，结构为 `<root>/<viewport>/<layer>/level_<k>.npy`
    pub fn new(root: impl Into<PathBuf>, opts: TileOptions) -> Result<Self> {
        if opts.tile_size == 0 {
            return Err(Error::config("瓦片尺寸不能为 0"));
        }
        let capacity = NonZeroUsize::new(opts.path_cache).unwrap_or(NonZeroUsize::MIN);
        let placeholder = encode_png(DynamicImage::ImageRgba8(RgbaImage::new(
            opts.tile_size,
            opts.tile_size,
        )))?;
        Ok(Self { root: root.into(), opts, cache: Mutex::new(LruCache::new(capacity)), placeholder })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 全透明的占位瓦片
    pub fn transparent_tile(&self) -> &[u8] {
        &self.placeholder
    }

    /// 检查视口和图层名，防止路径穿越
    pub fn validate(&self, viewport: &str, layer: &str) -> Result<()> {
        validate_viewport(viewport)?;
        if !is_year_layer(layer) && !self.opts.layers.iter().any(|l| l == layer) {
            return Err(Error::config(format!("非法的图层名: {layer:?}")));
        }
        Ok(())
    }

    /// 每两级缩放对应一层金字塔，年份图层与命名图层的基准缩放级别不同
    pub fn zoom_to_level(&self, layer: &str, z: u32) -> usize {
        let base = if is_year_layer(layer) { self.opts.year_base_zoom } else { self.opts.rgb_base_zoom };
        let z = z as i64 + self.opts.zoom_offset as i64;
        let level = (base as i64 - z).div_euclid(2);
        level.clamp(0, self.opts.max_level as i64) as usize
    }

    /// 解析层级文件路径，只缓存存在的文件
    fn level_path(&self, viewport: &str, layer: &str, level: usize) -> Option<PathBuf> {
        let key = (viewport.to_string(), layer.to_string(), level);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(path) = cache.get(&key) {
                return Some(path.clone());
            }
        }
        let path = self.root.join(viewport).join(layer).join(level_file(level));
        if !path.exists() {
            return None;
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, path.clone());
        }
        Some(path)
    }

    /// 获取一张瓦片
    ///
    /// 只有非法的参数会返回错误，其余情况最差返回透明瓦片。
    pub fn get_tile(&self, viewport: &str, layer: &str, z: u32, x: u32, y: u32) -> Result<Vec<u8>> {
        self.validate(viewport, layer)?;
        if z > MAX_ZOOM {
            return Err(Error::config(format!("缩放级别 {z} 超过 {MAX_ZOOM}")));
        }

        let level = self.zoom_to_level(layer, z);
        let Some(path) = self.level_path(viewport, layer, level) else {
            debug!("{viewport}/{layer} 不存在第 {level} 层，返回透明瓦片");
            metrics::inc_tile("missing");
            return Ok(self.placeholder.clone());
        };

        let bbox = tile_to_bbox(x, y, z);
        match self.render(&path, &bbox) {
            Ok(Some(png)) => {
                metrics::inc_tile("ok");
                Ok(png)
            }
            Ok(None) => {
                metrics::inc_tile("empty");
                Ok(self.placeholder.clone())
            }
            Err(e) => {
                warn!("渲染瓦片 {viewport}/{layer}/{z}/{x}/{y} 失败: {e}");
                metrics::inc_tile("error");
                Ok(self.placeholder.clone())
            }
        }
    }

    /// 渲染 `bbox` 范围，与栅格没有交集时返回 `None`
    fn render(&self, path: &Path, bbox: &BoundingBox) -> Result<Option<Vec<u8>>> {
        let view = RasterView::open(path)?;
        let meta = view.meta();
        let (fx0, fy0, fx1, fy1) = bbox_to_pixel_window(bbox, &meta.transform)
            .ok_or_else(|| Error::integrity(format!("{} 的地理变换不可逆", path.display())))?;
        let Some(win) = meta.window_for_bbox(bbox) else {
            return Ok(None);
        };

        let rgb = to_rgb8(view.read_window(win)?);

        // 每个输出像素反算回源像素，窗口外的部分保持为 0
        let size = self.opts.tile_size;
        let cols = sample_indices(fx0, fx1, size, win.x0, win.x1);
        let rows = sample_indices(fy0, fy1, size, win.y0, win.y1);
        let mut tile = RgbImage::new(size, size);
        for (ty, row) in rows.iter().enumerate() {
            let Some(r) = *row else { continue };
            for (tx, col) in cols.iter().enumerate() {
                let Some(c) = *col else { continue };
                let p = [rgb[[r, c, 0]], rgb[[r, c, 1]], rgb[[r, c, 2]]];
                tile.put_pixel(tx as u32, ty as u32, Rgb(p));
            }
        }

        Ok(Some(encode_png(DynamicImage::ImageRgb8(tile))?))
    }

    /// 读取第 0 层的地理范围
    pub fn bounds(&self, viewport: &str, layer: &str) -> Result<TileBounds> {
        self.validate(viewport, layer)?;
        let path = self.root.join(viewport).join(layer).join(level_file(0));
        if !path.exists() {
            return Err(Error::not_found(format!("{viewport}/{layer} 的金字塔")));
        }
        let bbox = RasterMeta::load(&path)?.bounds();
        Ok(TileBounds { bounds: bbox.to_array(), center: bbox.center() })
    }

    /// 每个视口下存在第 0 层的图层
    pub fn available_layers(&self) -> BTreeMap<String, Vec<String>> {
        let mut layers = BTreeMap::<String, Vec<String>>::new();
        let level0 = level_file(0);
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3).sort_by_file_name() {
            let Ok(entry) = entry else { continue };
            if entry.file_name().to_string_lossy() != level0 {
                continue;
            }
            let layer_dir = entry.path().parent();
            let viewport_dir = layer_dir.and_then(Path::parent);
            if let (Some(layer), Some(viewport)) =
                (layer_dir.and_then(Path::file_name), viewport_dir.and_then(Path::file_name))
            {
                layers
                    .entry(viewport.to_string_lossy().into_owned())
                    .or_default()
                    .push(layer.to_string_lossy().into_owned());
            }
        }
        layers
    }
}

/// 瓦片中第 `i` 个像素中心所在的源像素，相对 `[lo, hi)` 窗口给出，落在窗口外时为 `None`
fn sample_indices(f0: f64, f1: f64, size: u32, lo: usize, hi: usize) -> Vec<Option<usize>> {
    let step = (f1 - f0) / size as f64;
    (0..size)
        .map(|i| {
            let v = (f0 + (i as f64 + 0.5) * step).floor();
            (v >= lo as f64 && v < hi as f64).then(|| v as usize - lo)
        })
        .collect()
}

/// 取前三个波段并转换为 8 位，不足三个波段时补零
fn to_rgb8(data: RasterData) -> Array3<u8> {
    let (h, w, bands) = data.dim();
    let mut rgb = Array3::<u8>::zeros((h, w, 3));
    let n = bands.min(3);
    match data {
        RasterData::U8(a) => rgb.slice_mut(s![.., .., ..n]).assign(&a.slice(s![.., .., ..n])),
        RasterData::F32(a) => {
            let a = a.slice(s![.., .., ..n]);
            let max = a.iter().copied().filter(|v| v.is_finite()).fold(0f32, f32::max);
            let scale = if max > 255.0 { 255.0 / max } else { 1.0 };
            rgb.slice_mut(s![.., .., ..n]).zip_mut_with(&a, |dst, &v| {
                *dst = if v.is_nan() { 0 } else { (v * scale).clamp(0.0, 255.0) as u8 };
            });
        }
    }
    rgb
}

fn encode_png(img: DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use image::GenericImageView;
    use rstest::*;
    use tempfile::TempDir;

    use super::*;
    use crate::geo::GeoTransform;
    use crate::pyramid::PyramidBuilder;
    use crate::raster::Raster;

    struct Fixture {
        _dir: TempDir,
        server: TileServer,
    }

    /// 以 (77.5, 13.0) 为左上角、0.01 度见方、16x16 的红色栅格
    #[fixture]
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src.npy");
        let mut data = Array3::<u8>::zeros((16, 16, 3));
        data.slice_mut(s![.., .., 0]).fill(200);
        let gt = GeoTransform::north_up(77.5, 13.0, 0.01 / 16.0, 0.01 / 16.0);
        Raster::new(RasterData::U8(data), gt, 10.0).write(&source).unwrap();

        let root = dir.path().join("pyramids");
        PyramidBuilder::new(3)
            .output_size(16)
            .build(&source, root.join("bangalore").join("satellite"), 10.0)
            .unwrap();
        let server = TileServer::new(root, TileOptions::default()).unwrap();
        Fixture { _dir: dir, server }
    }

    fn decode(png: &[u8]) -> DynamicImage {
        image::load_from_memory_with_format(png, ImageFormat::Png).unwrap()
    }

    #[rstest]
    #[case("2024", 18, 0)]
    #[case("2024", 17, 0)]
    #[case("2024", 16, 1)]
    #[case("2024", 13, 2)]
    #[case("2024", 10, 4)]
    #[case("2024", 4, 5)]
    #[case("2024", 22, 0)]
    #[case("satellite", 12, 0)]
    #[case("satellite", 11, 0)]
    #[case("rgb", 10, 1)]
    #[case("rgb", 8, 2)]
    #[case("satellite", 2, 5)]
    #[case("satellite", 0, 5)]
    #[case("satellite", 20, 0)]
    fn test_zoom_to_level(fixture: Fixture, #[case] layer: &str, #[case] z: u32, #[case] level: usize) {
        assert_eq!(fixture.server.zoom_to_level(layer, z), level);
    }

    #[test]
    fn test_zoom_offset_shifts_levels() {
        let opts = TileOptions { zoom_offset: -2, ..Default::default() };
        let server = TileServer::new("/nonexistent", opts).unwrap();
        assert_eq!(server.zoom_to_level("2024", 18), 1);
        assert_eq!(server.zoom_to_level("2024", 20), 0);
        assert_eq!(server.zoom_to_level("rgb", 12), 1);
    }

    #[test]
    fn test_base_zoom_is_configurable() {
        let opts = TileOptions { year_base_zoom: 14, rgb_base_zoom: 16, ..Default::default() };
        let server = TileServer::new("/nonexistent", opts).unwrap();
        assert_eq!(server.zoom_to_level("2024", 12), 1);
        assert_eq!(server.zoom_to_level("satellite", 12), 2);
    }

    #[rstest]
    fn test_outside_tile_is_transparent(fixture: Fixture) {
        // 大西洋上的瓦片
        let png = fixture.server.get_tile("bangalore", "satellite", 14, 7000, 6000).unwrap();
        assert_eq!(png, fixture.server.transparent_tile());
        let img = decode(&png);
        assert_eq!(img.dimensions(), (256, 256));
        assert!(img.to_rgba8().pixels().all(|p| p.0[3] == 0));
    }

    #[rstest]
    fn test_missing_pyramid_is_transparent(fixture: Fixture) {
        let png = fixture.server.get_tile("bangalore", "2024", 14, 0, 0).unwrap();
        assert_eq!(png, fixture.server.transparent_tile());
    }

    #[rstest]
    fn test_corrupt_level_is_transparent(fixture: Fixture) {
        let path = fixture.server.root().join("bangalore/satellite/level_0.npy");
        std::fs::write(&path, b"garbage").unwrap();
        let (x, y) = crate::geo::lonlat_to_tile(77.505, 12.995, 14);
        let png = fixture.server.get_tile("bangalore", "satellite", 14, x, y).unwrap();
        assert_eq!(png, fixture.server.transparent_tile());
    }

    #[rstest]
    fn test_inside_tile_renders(fixture: Fixture) {
        let (x, y) = crate::geo::lonlat_to_tile(77.505, 12.995, 14);
        let img = decode(&fixture.server.get_tile("bangalore", "satellite", 14, x, y).unwrap());
        assert_eq!(img.dimensions(), (256, 256));
        let rgb = img.to_rgb8();
        assert!(rgb.pixels().any(|p| p.0 == [200, 0, 0]));
    }

    #[rstest]
    #[case(20)]
    #[case(26)]
    #[case(30)]
    fn test_deep_zoom_tile(fixture: Fixture, #[case] z: u32) {
        // 一个源像素覆盖成千上万张瓦片
        let (x, y) = crate::geo::lonlat_to_tile(77.505, 12.995, z);
        let start = std::time::Instant::now();
        let img = decode(&fixture.server.get_tile("bangalore", "satellite", z, x, y).unwrap());
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(img.dimensions(), (256, 256));
        assert!(img.to_rgb8().pixels().all(|p| p.0 == [200, 0, 0]));
    }

    #[test]
    fn test_sample_indices() {
        // 瓦片跨越源像素 [1.5, 3.5)，窗口为 [1, 3)
        let idx = sample_indices(1.5, 3.5, 4, 1, 3);
        assert_eq!(idx, vec![Some(0), Some(1), Some(1), None]);
        // 瓦片落在同一个源像素内
        let idx = sample_indices(2.25, 2.5, 8, 2, 3);
        assert!(idx.iter().all(|&i| i == Some(0)));
    }

    #[rstest]
    #[case("../etc", "satellite")]
    #[case("bangalore", "../../passwd")]
    #[case("bangalore", "20245")]
    #[case("bangalore", "pca")]
    #[case("", "2024")]
    fn test_invalid_identifiers(fixture: Fixture, #[case] viewport: &str, #[case] layer: &str) {
        let err = fixture.server.get_tile(viewport, layer, 10, 0, 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[rstest]
    fn test_zoom_too_large(fixture: Fixture) {
        let err = fixture.server.get_tile("bangalore", "satellite", 31, 0, 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[rstest]
    fn test_bounds(fixture: Fixture) {
        let b = fixture.server.bounds("bangalore", "satellite").unwrap();
        assert!((b.bounds[0] - 77.5).abs() < 1e-9);
        assert!((b.bounds[3] - 13.0).abs() < 1e-9);
        assert!((b.center[0] - 12.995).abs() < 1e-9);
        assert!((b.center[1] - 77.505).abs() < 1e-9);
        assert!(fixture.server.bounds("bangalore", "2023").unwrap_err().is_not_found());
    }

    #[rstest]
    fn test_available_layers(fixture: Fixture) {
        let layers = fixture.server.available_layers();
        assert_eq!(layers.get("bangalore"), Some(&vec!["satellite".to_string()]));
    }

    #[test]
    fn test_to_rgb8_scales_floats() {
        let data = Array3::from_shape_vec((1, 2, 1), vec![510.0f32, f32::NAN]).unwrap();
        let rgb = to_rgb8(RasterData::F32(data));
        assert_eq!(rgb.dim(), (1, 2, 3));
        assert_eq!(rgb[[0, 0, 0]], 255);
        assert_eq!(rgb[[0, 1, 0]], 0);
        assert_eq!(rgb[[0, 0, 1]], 0);
    }
}
