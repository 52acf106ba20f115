//! 坐标换算工具
//!
//! 所有组件共用这里的瓦片 / 像素 / 经纬度换算，不允许在别处重新实现。

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// 仿射地理变换，参数顺序与 rasterio 的 `Affine` 一致：
///
/// ```text
/// lon = c + a * px + b * py
/// lat = f + d * px + e * py
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    /// 像素宽度
    pub a: f64,
    /// 行旋转
    pub b: f64,
    /// 左上角经度
    pub c: f64,
    /// 列旋转
    pub d: f64,
    /// 像素高度，北向上的栅格为负数
    pub e: f64,
    /// 左上角纬度
    pub f: f64,
}

impl GeoTransform {
    /// 北向上、无旋转的变换
    pub fn north_up(lon_origin: f64, lat_origin: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self { a: pixel_width, b: 0.0, c: lon_origin, d: 0.0, e: -pixel_height, f: lat_origin }
    }

    /// 使栅格恰好覆盖 `bbox` 的变换
    pub fn from_bounds(bbox: &BoundingBox, width: usize, height: usize) -> Self {
        Self::north_up(
            bbox.min_lon,
            bbox.max_lat,
            (bbox.max_lon - bbox.min_lon) / width as f64,
            (bbox.max_lat - bbox.min_lat) / height as f64,
        )
    }

    /// 按像素缩放，等价于 `transform * Affine::scale(sx, sy)`
    ///
    /// 当像素数量按 1/sx、1/sy 变化时，地理范围保持不变。
    pub fn scale(&self, sx: f64, sy: f64) -> Self {
        Self {
            a: self.a * sx,
            b: self.b * sy,
            c: self.c,
            d: self.d * sx,
            e: self.e * sy,
            f: self.f,
        }
    }

    /// 行列式为 0 时无法求逆
    pub fn is_invertible(&self) -> bool {
        (self.a * self.e - self.b * self.d).abs() > f64::EPSILON * f64::EPSILON
    }

    /// `width x height` 栅格四个角点的外接矩形
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let (w, h) = (width as f64, height as f64);
        let corners = [
            pixel_to_lonlat(0.0, 0.0, self),
            pixel_to_lonlat(w, 0.0, self),
            pixel_to_lonlat(0.0, h, self),
            pixel_to_lonlat(w, h, self),
        ];
        let mut bbox = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for (lon, lat) in corners {
            bbox.min_lon = bbox.min_lon.min(lon);
            bbox.min_lat = bbox.min_lat.min(lat);
            bbox.max_lon = bbox.max_lon.max(lon);
            bbox.max_lat = bbox.max_lat.max(lat);
        }
        bbox
    }
}

/// EPSG:4326 下的经纬度范围
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, min_lat, max_lon, max_lat }
    }

    /// `[min_lon, min_lat, max_lon, max_lat]`
    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }

    /// 中心点，格式为 `[lat, lon]`
    pub fn center(&self) -> [f64; 2] {
        [(self.min_lat + self.max_lat) / 2.0, (self.min_lon + self.max_lon) / 2.0]
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

/// Web Mercator 瓦片 (x, y, z) 对应的 EPSG:4326 经纬度范围
pub fn tile_to_bbox(x: u32, y: u32, z: u32) -> BoundingBox {
    let n = 2f64.powi(z as i32);
    let lon = |x: f64| x / n * 360.0 - 180.0;
    let lat = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    let (x, y) = (x as f64, y as f64);
    BoundingBox::new(lon(x), lat(y + 1.0), lon(x + 1.0), lat(y))
}

/// 经纬度所在的瓦片坐标，超出范围时夹到边缘瓦片
pub fn lonlat_to_tile(lon: f64, lat: f64, z: u32) -> (u32, u32) {
    let n = 2f64.powi(z as i32);
    let max = n - 1.0;
    let x = ((lon + 180.0) / 360.0 * n).floor().clamp(0.0, max);
    let lat_rad = lat.to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor().clamp(0.0, max);
    (x as u32, y as u32)
}

/// 像素坐标转换为经纬度，返回 `(lon, lat)`
#[inline]
pub fn pixel_to_lonlat(px: f64, py: f64, gt: &GeoTransform) -> (f64, f64) {
    (gt.c + gt.a * px + gt.b * py, gt.f + gt.d * px + gt.e * py)
}

/// 经纬度转换为（浮点）像素坐标，变换不可逆时返回 `None`
#[inline]
pub fn lonlat_to_pixel(lon: f64, lat: f64, gt: &GeoTransform) -> Option<(f64, f64)> {
    if !gt.is_invertible() {
        return None;
    }
    let det = gt.a * gt.e - gt.b * gt.d;
    let (dx, dy) = (lon - gt.c, lat - gt.f);
    Some(((gt.e * dx - gt.b * dy) / det, (gt.a * dy - gt.d * dx) / det))
}

/// 经纬度范围在像素空间中的浮点窗口 `(x0, y0, x1, y1)`，未做任何裁剪
pub fn bbox_to_pixel_window(bbox: &BoundingBox, gt: &GeoTransform) -> Option<(f64, f64, f64, f64)> {
    let corners = [
        lonlat_to_pixel(bbox.min_lon, bbox.min_lat, gt)?,
        lonlat_to_pixel(bbox.min_lon, bbox.max_lat, gt)?,
        lonlat_to_pixel(bbox.max_lon, bbox.min_lat, gt)?,
        lonlat_to_pixel(bbox.max_lon, bbox.max_lat, gt)?,
    ];
    let (mut x0, mut y0, mut x1, mut y1) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for (px, py) in corners {
        x0 = x0.min(px);
        y0 = y0.min(py);
        x1 = x1.max(px);
        y1 = y1.max(py);
    }
    Some((x0, y0, x1, y1))
}
