use image::GrayImage;
use image::imageops::{self, FilterType};
use ndarray::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 层级使用的重采样核
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    /// 最近邻，保留每个像素 / 嵌入单元的清晰边界
    Nearest,
    /// Lanczos3，低缩放级别下视觉效果更平滑
    Lanczos,
}

impl Resampling {
    /// 前 `nearest_levels` 层使用最近邻，之后使用 Lanczos
    pub fn for_level(level: usize, nearest_levels: usize) -> Self {
        if level < nearest_levels { Self::Nearest } else { Self::Lanczos }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nearest => "nearest",
            Self::Lanczos => "lanczos",
        }
    }

    fn filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// 对 `(height, width, bands)` 的 u8 数组逐波段缩放
pub fn resize_u8(
    data: ArrayView3<u8>,
    width: usize,
    height: usize,
    resampling: Resampling,
) -> Result<Array3<u8>> {
    let (h, w, bands) = data.dim();
    if (h, w) == (height, width) {
        return Ok(data.to_owned());
    }
    if width == 0 || height == 0 || w == 0 || h == 0 {
        return Err(Error::config(format!("无法将 {w}x{h} 缩放到 {width}x{height}")));
    }

    let resized = (0..bands)
        .into_par_iter()
        .map(|b| {
            let band = data.index_axis(Axis(2), b).iter().copied().collect::<Vec<_>>();
            let img = GrayImage::from_raw(w as u32, h as u32, band)
                .ok_or_else(|| Error::Computation(format!("第 {b} 波段尺寸异常")))?;
            let out = imageops::resize(&img, width as u32, height as u32, resampling.filter());
            Ok(Array2::from_shape_vec((height, width), out.into_raw())?)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut output = Array3::zeros((height, width, bands));
    for (b, band) in resized.into_iter().enumerate() {
        output.index_axis_mut(Axis(2), b).assign(&band);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_level() {
        assert_eq!(Resampling::for_level(0, 3), Resampling::Nearest);
        assert_eq!(Resampling::for_level(2, 3), Resampling::Nearest);
        assert_eq!(Resampling::for_level(3, 3), Resampling::Lanczos);
        assert_eq!(Resampling::for_level(0, 0), Resampling::Lanczos);
    }

    #[test]
    fn test_nearest_upscale_keeps_blocks() {
        let data = Array3::from_shape_fn((2, 2, 2), |(y, x, b)| (y * 2 + x) as u8 * 10 + b as u8);
        let out = resize_u8(data.view(), 4, 4, Resampling::Nearest).unwrap();
        assert_eq!(out.dim(), (4, 4, 2));
        assert_eq!(out[[0, 0, 0]], 0);
        assert_eq!(out[[1, 1, 0]], 0);
        assert_eq!(out[[0, 3, 0]], 10);
        assert_eq!(out[[3, 0, 1]], 21);
        assert_eq!(out[[3, 3, 1]], 31);
    }

    #[test]
    fn test_constant_survives_lanczos() {
        let data = Array3::from_elem((8, 8, 3), 77u8);
        let out = resize_u8(data.view(), 3, 5, Resampling::Lanczos).unwrap();
        assert_eq!(out.dim(), (5, 3, 3));
        assert!(out.iter().all(|&v| v.abs_diff(77) <= 1));
    }
}
