use std::fs;
use std::path::Path;

use log::info;
use ndarray::prelude::*;

use super::{LevelMetadata, PyramidMetadata, check_source, level_file, load_cached};
use crate::error::{Error, Result};
use crate::raster::{Raster, RasterData};
use crate::utils::{remove_if_exists, write_json};

pub const COARSENED_METADATA: &str = "coarsened_metadata.json";

/// 2x2 均值池化，奇数尺寸时丢弃最后一行 / 列
pub fn mean_pool_2x2(data: ArrayView3<f32>) -> Array3<f32> {
    let (h, w, _) = data.dim();
    let (h2, w2) = (h / 2, w / 2);
    let quad = |dy: usize, dx: usize| data.slice_move(s![dy..2 * h2;2, dx..2 * w2;2, ..]);
    let mut out = quad(0, 0).to_owned();
    out += &quad(0, 1);
    out += &quad(1, 0);
    out += &quad(1, 1);
    out *= 0.25;
    out
}

/// 嵌入金字塔构建器，每层尺寸减半，不再放大
#[derive(Debug, Clone)]
pub struct CoarsenedBuilder {
    num_levels: usize,
}

impl CoarsenedBuilder {
    pub fn new(num_levels: usize) -> Self {
        Self { num_levels }
    }

    pub fn build(
        &self,
        source: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
    ) -> Result<PyramidMetadata> {
        let (source, output_dir) = (source.as_ref(), output_dir.as_ref());
        let source_mtime = check_source(source, self.num_levels)?;

        if let Some(meta) = load_cached(output_dir, COARSENED_METADATA, source_mtime, self.num_levels, None)? {
            info!("嵌入金字塔缓存有效，跳过构建：{}", output_dir.display());
            return Ok(meta);
        }

        let raster = Raster::read(source)?;
        let shrink = 1 << (self.num_levels - 1);
        if raster.meta.width < shrink || raster.meta.height < shrink {
            return Err(Error::config(format!(
                "{}x{} 的栅格无法生成 {} 层嵌入金字塔",
                raster.meta.width, raster.meta.height, self.num_levels
            )));
        }
        let data = match raster.data {
            RasterData::F32(a) => a,
            RasterData::U8(a) => a.mapv(f32::from),
        };

        fs::create_dir_all(output_dir)?;
        remove_if_exists(output_dir.join(COARSENED_METADATA))?;

        let gsd = raster.meta.gsd;
        let mut meta = PyramidMetadata::new(source, source_mtime, gsd, None);
        let mut level = Raster::new(RasterData::F32(data), raster.meta.transform, gsd);
        for k in 0..self.num_levels {
            if k > 0 {
                let RasterData::F32(prev) = &level.data else {
                    return Err(Error::integrity("嵌入金字塔层级必须为浮点数据"));
                };
                let pooled = mean_pool_2x2(prev.view());
                let transform = level.meta.transform.scale(2.0, 2.0);
                level = Raster::new(RasterData::F32(pooled), transform, level.meta.gsd * 2.0);
            }
            let size = level.write(output_dir.join(level_file(k)))?;
            info!(
                "嵌入第 {k} 层：{}x{}x{} @ {:.1}m/像素",
                level.meta.width, level.meta.height, level.meta.bands, level.meta.gsd
            );
            meta.levels.push(LevelMetadata::new(k, &level, None, size));
        }

        write_json(output_dir.join(COARSENED_METADATA), &meta)?;
        Ok(meta)
    }
}
