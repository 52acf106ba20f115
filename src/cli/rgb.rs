use std::path::PathBuf;

use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use super::{SubCommandExtend, print_pyramid};
use crate::config::{Opts, PyramidOptions};
use crate::pyramid::PyramidBuilder;
use crate::raster::{Raster, extract_rgb};
use crate::tiles::validate_viewport;

/// RGB 预览对应的图层名
const RGB_LAYER: &str = "rgb";

#[derive(Parser, Debug, Clone)]
pub struct RgbCommand {
    /// 视口名
    pub viewport: String,
    /// 嵌入年份
    pub year: u16,
    /// 输出路径，默认写入数据目录的 mosaics 下
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// 同时为 rgb 图层构建金字塔
    #[arg(long)]
    pub pyramid: bool,
    #[command(flatten)]
    pub pyramid_opts: PyramidOptions,
}

impl SubCommandExtend for RgbCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        validate_viewport(&self.viewport)?;
        let source = opts.data_dir.mosaic(&self.viewport, self.year);
        let output = self.output.clone().unwrap_or_else(|| opts.data_dir.rgb_mosaic(&self.viewport, self.year));

        let size = block_in_place(|| -> crate::Result<u64> {
            let raster = Raster::read(&source)?;
            let (h, w, bands) = raster.data.dim();
            info!("从 {} 提取 RGB：{w}x{h}，{bands} 个波段", source.display());
            extract_rgb(&raster).write(&output)
        })?;
        println!("{}\t{size}", output.display());

        if self.pyramid {
            let dir = opts.data_dir.pyramid(&self.viewport, RGB_LAYER);
            let builder = PyramidBuilder::new(self.pyramid_opts.num_levels)
                .output_size(self.pyramid_opts.output_size)
                .nearest_levels(self.pyramid_opts.nearest_levels);
            let meta = block_in_place(|| builder.build(&output, &dir, self.pyramid_opts.gsd))?;
            print_pyramid(&meta);
        }
        Ok(())
    }
}
