use std::path::PathBuf;

use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use super::{OutputFormat, SubCommandExtend, print_output, print_pyramid};
use crate::config::{Opts, PyramidOptions};
use crate::pyramid::PyramidBuilder;
use crate::tiles::{is_year_layer, validate_layer_name, validate_viewport};

#[derive(Parser, Debug, Clone)]
pub struct PyramidCommand {
    /// 视口名
    pub viewport: String,
    /// 图层名，例如 2024、satellite、rgb
    pub layer: String,
    /// 源栅格路径，年份图层默认使用该年份的嵌入栅格
    #[arg(short, long, value_name = "PATH")]
    pub source: Option<PathBuf>,
    #[command(flatten)]
    pub pyramid: PyramidOptions,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for PyramidCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        validate_viewport(&self.viewport)?;
        validate_layer_name(&self.layer)?;

        let source = match &self.source {
            Some(path) => path.clone(),
            None if is_year_layer(&self.layer) => {
                opts.data_dir.mosaic(&self.viewport, self.layer.parse()?)
            }
            None => anyhow::bail!("图层 {} 需要通过 --source 指定源文件", self.layer),
        };
        let output = opts.data_dir.pyramid(&self.viewport, &self.layer);
        info!("构建金字塔：{} -> {}", source.display(), output.display());

        let builder = PyramidBuilder::new(self.pyramid.num_levels)
            .output_size(self.pyramid.output_size)
            .nearest_levels(self.pyramid.nearest_levels);
        let meta = block_in_place(|| builder.build(&source, &output, self.pyramid.gsd))?;

        print_output(self.output_format, &meta, print_pyramid)
    }
}
