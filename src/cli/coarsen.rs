use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use super::{OutputFormat, SubCommandExtend, print_output, print_pyramid};
use crate::config::Opts;
use crate::pyramid::{CoarsenedBuilder, MAX_LEVELS};
use crate::tiles::validate_viewport;

#[derive(Parser, Debug, Clone)]
pub struct CoarsenCommand {
    /// 视口名
    pub viewport: String,
    /// 嵌入年份
    pub year: u16,
    /// 金字塔层数，范围 1 ~ 6
    #[arg(short = 'l', long, value_name = "N", default_value_t = MAX_LEVELS)]
    pub num_levels: usize,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for CoarsenCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        validate_viewport(&self.viewport)?;
        let source = opts.data_dir.mosaic(&self.viewport, self.year);
        let output = opts.data_dir.coarsened(&self.viewport, self.year);
        info!("构建嵌入金字塔：{} -> {}", source.display(), output.display());

        let meta = block_in_place(|| CoarsenedBuilder::new(self.num_levels).build(&source, &output))?;

        print_output(self.output_format, &meta, print_pyramid)
    }
}
