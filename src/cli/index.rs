use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use super::{OutputFormat, SubCommandExtend, print_output};
use crate::config::{IndexOptions, Opts};
use crate::search::IndexBuilder;
use crate::tiles::validate_viewport;

#[derive(Parser, Debug, Clone)]
pub struct IndexCommand {
    /// 视口名
    pub viewport: String,
    /// 嵌入年份
    pub year: u16,
    #[command(flatten)]
    pub index: IndexOptions,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for IndexCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        validate_viewport(&self.viewport)?;
        let source = opts.data_dir.mosaic(&self.viewport, self.year);
        let output = opts.data_dir.index(&self.viewport, self.year);
        info!("构建索引：{} -> {}", source.display(), output.display());

        let builder = IndexBuilder::new()
            .step(self.index.step)
            .bbox(self.index.bbox)
            .max_iter(self.index.max_iter)
            .seed(self.index.seed);
        let meta = block_in_place(|| builder.build(&source, &output, &self.viewport, self.year))?;

        print_output(self.output_format, &meta, |meta| {
            println!("dim\t{}", meta.dim);
            println!("total_pixels\t{}", meta.total_pixels);
            println!("sampled_pixels\t{}", meta.sampled_pixels);
            println!("nlist\t{}", meta.nlist);
            println!("m\t{}", meta.m);
            println!("bbox\t{:?}", meta.bbox.to_array());
        })
    }
}
