use clap::Parser;
use log::{debug, info};
use tokio::task::block_in_place;

use super::{OutputFormat, SubCommandExtend, print_output};
use crate::config::{Opts, SearchOptions};
use crate::raster::RasterView;
use crate::search::{IndexArtifacts, SearchQuery, SearchResult};
use crate::tiles::validate_viewport;

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    /// 视口名
    pub viewport: String,
    /// 嵌入年份
    pub year: u16,
    /// 查询点的纬度
    #[arg(allow_negative_numbers = true)]
    pub lat: f64,
    /// 查询点的经度
    #[arg(allow_negative_numbers = true)]
    pub lon: f64,
    /// 最大 L2 距离
    pub threshold: f32,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        validate_viewport(&self.viewport)?;
        let dir = opts.data_dir.index(&self.viewport, self.year);
        let artifacts = block_in_place(|| IndexArtifacts::load(&dir))?;

        let view = RasterView::open(&artifacts.metadata.source)?;
        let (embedding, (x, y)) = view.sample_lonlat(self.lon, self.lat)?;
        debug!("查询像素 ({x}, {y})，维度 {}", embedding.len());

        let query = SearchQuery::new(self.threshold)
            .max_results(self.search.max_results)
            .nprobe(self.search.nprobe);
        let result = block_in_place(|| artifacts.get(self.search.mode).search(&embedding, &query))?;

        let stats = &result.query_stats;
        info!(
            "{} 搜索：{} / {} 个像素匹配，耗时 {:.2}ms",
            self.search.mode.as_str(),
            stats.matches_found,
            stats.total_pixels,
            stats.computation_time_ms
        );
        print_output(self.output_format, &result, print_matches)
    }
}

fn print_matches(result: &SearchResult) {
    for m in &result.matches {
        println!("{:.4}\t{:.6}\t{:.6}\t{},{}", m.distance, m.lat, m.lon, m.pixel.x, m.pixel.y);
    }
}
