use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::Parser;

use super::{OutputFormat, SubCommandExtend, print_output};
use crate::config::Opts;
use crate::relabel::{RelabelRequest, RelabelResult};

#[derive(Parser, Debug, Clone)]
pub struct RelabelCommand {
    /// 包含 label_embeddings 和 labeled_pixels 的 JSON 文件
    pub input: PathBuf,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for RelabelCommand {
    async fn run(&self, _opts: &Opts) -> anyhow::Result<()> {
        let request: RelabelRequest = serde_json::from_reader(BufReader::new(File::open(&self.input)?))?;
        let result = request.run()?;
        print_output(self.output_format, &result, print_relabels)
    }
}

fn print_relabels(result: &RelabelResult) {
    for r in &result.relabeled {
        let old = r.old_distance.map(|d| format!("{d:.4}")).unwrap_or_else(|| "-".to_string());
        println!("{}\t{} -> {}\t{old} -> {:.4}", r.key, r.old_label, r.new_label, r.new_distance);
    }
    println!("# {} / {} relabeled", result.stats.relabeled_pixels, result.stats.total_pixels);
}
