mod coarsen;
mod index;
mod pyramid;
mod relabel;
mod rgb;
mod search;
pub mod server;

pub use coarsen::*;
pub use index::*;
pub use pyramid::*;
pub use relabel::*;
pub use rgb::*;
pub use search::*;
pub use server::*;

use clap::ValueEnum;
use serde::Serialize;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

/// 以 JSON 输出时直接序列化 `value`，否则调用 `table` 打印表格
fn print_output<T, F>(format: OutputFormat, value: &T, table: F) -> anyhow::Result<()>
where
    T: Serialize,
    F: FnOnce(&T),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Table => table(value),
    }
    Ok(())
}

fn print_pyramid(meta: &crate::pyramid::PyramidMetadata) {
    if meta.cached {
        println!("# cached");
    }
    for level in &meta.levels {
        let resampling = level.resampling.map(|r| r.as_str()).unwrap_or("mean");
        println!(
            "{}\t{}x{}x{}\t{:.2}m\t{}\t{}",
            level.level, level.width, level.height, level.bands, level.gsd, resampling, level.file
        );
    }
}
