use clap::Parser;
use tessmap::Opts;
use tessmap::cli::SubCommandExtend;
use tessmap::config::SubCommand;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Pyramid(config) => config.run(&opts).await,
        SubCommand::Coarsen(config) => config.run(&opts).await,
        SubCommand::Rgb(config) => config.run(&opts).await,
        SubCommand::Index(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
        SubCommand::Relabel(config) => config.run(&opts).await,
        SubCommand::Server(config) => config.run(&opts).await,
    }
}
