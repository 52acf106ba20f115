use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use crate::cli::SubCommandExtend;
use crate::config::{SearchOptions, TileOptions};
use crate::tiles::TileServer;
use crate::{Opts, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub tiles: TileOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 同时驻留在内存中的索引数量
    #[arg(long, value_name = "N", default_value_t = 2)]
    pub index_cache: usize,
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let tiles = TileServer::new(opts.data_dir.pyramids(), self.tiles.clone())?;
        for (viewport, layers) in tiles.available_layers() {
            info!("视口 {viewport}：{}", layers.join(", "));
        }

        // 创建应用状态
        let state =
            server::AppState::new(tiles, opts.data_dir.clone(), self.search.clone(), self.index_cache);

        // 创建应用
        let app = server::create_app(state);

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
