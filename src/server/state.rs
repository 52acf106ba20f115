use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::config::{DataDir, SearchOptions};
use crate::error::{Error, Result};
use crate::search::{IndexArtifacts, IndexMetadata, METADATA_FILE};
use crate::tiles::TileServer;
use crate::utils::read_json;

/// 应用状态
pub struct AppState {
    /// 瓦片服务
    pub tiles: TileServer,
    /// 数据目录
    pub data_dir: DataDir,
    /// 搜索配置选项
    pub search: SearchOptions,
    /// 最近使用的索引，以 `(viewport, year)` 为键
    indices: Mutex<LruCache<(String, u16), Arc<IndexArtifacts>>>,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(tiles: TileServer, data_dir: DataDir, search: SearchOptions, index_cache: usize) -> Arc<Self> {
        let capacity = NonZeroUsize::new(index_cache).unwrap_or(NonZeroUsize::MIN);
        Arc::new(AppState { tiles, data_dir, search, indices: Mutex::new(LruCache::new(capacity)) })
    }

    /// 加载索引，磁盘上的元数据与缓存不一致时重新加载
    pub fn index(&self, viewport: &str, year: u16) -> Result<Arc<IndexArtifacts>> {
        let dir = self.data_dir.index(viewport, year);
        let key = (viewport.to_string(), year);

        if let Some(current) = read_json::<IndexMetadata>(dir.join(METADATA_FILE))? {
            let mut cache = self.indices.lock().map_err(|_| Error::Computation("索引缓存锁已损坏".into()))?;
            match cache.get(&key) {
                Some(cached) if cached.metadata.created_at == current.created_at => {
                    return Ok(cached.clone());
                }
                _ => {}
            }
        }

        let artifacts = Arc::new(IndexArtifacts::load(&dir)?);
        if let Ok(mut cache) = self.indices.lock() {
            cache.put(key, artifacts.clone());
        }
        Ok(artifacts)
    }
}
