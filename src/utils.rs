use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, UNIX_EPOCH};

use indicatif::ProgressStyle;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// 文件修改时间，单位为秒（自 UNIX 纪元起）
pub fn file_mtime_secs(path: impl AsRef<Path>) -> Result<f64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0))
}

pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

/// 读取 JSON 文件，文件不存在时返回 `None`
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
}

/// 删除文件，文件不存在时不报错
pub fn remove_if_exists(path: impl AsRef<Path>) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// 分阶段计时
#[derive(Debug, Default)]
pub struct TimeMeasure(pub HashMap<String, Duration>);

impl TimeMeasure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure<F, R>(&mut self, key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let r = f();
        *self.0.entry(key.to_string()).or_default() += start.elapsed();
        r
    }

    pub fn get_ms(&self, key: &str) -> f64 {
        self.0.get(key).map(|d| d.as_secs_f64() * 1000.0).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_json_helpers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json");
        assert_eq!(read_json::<Vec<u32>>(&path).unwrap(), None);
        write_json(&path, &vec![1u32, 2, 3]).unwrap();
        assert_eq!(read_json::<Vec<u32>>(&path).unwrap(), Some(vec![1, 2, 3]));
        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_time_measure() {
        let mut tm = TimeMeasure::new();
        let v = tm.measure("a", || 42);
        assert_eq!(v, 42);
        assert!(tm.get_ms("a") >= 0.0);
        assert_eq!(tm.get_ms("b"), 0.0);
    }
}
