//! 校验和缓存
//!
//! 每个已同步的本地文件在缓存目录下对应两份记录：
//! - `<key>.meta`：`{"size": .., "mtime": .., "checksum": ".."}`
//! - `<key>.md5`：仅含校验和（兼容旧版本缓存）
//!
//! `<key>` 由相对路径转换而来，目录分隔符以及 `[A-Za-z0-9._-]` 以外的字符都替换为 `_`。
//! 记录损坏时视为不存在。

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 修改时间容差（秒），吸收不同文件系统的小数精度差异
pub const MTIME_TOLERANCE_SECS: f64 = 1.0;

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: u64,
    /// 修改时间（Unix 秒，带小数）
    pub mtime: f64,
    pub checksum: String,
}

/// 校验和缓存管理器
#[derive(Debug, Clone)]
pub struct ChecksumCache {
    cache_dir: PathBuf,
}

impl ChecksumCache {
    /// 打开缓存目录，不存在时创建
    pub fn open(cache_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// 相对路径转换为缓存文件名
    pub fn cache_key(relative_path: &str) -> String {
        relative_path
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn meta_path(&self, relative_path: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.meta", Self::cache_key(relative_path)))
    }

    fn md5_path(&self, relative_path: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.md5", Self::cache_key(relative_path)))
    }

    /// 读取缓存条目
    pub fn get(&self, relative_path: &str) -> Option<CacheEntry> {
        let data = std::fs::read(self.meta_path(relative_path)).ok()?;
        match serde_json::from_slice::<CacheEntry>(&data) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("缓存记录损坏，忽略: {} ({})", relative_path, e);
                None
            }
        }
    }

    /// 读取缓存的校验和，`.meta` 缺失时回退到旧版 `.md5`
    pub fn cached_checksum(&self, relative_path: &str) -> Option<String> {
        if let Some(entry) = self.get(relative_path) {
            return Some(entry.checksum);
        }
        std::fs::read_to_string(self.md5_path(relative_path))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// 写入（覆盖）缓存条目
    pub fn put(&self, relative_path: &str, size: u64, mtime: f64, checksum: &str) -> io::Result<()> {
        let entry = CacheEntry {
            size,
            mtime,
            checksum: checksum.to_string(),
        };
        let data = serde_json::to_vec(&entry)?;
        std::fs::write(self.meta_path(relative_path), data)?;
        std::fs::write(self.md5_path(relative_path), checksum)?;
        Ok(())
    }

    /// 删除缓存条目
    pub fn invalidate(&self, relative_path: &str) {
        for path in [self.meta_path(relative_path), self.md5_path(relative_path)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!("删除缓存记录失败 {:?}: {}", path, e),
            }
        }
    }

    /// 判断是否需要重新计算校验和
    pub fn needs_recompute(&self, relative_path: &str, current_size: u64, current_mtime: f64) -> bool {
        match self.get(relative_path) {
            None => true,
            Some(entry) => {
                entry.size != current_size
                    || (entry.mtime - current_mtime).abs() > MTIME_TOLERANCE_SECS
            }
        }
    }
}
