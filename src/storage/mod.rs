pub mod bunny;
pub mod local;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;

pub use bunny::BunnyStorage;
pub use local::LocalStorage;

// ============ 公共常量 ============

/// 存在性检查超时（秒）
pub const EXISTS_TIMEOUT_SECS: u64 = 10;
/// 列表、删除等非 IO 操作超时（秒）
pub const OP_TIMEOUT_SECS: u64 = 30;
/// 上传空闲超时（秒），数据持续流动时不限制总时长
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("远程路径不存在: {0}")]
    NotFound(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("请求超时")]
    Timeout,
    #[error("传输错误: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StorageError::Timeout
        } else if let Some(status) = e.status() {
            StorageError::Status(status.as_u16())
        } else {
            StorageError::Transport(e.to_string())
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 目录列表中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub length: u64,
}

/// 上传数据流
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// 远程对象存储接口
///
/// 所有路径都是以 `/` 分隔的相对路径，实现负责传输层的转义。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 列出单个目录的直接子项，目录不存在时返回 `NotFound`
    async fn list(&self, dir: &str) -> StorageResult<Vec<RemoteEntry>>;

    /// 检查对象是否存在
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// 流式写入对象
    async fn put(&self, path: &str, body: ByteStream, content_length: u64) -> StorageResult<()>;

    /// 删除对象，对象已不存在也视为成功
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// 删除目录，目录已不存在也视为成功
    async fn delete_dir(&self, path: &str) -> StorageResult<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 对相对路径逐段做 URL 转义，保留 `/`
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 根据存储地址创建存储实例
///
/// `file://` 开头的地址使用本地目录，其余按 Bunny 存储区处理。
pub fn create_storage(storage_url: &str, api_key: &str) -> anyhow::Result<Arc<dyn Storage>> {
    if let Some(path) = storage_url.strip_prefix("file://") {
        tracing::info!("初始化本地存储: {}", path);
        return Ok(Arc::new(LocalStorage::new(path)?) as Arc<dyn Storage>);
    }

    if api_key.is_empty() {
        anyhow::bail!("Bunny 存储需要 apiKey");
    }
    tracing::info!("初始化 Bunny 存储: {}", storage_url);
    Ok(Arc::new(BunnyStorage::new(storage_url, api_key)?) as Arc<dyn Storage>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("a b/c#d.txt"), "a%20b/c%23d.txt");
        assert_eq!(encode_path("logs/"), "logs/");
        assert_eq!(encode_path("plain-name_1.txt"), "plain-name_1.txt");
    }

    #[test]
    fn test_encode_path_unicode() {
        assert_eq!(encode_path("文档/a.txt"), "%E6%96%87%E6%A1%A3/a.txt");
    }

    #[test]
    fn test_create_storage_requires_api_key() {
        assert!(create_storage("https://storage.bunnycdn.com/zone", "").is_err());
    }
}
