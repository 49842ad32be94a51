//! 同步过程的致命错误
//!
//! 单个文件的读取、上传、删除失败不会走到这里，它们在发现处被记入统计。

use crate::storage::StorageError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// 源目录不存在
    #[error("源目录不存在: {0}")]
    SourceMissing(PathBuf),

    /// 缓存目录无法创建
    #[error("无法创建缓存目录 {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 严格模式下远程目录列表失败
    #[error("获取远程目录 '{path}' 失败: {source}")]
    RemoteListing {
        path: String,
        #[source]
        source: StorageError,
    },

    /// 用户中断
    #[error("同步已取消")]
    Cancelled,

    /// 后台任务异常退出
    #[error("后台任务失败: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Task(e.to_string())
    }
}
