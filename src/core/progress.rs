//! 进度事件
//!
//! 引擎通过无界通道向外发送进度，发送失败（接收端已关闭）直接忽略。

use std::time::Duration;
use tokio::sync::mpsc;

/// 进度刷新最小间隔
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub enum SyncProgress {
    /// 正在分析
    Analyzing { processed: usize, total: usize },
    /// 分析完成
    Analyzed {
        to_upload: usize,
        to_delete: usize,
        upload_bytes: u64,
    },
    /// 开始上传某个文件
    UploadStarted {
        path: String,
        size: u64,
        index: usize,
        total: usize,
    },
    /// 上传进度
    Uploading {
        path: String,
        size: u64,
        transferred: u64,
        /// 当前文件速度（字节/秒）
        speed: f64,
        /// 全部上传的剩余时间
        eta: Option<Duration>,
    },
    /// 上传结束
    UploadFinished {
        path: String,
        size: u64,
        duration: Duration,
        success: bool,
    },
    /// 文件删除结束
    Deleted { path: String, success: bool },
    /// 目录删除结束
    DirectoryDeleted { path: String, success: bool },
}

pub type ProgressSender = mpsc::UnboundedSender<SyncProgress>;

/// 发送进度
pub fn send_progress(tx: &Option<ProgressSender>, progress: SyncProgress) {
    if let Some(tx) = tx {
        let _ = tx.send(progress);
    }
}
