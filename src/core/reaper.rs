//! 远程空目录清理
//!
//! 从最深的目录开始，删除不再包含任何文件的远程目录。

use super::progress::{send_progress, ProgressSender, SyncProgress};
use super::remote::RemoteInventory;
use super::stats::RunStatistics;
use crate::error::SyncError;
use crate::storage::Storage;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// 目录本身或其子目录列表失败时，内容未知，不能删除
fn is_unknown(remote: &RemoteInventory, dir: &str) -> bool {
    let prefix = format!("{}/", dir);
    remote
        .unreachable
        .iter()
        .any(|u| u == dir || u.starts_with(&prefix))
}

/// 删除空目录，返回被删除的目录
pub async fn reap_empty_directories(
    storage: &dyn Storage,
    remote: &mut RemoteInventory,
    stats: &RunStatistics,
    progress_tx: &Option<ProgressSender>,
    cancelled: &AtomicBool,
) -> Result<Vec<String>, SyncError> {
    let mut candidates: Vec<String> = remote
        .dirs
        .iter()
        .filter(|d| !remote.has_files_under(d) && !is_unknown(remote, d))
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    // 深的目录先删，同层按字典序
    candidates.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));
    info!("清理 {} 个空目录", candidates.len());

    let mut removed = Vec::new();
    for dir in candidates {
        if cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        let success = match storage.delete_dir(&dir).await {
            Ok(()) => {
                stats.record_directory_deleted();
                debug!("已删除空目录: {}", dir);
                true
            }
            Err(e) => {
                stats.record_directory_failed();
                warn!("删除目录失败 '{}': {}", dir, e);
                false
            }
        };

        send_progress(
            progress_tx,
            SyncProgress::DirectoryDeleted {
                path: dir.clone(),
                success,
            },
        );
        if success {
            remote.dirs.remove(&dir);
            removed.push(dir);
        }
    }

    Ok(removed)
}
