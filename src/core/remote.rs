//! 远程清单
//!
//! 从存储根目录开始逐层列出目录，收集文件集合和目录集合。每次运行重新获取，不做持久化。

use crate::error::SyncError;
use crate::storage::{Storage, StorageError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// 目录列表失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingPolicy {
    /// 记录警告，使用已获取的部分数据继续
    #[default]
    BestEffort,
    /// 任何目录列表失败都终止运行
    Strict,
}

/// 远程文件与目录集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteInventory {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    pub total_bytes: u64,
    /// 列表失败的目录（仅 BestEffort 模式下会出现）
    pub unreachable: Vec<String>,
}

impl RemoteInventory {
    pub fn is_partial(&self) -> bool {
        !self.unreachable.is_empty()
    }

    /// 目录下是否还有文件
    pub fn has_files_under(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .range(prefix.clone()..)
            .next()
            .is_some_and(|f| f.starts_with(&prefix))
    }
}

/// 递归获取远程清单
pub async fn fetch_remote_inventory(
    storage: &dyn Storage,
    policy: ListingPolicy,
    cancelled: &AtomicBool,
) -> Result<RemoteInventory, SyncError> {
    info!("开始获取远程文件列表: {}", storage.name());

    let mut inventory = RemoteInventory::default();
    let mut pending = vec![String::new()];

    while let Some(dir) = pending.pop() {
        if cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        let entries = match storage.list(&dir).await {
            Ok(entries) => entries,
            Err(StorageError::NotFound(_)) => {
                debug!("远程目录不存在，视为空: '{}'", dir);
                continue;
            }
            Err(e) => match policy {
                ListingPolicy::Strict => {
                    return Err(SyncError::RemoteListing { path: dir, source: e });
                }
                ListingPolicy::BestEffort => {
                    warn!("获取远程目录 '{}' 失败，该目录按空处理: {}", dir, e);
                    inventory.unreachable.push(dir);
                    continue;
                }
            },
        };

        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        for entry in entries {
            let full_path = format!("{}{}", prefix, entry.name.trim_matches('/'));
            if entry.is_dir {
                inventory.dirs.insert(full_path.clone());
                pending.push(full_path);
            } else {
                inventory.total_bytes += entry.length;
                inventory.files.insert(full_path);
            }
        }
    }

    info!(
        "远程共 {} 个文件, {} 个目录 ({} 字节)",
        inventory.files.len(),
        inventory.dirs.len(),
        inventory.total_bytes
    );
    if inventory.is_partial() {
        warn!(
            "{} 个远程目录无法访问，远程清单不完整",
            inventory.unreachable.len()
        );
    }

    Ok(inventory)
}
