//! 计划执行
//!
//! 按计划顺序逐个上传、逐个删除。单个文件失败只记入统计，不中断后续操作。

use super::cache::ChecksumCache;
use super::checksum::{fingerprint, ChecksumStrategy};
use super::planner::SyncPlan;
use super::progress::{send_progress, ProgressSender, SyncProgress, PROGRESS_INTERVAL};
use super::remote::RemoteInventory;
use super::scanner::{file_meta, LocalInventory};
use super::stats::RunStatistics;
use crate::error::SyncError;
use crate::storage::{ByteStream, Storage, StorageError};
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 小于此大小的文件一次性读入内存上传
pub const SINGLE_SHOT_LIMIT: u64 = 1024 * 1024;
/// 大文件流式上传的分块大小
pub const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// 等待上传的文件
struct PendingUpload {
    relative_path: String,
    absolute_path: PathBuf,
    size: u64,
}

/// 单个文件的传输进度
#[derive(Default)]
struct Transfer {
    sent: AtomicU64,
    first_byte: OnceLock<Instant>,
}

pub struct Executor {
    storage: Arc<dyn Storage>,
    cache: Arc<ChecksumCache>,
    stats: Arc<RunStatistics>,
    strategy: ChecksumStrategy,
    progress_tx: Option<ProgressSender>,
    cancelled: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<ChecksumCache>,
        stats: Arc<RunStatistics>,
        strategy: ChecksumStrategy,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            storage,
            cache,
            stats,
            strategy,
            progress_tx: None,
            cancelled,
        }
    }

    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.progress_tx = tx;
        self
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// 执行全部上传
    ///
    /// 每个文件在传输前重新检查一次，已消失的文件记为 missing。
    /// 上传成功的路径会加入远程文件集合，后续的空目录清理据此判断目录是否为空。
    pub async fn upload_all(
        &self,
        plan: &SyncPlan,
        local: &LocalInventory,
        remote: &mut RemoteInventory,
    ) -> Result<(), SyncError> {
        let queued = self.queue_uploads(plan, local);
        if queued.is_empty() {
            return Ok(());
        }

        let total_files = queued.len();
        let total_bytes: u64 = queued.iter().map(|p| p.size).sum();
        info!("开始上传 {} 个文件 ({} 字节)", total_files, total_bytes);

        for (index, item) in queued.into_iter().enumerate() {
            self.check_cancelled()?;

            let upload = match file_meta(&item.absolute_path) {
                Ok(meta) => PendingUpload {
                    size: meta.size,
                    ..item
                },
                Err(e) => {
                    warn!("上传前文件已丢失 '{}': {}", item.relative_path, e);
                    self.stats.record_missing();
                    continue;
                }
            };

            send_progress(
                &self.progress_tx,
                SyncProgress::UploadStarted {
                    path: upload.relative_path.clone(),
                    size: upload.size,
                    index: index + 1,
                    total: total_files,
                },
            );

            let started = Instant::now();
            let result = self.upload_one(&upload, total_bytes).await;
            let duration = started.elapsed();

            let success = match result {
                Ok(first_byte) => {
                    if let Some(at) = first_byte {
                        self.stats.mark_first_byte(at);
                    }
                    self.stats.record_uploaded(upload.size, duration);
                    self.refresh_cache(&upload).await;
                    remote.files.insert(upload.relative_path.clone());
                    debug!("上传成功: {} ({:?})", upload.relative_path, duration);
                    true
                }
                Err(e) => {
                    self.stats.record_upload_failed();
                    warn!("上传失败 '{}': {}", upload.relative_path, e);
                    false
                }
            };

            send_progress(
                &self.progress_tx,
                SyncProgress::UploadFinished {
                    path: upload.relative_path.clone(),
                    size: upload.size,
                    duration,
                    success,
                },
            );
        }

        Ok(())
    }

    /// 排队并估算上传总量，大小只用于剩余时间估算
    fn queue_uploads(&self, plan: &SyncPlan, local: &LocalInventory) -> Vec<PendingUpload> {
        let mut queued = Vec::with_capacity(plan.uploads().len());
        for rel in plan.uploads() {
            let Some(abs) = local.get(rel) else {
                self.stats.record_missing();
                continue;
            };
            queued.push(PendingUpload {
                relative_path: rel.clone(),
                absolute_path: abs.to_path_buf(),
                size: file_meta(abs).map(|m| m.size).unwrap_or(0),
            });
        }
        queued
    }

    /// 上传单个文件，成功时返回首字节发出的时间
    async fn upload_one(
        &self,
        upload: &PendingUpload,
        total_bytes: u64,
    ) -> Result<Option<Instant>, StorageError> {
        let transfer = Arc::new(Transfer::default());
        let body = self
            .open_body(&upload.absolute_path, upload.size, transfer.clone())
            .await?;

        let ticker = self.spawn_ticker(upload, total_bytes, transfer.clone());
        let result = self
            .storage
            .put(&upload.relative_path, body, upload.size)
            .await;
        if let Some(ticker) = ticker {
            ticker.abort();
        }
        result.map(|()| transfer.first_byte.get().copied())
    }

    /// 构造上传数据流，每发出一块就累加已发送字节
    async fn open_body(
        &self,
        path: &Path,
        size: u64,
        transfer: Arc<Transfer>,
    ) -> Result<ByteStream, StorageError> {
        let raw: ByteStream = if size < SINGLE_SHOT_LIMIT {
            let data = Bytes::from(tokio::fs::read(path).await?);
            Box::pin(futures::stream::once(async move { Ok(data) }))
        } else {
            let file = tokio::fs::File::open(path).await?;
            Box::pin(tokio_util::io::ReaderStream::with_capacity(
                file,
                UPLOAD_CHUNK_SIZE,
            ))
        };

        Ok(Box::pin(raw.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                if !bytes.is_empty() {
                    transfer.first_byte.get_or_init(Instant::now);
                    transfer.sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
            }
            chunk
        })))
    }

    /// 每 0.5 秒发送一次当前文件的上传进度
    fn spawn_ticker(
        &self,
        upload: &PendingUpload,
        total_bytes: u64,
        transfer: Arc<Transfer>,
    ) -> Option<JoinHandle<()>> {
        let tx = self.progress_tx.clone()?;
        let stats = self.stats.clone();
        let path = upload.relative_path.clone();
        let size = upload.size;
        let started = Instant::now();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let transferred = transfer.sent.load(Ordering::Relaxed);
                let now = Instant::now();
                let elapsed = now.duration_since(started).as_secs_f64();
                let speed = if elapsed > 0.0 {
                    transferred as f64 / elapsed
                } else {
                    0.0
                };
                let progress = SyncProgress::Uploading {
                    path: path.clone(),
                    size,
                    transferred,
                    speed,
                    eta: stats.eta(
                        total_bytes,
                        transferred,
                        transfer.first_byte.get().copied(),
                        now,
                    ),
                };
                if tx.send(progress).is_err() {
                    break;
                }
            }
        }))
    }

    /// 上传成功后按当前文件内容刷新缓存
    async fn refresh_cache(&self, upload: &PendingUpload) {
        let cache = self.cache.clone();
        let strategy = self.strategy;
        let rel = upload.relative_path.clone();
        let abs = upload.absolute_path.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<(), String> {
            let meta = file_meta(&abs).map_err(|e| e.to_string())?;
            let checksum = fingerprint(&abs, meta.size, strategy).map_err(|e| e.to_string())?;
            cache
                .put(&rel, meta.size, meta.mtime, &checksum)
                .map_err(|e| e.to_string())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("更新缓存失败 '{}': {}", upload.relative_path, e),
            Err(e) => warn!("更新缓存任务异常 '{}': {}", upload.relative_path, e),
        }
    }

    /// 执行全部删除
    pub async fn delete_all(
        &self,
        plan: &SyncPlan,
        remote: &mut RemoteInventory,
    ) -> Result<(), SyncError> {
        if plan.deletes().is_empty() {
            return Ok(());
        }
        info!("开始删除 {} 个远程文件", plan.deletes().len());

        for path in plan.deletes() {
            self.check_cancelled()?;

            let success = match self.storage.delete(path).await {
                Ok(()) => {
                    self.stats.record_deleted();
                    self.cache.invalidate(path);
                    remote.files.remove(path);
                    debug!("已删除: {}", path);
                    true
                }
                Err(e) => {
                    self.stats.record_delete_failed();
                    warn!("删除失败 '{}': {}", path, e);
                    false
                }
            };

            send_progress(
                &self.progress_tx,
                SyncProgress::Deleted {
                    path: path.clone(),
                    success,
                },
            );
        }

        Ok(())
    }
}
