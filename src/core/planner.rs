//! 同步计划
//!
//! 对每个本地文件判断需要上传还是保持不变，再把本地不存在的远程文件列入删除。
//! 单个文件的判断只读写该文件自己的缓存记录，因此可以并行执行；
//! 并行与顺序两种方式对同一份文件系统和缓存状态给出完全相同的结果。

use super::cache::ChecksumCache;
use super::checksum::{fingerprint, ChecksumStrategy};
use super::progress::{send_progress, ProgressSender, SyncProgress, PROGRESS_INTERVAL};
use super::remote::RemoteInventory;
use super::scanner::{file_meta, ExcludeRules, LocalFile, LocalInventory};
use super::stats::RunStatistics;
use crate::error::SyncError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 文件数超过此值才启用并行分析
pub const PARALLEL_THRESHOLD: usize = 10;
/// 并行分析的最大线程数，避免磁盘 IO 过载
pub const MAX_ANALYSIS_WORKERS: usize = 4;

/// 单个本地文件的分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// 需要上传
    Upload { size: u64 },
    /// 内容未变且远程已存在
    Unchanged,
    /// 文件消失或无法读取
    Missing,
}

/// 同步计划，创建后不可修改
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    uploads: Vec<String>,
    deletes: Vec<String>,
    upload_bytes: u64,
}

impl SyncPlan {
    pub fn new(uploads: Vec<String>, deletes: Vec<String>, upload_bytes: u64) -> Self {
        Self {
            uploads,
            deletes,
            upload_bytes,
        }
    }

    /// 待上传路径（本地扫描顺序）
    pub fn uploads(&self) -> &[String] {
        &self.uploads
    }

    /// 待删除路径（远程集合顺序）
    pub fn deletes(&self) -> &[String] {
        &self.deletes
    }

    /// 待上传文件总大小
    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletes.is_empty()
    }
}

/// 分类单个文件，并在成功时写回缓存
pub fn classify_file(
    file: &LocalFile,
    remote_files: &BTreeSet<String>,
    cache: &ChecksumCache,
    strategy: ChecksumStrategy,
) -> Classification {
    let rel = file.relative_path.as_str();

    let meta = match file_meta(&file.absolute_path) {
        Ok(m) => m,
        Err(e) => {
            warn!("分析时文件已丢失 '{}': {}", rel, e);
            return Classification::Missing;
        }
    };
    let on_remote = remote_files.contains(rel);

    // 大小和修改时间未变，直接使用缓存的校验和
    if !cache.needs_recompute(rel, meta.size, meta.mtime) {
        if let Some(entry) = cache.get(rel) {
            persist(cache, rel, meta.size, meta.mtime, &entry.checksum);
            return if on_remote {
                Classification::Unchanged
            } else {
                Classification::Upload { size: meta.size }
            };
        }
    }

    let checksum = match fingerprint(&file.absolute_path, meta.size, strategy) {
        Ok(sum) => sum,
        Err(e) => {
            warn!("校验失败，跳过 '{}': {}", rel, e);
            return Classification::Missing;
        }
    };

    let needs_upload = match cache.cached_checksum(rel) {
        // 内容变化，无论远程是否存在都上传
        Some(cached) if cached != checksum => true,
        _ => !on_remote,
    };

    persist(cache, rel, meta.size, meta.mtime, &checksum);

    if needs_upload {
        Classification::Upload { size: meta.size }
    } else {
        Classification::Unchanged
    }
}

fn persist(cache: &ChecksumCache, rel: &str, size: u64, mtime: f64, checksum: &str) {
    if let Err(e) = cache.put(rel, size, mtime, checksum) {
        warn!("写入缓存失败 '{}': {}", rel, e);
    }
}

/// 同步计划生成器
pub struct Planner {
    cache: Arc<ChecksumCache>,
    stats: Arc<RunStatistics>,
    strategy: ChecksumStrategy,
    parallel: bool,
    progress_tx: Option<ProgressSender>,
    cancelled: Arc<AtomicBool>,
}

impl Planner {
    pub fn new(
        cache: Arc<ChecksumCache>,
        stats: Arc<RunStatistics>,
        strategy: ChecksumStrategy,
        parallel: bool,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cache,
            stats,
            strategy,
            parallel,
            progress_tx: None,
            cancelled,
        }
    }

    pub fn with_progress(mut self, tx: Option<ProgressSender>) -> Self {
        self.progress_tx = tx;
        self
    }

    /// 生成同步计划
    pub async fn plan(
        &self,
        local: &LocalInventory,
        remote: &RemoteInventory,
        excludes: &ExcludeRules,
    ) -> Result<SyncPlan, SyncError> {
        let files: Arc<Vec<LocalFile>> = Arc::new(local.files().to_vec());
        let remote_files = Arc::new(remote.files.clone());

        let classifications = if files.is_empty() {
            Vec::new()
        } else if self.parallel && files.len() > PARALLEL_THRESHOLD {
            let workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_ANALYSIS_WORKERS);
            debug!("并行分析 {} 个文件 ({} 个线程)", files.len(), workers);
            self.classify_parallel(files.clone(), remote_files, workers)
                .await?
        } else {
            debug!("顺序分析 {} 个文件", files.len());
            self.classify_sequential(files.clone(), remote_files).await?
        };

        let mut uploads = Vec::new();
        let mut upload_bytes = 0u64;
        for (file, class) in files.iter().zip(classifications) {
            match class {
                Classification::Upload { size } => {
                    uploads.push(file.relative_path.clone());
                    upload_bytes += size;
                }
                Classification::Unchanged => self.stats.record_skipped(),
                Classification::Missing => self.stats.record_missing(),
            }
        }

        // 本地不存在的远程文件
        let deletes: Vec<String> = remote
            .files
            .iter()
            .filter(|path| !excludes.is_excluded(path))
            .filter(|path| !local.contains(path))
            .cloned()
            .collect();

        info!(
            "分析完成: {} 个待上传 ({} 字节), {} 个待删除",
            uploads.len(),
            upload_bytes,
            deletes.len()
        );
        send_progress(
            &self.progress_tx,
            SyncProgress::Analyzed {
                to_upload: uploads.len(),
                to_delete: deletes.len(),
                upload_bytes,
            },
        );

        Ok(SyncPlan::new(uploads, deletes, upload_bytes))
    }

    /// 顺序分析，整个循环放在一个阻塞线程里
    async fn classify_sequential(
        &self,
        files: Arc<Vec<LocalFile>>,
        remote_files: Arc<BTreeSet<String>>,
    ) -> Result<Vec<Classification>, SyncError> {
        let cache = self.cache.clone();
        let cancelled = self.cancelled.clone();
        let progress_tx = self.progress_tx.clone();
        let strategy = self.strategy;

        tokio::task::spawn_blocking(move || {
            let total = files.len();
            let mut reporter = AnalysisReporter::new(total, progress_tx);
            let mut results = Vec::with_capacity(total);

            for file in files.iter() {
                if cancelled.load(Ordering::SeqCst) {
                    return Err(SyncError::Cancelled);
                }
                results.push(classify_file(file, &remote_files, &cache, strategy));
                reporter.tick();
            }
            Ok(results)
        })
        .await?
    }

    /// 固定大小的线程池分析
    ///
    /// 工作线程通过共享游标领取任务，结果带序号送回，最后按扫描顺序重排。
    async fn classify_parallel(
        &self,
        files: Arc<Vec<LocalFile>>,
        remote_files: Arc<BTreeSet<String>>,
        workers: usize,
    ) -> Result<Vec<Classification>, SyncError> {
        let total = files.len();
        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Classification)>();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let files = files.clone();
            let remote_files = remote_files.clone();
            let cache = self.cache.clone();
            let cancelled = self.cancelled.clone();
            let cursor = cursor.clone();
            let tx = tx.clone();
            let strategy = self.strategy;

            handles.push(tokio::task::spawn_blocking(move || loop {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                let idx = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(file) = files.get(idx) else {
                    break;
                };
                let class = classify_file(file, &remote_files, &cache, strategy);
                if tx.send((idx, class)).is_err() {
                    break;
                }
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<Classification>> = vec![None; total];
        let mut reporter = AnalysisReporter::new(total, self.progress_tx.clone());
        while let Some((idx, class)) = rx.recv().await {
            slots[idx] = Some(class);
            reporter.tick();
        }

        for handle in handles {
            handle.await?;
        }

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| SyncError::Task("分析结果缺失".to_string())))
            .collect()
    }
}

/// 分析进度节流：每 0.5 秒、每 20 个文件或结束时发送一次
struct AnalysisReporter {
    total: usize,
    processed: usize,
    last_sent: Instant,
    tx: Option<ProgressSender>,
}

impl AnalysisReporter {
    fn new(total: usize, tx: Option<ProgressSender>) -> Self {
        Self {
            total,
            processed: 0,
            last_sent: Instant::now(),
            tx,
        }
    }

    fn tick(&mut self) {
        self.processed += 1;
        if self.total <= PARALLEL_THRESHOLD {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_sent) >= PROGRESS_INTERVAL
            || self.processed % 20 == 0
            || self.processed == self.total
        {
            send_progress(
                &self.tx,
                SyncProgress::Analyzing {
                    processed: self.processed,
                    total: self.total,
                },
            );
            self.last_sent = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::FileScanner;
    use filetime::FileTime;
    use std::path::Path;

    struct Fixture {
        _tmp: tempfile::TempDir,
        src: std::path::PathBuf,
        cache: Arc<ChecksumCache>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let src = tmp.path().join("src");
            std::fs::create_dir_all(&src).unwrap();
            let cache = Arc::new(ChecksumCache::open(tmp.path().join("cache")).unwrap());
            Self {
                _tmp: tmp,
                src,
                cache,
            }
        }

        fn write(&self, rel: &str, data: &[u8], mtime: i64) {
            let path = self.src.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, data).unwrap();
            filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
        }

        fn local(&self) -> LocalInventory {
            FileScanner::new(ExcludeRules::default())
                .scan(&self.src)
                .unwrap()
        }

        fn planner(&self, parallel: bool) -> (Planner, Arc<RunStatistics>) {
            let stats = Arc::new(RunStatistics::new());
            let planner = Planner::new(
                self.cache.clone(),
                stats.clone(),
                ChecksumStrategy::Sampled,
                parallel,
                Arc::new(AtomicBool::new(false)),
            );
            (planner, stats)
        }
    }

    fn remote(files: &[&str]) -> RemoteInventory {
        RemoteInventory {
            files: files.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn local_file(root: &Path, rel: &str) -> LocalFile {
        LocalFile {
            relative_path: rel.to_string(),
            absolute_path: root.join(rel),
        }
    }

    #[tokio::test]
    async fn test_new_local_and_orphan_remote() {
        let fx = Fixture::new();
        fx.write("a.txt", b"new", 1_700_000_000);

        let (planner, _) = fx.planner(true);
        let plan = planner
            .plan(&fx.local(), &remote(&["b.txt"]), &ExcludeRules::default())
            .await
            .unwrap();

        assert_eq!(plan.uploads(), ["a.txt".to_string()]);
        assert_eq!(plan.deletes(), ["b.txt".to_string()]);
        assert_eq!(plan.upload_bytes(), 3);
    }

    #[tokio::test]
    async fn test_cached_and_remote_is_unchanged() {
        let fx = Fixture::new();
        fx.write("a.txt", b"same", 1_700_000_000);
        let meta = file_meta(&fx.src.join("a.txt")).unwrap();
        fx.cache.put("a.txt", meta.size, meta.mtime, "anything").unwrap();

        let (planner, stats) = fx.planner(false);
        let plan = planner
            .plan(&fx.local(), &remote(&["a.txt"]), &ExcludeRules::default())
            .await
            .unwrap();

        assert!(plan.is_empty());
        assert_eq!(stats.snapshot().files_skipped, 1);
        // 缓存命中时不重新计算，缓存中的校验和保持原样
        assert_eq!(fx.cache.get("a.txt").unwrap().checksum, "anything");
    }

    #[tokio::test]
    async fn test_modified_file_is_uploaded_even_if_remote() {
        let fx = Fixture::new();
        fx.write("a.txt", b"v1", 1_700_000_000);
        let (planner, _) = fx.planner(false);
        let plan = planner
            .plan(&fx.local(), &remote(&["a.txt"]), &ExcludeRules::default())
            .await
            .unwrap();
        assert!(plan.uploads().is_empty());

        fx.write("a.txt", b"v2 changed", 1_700_000_100);
        let (planner, _) = fx.planner(false);
        let plan = planner
            .plan(&fx.local(), &remote(&["a.txt"]), &ExcludeRules::default())
            .await
            .unwrap();
        assert_eq!(plan.uploads(), ["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_cached_but_absent_remotely_is_uploaded() {
        let fx = Fixture::new();
        fx.write("a.txt", b"data", 1_700_000_000);
        let meta = file_meta(&fx.src.join("a.txt")).unwrap();
        let sum = crate::core::checksum::full_checksum(&fx.src.join("a.txt")).unwrap();
        fx.cache.put("a.txt", meta.size, meta.mtime, &sum).unwrap();

        // touch 修改时间但内容不变
        fx.write("a.txt", b"data", 1_700_000_050);
        let (planner, _) = fx.planner(false);
        let plan = planner
            .plan(&fx.local(), &remote(&[]), &ExcludeRules::default())
            .await
            .unwrap();
        assert_eq!(plan.uploads(), ["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_local_file_never_deleted_and_excluded_remote_kept() {
        let fx = Fixture::new();
        fx.write("keep.txt", b"x", 1_700_000_000);

        let excludes = ExcludeRules::new(&[".DS_Store".to_string()]);
        let (planner, _) = fx.planner(false);
        let plan = planner
            .plan(
                &fx.local(),
                &remote(&["keep.txt", "dir/.DS_Store", "gone.txt"]),
                &excludes,
            )
            .await
            .unwrap();
        assert_eq!(plan.deletes(), ["gone.txt".to_string()]);
    }

    #[test]
    fn test_unreadable_file_is_missing_and_cache_untouched() {
        let fx = Fixture::new();
        let file = local_file(&fx.src, "vanished.txt");
        let class = classify_file(
            &file,
            &BTreeSet::new(),
            &fx.cache,
            ChecksumStrategy::Full,
        );
        assert_eq!(class, Classification::Missing);
        assert!(fx.cache.get("vanished.txt").is_none());
    }

    #[tokio::test]
    async fn test_parallel_and_sequential_agree() {
        let fx = Fixture::new();
        let mut remote_files = Vec::new();
        for i in 0..40 {
            let rel = format!("dir{}/f{:02}.txt", i % 3, i);
            fx.write(&rel, format!("content {}", i).as_bytes(), 1_700_000_000 + i);
            if i % 2 == 0 {
                remote_files.push(rel);
            }
        }
        remote_files.push("orphan.txt".to_string());
        let remote_refs: Vec<&str> = remote_files.iter().map(String::as_str).collect();
        let remote_inv = remote(&remote_refs);
        let local = fx.local();

        let seq_fx_cache = Arc::new(
            ChecksumCache::open(fx._tmp.path().join("cache-seq")).unwrap(),
        );
        let seq = Planner::new(
            seq_fx_cache,
            Arc::new(RunStatistics::new()),
            ChecksumStrategy::Sampled,
            false,
            Arc::new(AtomicBool::new(false)),
        )
        .plan(&local, &remote_inv, &ExcludeRules::default())
        .await
        .unwrap();

        let (planner, stats) = fx.planner(true);
        let par = planner
            .plan(&local, &remote_inv, &ExcludeRules::default())
            .await
            .unwrap();

        assert_eq!(seq, par);
        assert_eq!(par.uploads().len(), 20);
        assert_eq!(par.deletes(), ["orphan.txt".to_string()]);
        assert_eq!(stats.snapshot().files_skipped, 20);

        // 上传列表保持扫描顺序
        let scan_order: Vec<_> = local
            .files()
            .iter()
            .map(|f| f.relative_path.clone())
            .filter(|p| par.uploads().contains(p))
            .collect();
        assert_eq!(par.uploads(), scan_order.as_slice());
    }

    #[tokio::test]
    async fn test_cancelled_analysis() {
        let fx = Fixture::new();
        for i in 0..20 {
            fx.write(&format!("f{}.txt", i), b"x", 1_700_000_000);
        }
        let cancelled = Arc::new(AtomicBool::new(true));
        let planner = Planner::new(
            fx.cache.clone(),
            Arc::new(RunStatistics::new()),
            ChecksumStrategy::Sampled,
            true,
            cancelled,
        );
        let result = planner
            .plan(&fx.local(), &remote(&[]), &ExcludeRules::default())
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
