//! 同步引擎 - 串联扫描、远程清单、计划、确认、执行和空目录清理

use super::cache::ChecksumCache;
use super::checksum::ChecksumStrategy;
use super::executor::Executor;
use super::planner::{Planner, SyncPlan};
use super::progress::ProgressSender;
use super::reaper::reap_empty_directories;
use super::remote::{fetch_remote_inventory, ListingPolicy};
use super::scanner::{ExcludeRules, FileScanner, LocalInventory};
use super::stats::{RunStatistics, StatsSnapshot};
use crate::error::SyncError;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 引擎选项
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub source_dir: PathBuf,
    pub excluded_files: Vec<String>,
    pub checksum_strategy: ChecksumStrategy,
    pub parallel_analysis: bool,
    pub listing_policy: ListingPolicy,
    /// 只生成计划，不修改远程
    pub dry_run: bool,
}

impl SyncOptions {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            excluded_files: super::scanner::default_excluded_files(),
            checksum_strategy: ChecksumStrategy::Sampled,
            parallel_analysis: true,
            listing_policy: ListingPolicy::BestEffort,
            dry_run: false,
        }
    }
}

/// 交给确认环节展示的计划摘要
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub local_files: usize,
    pub local_bytes: u64,
    pub remote_files: usize,
    pub remote_bytes: u64,
    pub to_upload: usize,
    pub to_delete: usize,
    pub upload_bytes: u64,
    /// 远程清单不完整
    pub partial_remote: bool,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.to_upload + self.to_delete
    }
}

/// 执行前的确认
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, summary: &PlanSummary) -> bool;
}

/// 直接同意
pub struct AutoConfirm;

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, _summary: &PlanSummary) -> bool {
        true
    }
}

/// 运行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// 已执行变更
    Applied,
    /// 无需变更
    NoChanges,
    /// 用户拒绝
    Declined,
    /// 演练模式
    DryRun,
    /// 用户中断
    Cancelled,
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub summary: Option<PlanSummary>,
    pub stats: StatsSnapshot,
    /// 确认后到结束的耗时
    pub sync_elapsed: Duration,
    pub unreachable_dirs: Vec<String>,
    pub removed_dirs: Vec<String>,
}

/// 运行中逐步填充的状态，中断时也能生成报告
#[derive(Default)]
struct RunState {
    summary: Option<PlanSummary>,
    unreachable_dirs: Vec<String>,
    removed_dirs: Vec<String>,
}

/// 同步引擎
pub struct SyncEngine {
    storage: Arc<dyn Storage>,
    cache: Arc<ChecksumCache>,
    options: SyncOptions,
    cancelled: Arc<AtomicBool>,
    progress_tx: Option<ProgressSender>,
}

impl SyncEngine {
    /// 创建引擎，缓存目录无法创建时失败
    pub fn new(
        storage: Arc<dyn Storage>,
        cache_dir: &Path,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let cache = ChecksumCache::open(cache_dir).map_err(|source| SyncError::CacheDir {
            path: cache_dir.to_path_buf(),
            source,
        })?;

        Ok(Self {
            storage,
            cache: Arc::new(cache),
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress_tx: None,
        })
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// 取消标志，可交给信号处理任务
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// 执行一次同步
    ///
    /// 只有前置条件失败（源目录缺失、严格模式下列表失败）返回错误；
    /// 中断返回 `Outcome::Cancelled`，统计保留已完成的部分。
    pub async fn run(&self, confirm: &dyn Confirm) -> Result<SyncReport, SyncError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let stats = Arc::new(RunStatistics::new());
        let mut state = RunState::default();

        info!("同步开始 [{}]: {} -> {}", run_id, self.options.source_dir.display(), self.storage.name());

        let outcome = match self.execute(&stats, confirm, &mut state).await {
            Ok(outcome) => outcome,
            Err(SyncError::Cancelled) => {
                warn!("同步已取消 [{}]", run_id);
                Outcome::Cancelled
            }
            Err(e) => return Err(e),
        };

        let snapshot = stats.snapshot();
        let sync_elapsed = snapshot.sync_elapsed(Instant::now());
        info!("同步结束 [{}]: {:?}", run_id, outcome);

        Ok(SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            summary: state.summary,
            stats: snapshot,
            sync_elapsed,
            unreachable_dirs: state.unreachable_dirs,
            removed_dirs: state.removed_dirs,
        })
    }

    async fn execute(
        &self,
        stats: &Arc<RunStatistics>,
        confirm: &dyn Confirm,
        state: &mut RunState,
    ) -> Result<Outcome, SyncError> {
        let source_dir = self.options.source_dir.clone();
        if !source_dir.is_dir() {
            return Err(SyncError::SourceMissing(source_dir));
        }

        let excludes = ExcludeRules::new(&self.options.excluded_files);

        // 本地扫描与远程列表并行
        let scanner = FileScanner::new(excludes.clone()).with_cancel(self.cancelled.clone());
        let scan = tokio::task::spawn_blocking(move || scanner.scan(&source_dir));
        let fetch = fetch_remote_inventory(
            self.storage.as_ref(),
            self.options.listing_policy,
            &self.cancelled,
        );
        let (local, remote) = tokio::join!(scan, fetch);
        let local = local??;
        let mut remote = remote?;
        state.unreachable_dirs = remote.unreachable.clone();

        let planner = Planner::new(
            self.cache.clone(),
            stats.clone(),
            self.options.checksum_strategy,
            self.options.parallel_analysis,
            self.cancelled.clone(),
        )
        .with_progress(self.progress_tx.clone());
        let plan = planner.plan(&local, &remote, &excludes).await?;

        let summary = summarize(&local, &remote, &plan);
        state.summary = Some(summary.clone());

        if plan.is_empty() {
            info!("无需变更，本地与远程已一致");
            return Ok(Outcome::NoChanges);
        }
        if self.options.dry_run {
            info!("演练模式，不执行任何变更");
            return Ok(Outcome::DryRun);
        }
        let confirmed = confirm.confirm(&summary).await;
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        if !confirmed {
            info!("用户取消了变更");
            return Ok(Outcome::Declined);
        }

        stats.mark_sync_started(Instant::now());

        let executor = Executor::new(
            self.storage.clone(),
            self.cache.clone(),
            stats.clone(),
            self.options.checksum_strategy,
            self.cancelled.clone(),
        )
        .with_progress(self.progress_tx.clone());

        executor.upload_all(&plan, &local, &mut remote).await?;
        executor.delete_all(&plan, &mut remote).await?;

        state.removed_dirs = reap_empty_directories(
            self.storage.as_ref(),
            &mut remote,
            stats,
            &self.progress_tx,
            &self.cancelled,
        )
        .await?;

        Ok(Outcome::Applied)
    }
}

fn summarize(
    local: &LocalInventory,
    remote: &super::remote::RemoteInventory,
    plan: &SyncPlan,
) -> PlanSummary {
    PlanSummary {
        local_files: local.len(),
        local_bytes: local.total_bytes(),
        remote_files: remote.files.len(),
        remote_bytes: remote.total_bytes,
        to_upload: plan.uploads().len(),
        to_delete: plan.deletes().len(),
        upload_bytes: plan.upload_bytes(),
        partial_remote: remote.is_partial(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    struct Decline;

    #[async_trait]
    impl Confirm for Decline {
        async fn confirm(&self, _summary: &PlanSummary) -> bool {
            false
        }
    }

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        let cache = tmp.path().join("cache");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        (tmp, src, dest, cache)
    }

    fn engine(src: &Path, dest: &Path, cache: &Path, dry_run: bool) -> SyncEngine {
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dest.to_str().unwrap()).unwrap());
        let mut options = SyncOptions::new(src);
        options.dry_run = dry_run;
        SyncEngine::new(storage, cache, options).unwrap()
    }

    #[tokio::test]
    async fn test_declined_makes_no_changes() {
        let (_tmp, src, dest, cache) = setup();
        std::fs::write(src.join("a.txt"), b"a").unwrap();

        let report = engine(&src, &dest, &cache, false).run(&Decline).await.unwrap();
        assert_eq!(report.outcome, Outcome::Declined);
        assert_eq!(report.summary.unwrap().to_upload, 1);
        assert!(!dest.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_dry_run_skips_confirmation_and_mutation() {
        let (_tmp, src, dest, cache) = setup();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        std::fs::write(dest.join("b.txt"), b"b").unwrap();

        let report = engine(&src, &dest, &cache, true)
            .run(&AutoConfirm)
            .await
            .unwrap();
        assert_eq!(report.outcome, Outcome::DryRun);
        let summary = report.summary.unwrap();
        assert_eq!((summary.to_upload, summary.to_delete), (1, 1));
        assert!(dest.join("b.txt").exists());
        assert!(!dest.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_fatal() {
        let (_tmp, src, dest, cache) = setup();
        let err = engine(&src.join("nope"), &dest, &cache, false)
            .run(&AutoConfirm)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_uncreatable_cache_dir_is_fatal() {
        let (tmp, src, dest, _cache) = setup();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(dest.to_str().unwrap()).unwrap());
        let result = SyncEngine::new(storage, &blocker.join("cache"), SyncOptions::new(&src));
        assert!(matches!(result, Err(SyncError::CacheDir { .. })));
    }

    #[tokio::test]
    async fn test_cancel_before_run_reports_cancelled() {
        let (_tmp, src, dest, cache) = setup();
        for i in 0..20 {
            std::fs::write(src.join(format!("f{}.txt", i)), b"x").unwrap();
        }
        let engine = engine(&src, &dest, &cache, false);
        engine.cancel();
        let report = engine.run(&AutoConfirm).await.unwrap();
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.stats.files_uploaded, 0);
        assert!(std::fs::read_dir(&dest).unwrap().next().is_none());
    }
}
