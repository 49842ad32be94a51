//! 运行统计
//!
//! 所有计数只增不减，整体放在一把互斥锁后面，分析线程池和上传流程共享同一个实例。
//! 统计只用于进度和报告，不参与任何控制流判断。

use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 吞吐量可测量所需的最短时间
const MIN_MEASURABLE_ELAPSED: Duration = Duration::from_millis(1);

/// 统计快照
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub files_uploaded: u64,
    pub files_skipped: u64,
    pub files_deleted: u64,
    pub files_missing: u64,
    pub uploads_failed: u64,
    pub deletes_failed: u64,
    pub directories_deleted: u64,
    pub directories_failed: u64,
    pub bytes_uploaded: u64,
    /// 上传累计耗时
    pub upload_duration: Duration,
    /// 第一个成功上传的文件发出首字节的时间
    #[serde(skip)]
    pub first_byte_at: Option<Instant>,
    /// 确认后开始执行同步的时间
    #[serde(skip)]
    pub sync_started_at: Option<Instant>,
}

impl StatsSnapshot {
    /// 平均上传速度（字节/秒）
    pub fn average_upload_speed(&self) -> Option<f64> {
        let secs = self.upload_duration.as_secs_f64();
        (self.files_uploaded > 0 && secs > 0.0).then(|| self.bytes_uploaded as f64 / secs)
    }

    /// 从确认开始到现在的同步耗时
    pub fn sync_elapsed(&self, now: Instant) -> Duration {
        self.sync_started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::ZERO)
    }
}

/// 运行统计
#[derive(Debug, Default)]
pub struct RunStatistics {
    inner: Mutex<StatsSnapshot>,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        // 计数器在锁内只做加法，中毒后数据依然可用
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_uploaded(&self, bytes: u64, duration: Duration) {
        let mut s = self.lock();
        s.files_uploaded += 1;
        s.bytes_uploaded += bytes;
        s.upload_duration += duration;
    }

    pub fn record_upload_failed(&self) {
        self.lock().uploads_failed += 1;
    }

    pub fn record_skipped(&self) {
        self.lock().files_skipped += 1;
    }

    pub fn record_missing(&self) {
        self.lock().files_missing += 1;
    }

    pub fn record_deleted(&self) {
        self.lock().files_deleted += 1;
    }

    pub fn record_delete_failed(&self) {
        self.lock().deletes_failed += 1;
    }

    pub fn record_directory_deleted(&self) {
        self.lock().directories_deleted += 1;
    }

    pub fn record_directory_failed(&self) {
        self.lock().directories_failed += 1;
    }

    /// 提交首字节时间，只在文件上传成功后调用，只生效一次
    pub fn mark_first_byte(&self, at: Instant) {
        let mut s = self.lock();
        if s.first_byte_at.is_none() {
            s.first_byte_at = Some(at);
        }
    }

    /// 记录确认后开始同步的时间
    pub fn mark_sync_started(&self, at: Instant) {
        self.lock().sync_started_at = Some(at);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }

    /// 估算剩余时间
    ///
    /// `in_flight` 为当前文件已发送的字节数，`in_flight_first_byte` 为当前文件的首字节时间，
    /// 还没有成功上传的文件时以它为起点。吞吐量无法测量时返回 `None`。
    pub fn eta(
        &self,
        total_planned: u64,
        in_flight: u64,
        in_flight_first_byte: Option<Instant>,
        now: Instant,
    ) -> Option<Duration> {
        let s = self.lock();
        let completed = s.bytes_uploaded + in_flight;
        let first = s.first_byte_at.or(in_flight_first_byte)?;
        drop(s);

        let elapsed = now.saturating_duration_since(first);
        if completed == 0 || elapsed <= MIN_MEASURABLE_ELAPSED {
            return None;
        }

        let speed = completed as f64 / elapsed.as_secs_f64();
        if speed <= 0.0 {
            return None;
        }

        let remaining = total_planned.saturating_sub(completed);
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let stats = RunStatistics::new();
        stats.record_uploaded(100, Duration::from_secs(2));
        stats.record_uploaded(50, Duration::from_secs(1));
        stats.record_skipped();
        stats.record_missing();
        stats.record_deleted();
        stats.record_delete_failed();
        stats.record_directory_deleted();

        let s = stats.snapshot();
        assert_eq!(s.files_uploaded, 2);
        assert_eq!(s.bytes_uploaded, 150);
        assert_eq!(s.upload_duration, Duration::from_secs(3));
        assert_eq!(s.files_skipped, 1);
        assert_eq!(s.files_missing, 1);
        assert_eq!(s.files_deleted, 1);
        assert_eq!(s.deletes_failed, 1);
        assert_eq!(s.directories_deleted, 1);
        assert_eq!(s.average_upload_speed(), Some(50.0));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let stats = Arc::new(RunStatistics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_skipped();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().files_skipped, 4000);
    }

    #[test]
    fn test_first_byte_only_set_once() {
        let stats = RunStatistics::new();
        let t0 = Instant::now();
        stats.mark_first_byte(t0);
        stats.mark_first_byte(t0 + Duration::from_secs(5));
        assert_eq!(stats.snapshot().first_byte_at, Some(t0));
    }

    #[test]
    fn test_eta() {
        let stats = RunStatistics::new();
        let t0 = Instant::now();

        // 没有开始上传
        assert_eq!(stats.eta(1000, 0, None, t0), None);

        // 第一个文件传输中，以它的首字节为起点
        let eta = stats.eta(1000, 500, Some(t0), t0 + Duration::from_secs(1)).unwrap();
        assert!((eta.as_secs_f64() - 1.0).abs() < 1e-6);

        stats.mark_first_byte(t0);
        // 耗时太短
        assert_eq!(stats.eta(1000, 100, None, t0), None);
        // 没有字节
        assert_eq!(stats.eta(1000, 0, None, t0 + Duration::from_secs(1)), None);

        // 已完成 200 字节，用时 2 秒，剩余 800 字节 -> 8 秒
        stats.record_uploaded(100, Duration::from_secs(1));
        let eta = stats.eta(1000, 100, None, t0 + Duration::from_secs(2)).unwrap();
        assert!((eta.as_secs_f64() - 8.0).abs() < 1e-6);

        // 已提交的起点优先于当前文件的首字节时间
        let later = t0 + Duration::from_secs(1);
        let eta = stats.eta(1000, 100, Some(later), t0 + Duration::from_secs(2)).unwrap();
        assert!((eta.as_secs_f64() - 8.0).abs() < 1e-6);

        // 超出计划总量时不为负
        let eta = stats.eta(100, 100, None, t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(eta, Duration::ZERO);
    }

    #[test]
    fn test_sync_elapsed() {
        let stats = RunStatistics::new();
        let t0 = Instant::now();
        assert_eq!(stats.snapshot().sync_elapsed(t0), Duration::ZERO);
        stats.mark_sync_started(t0);
        assert_eq!(
            stats.snapshot().sync_elapsed(t0 + Duration::from_secs(3)),
            Duration::from_secs(3)
        );
    }
}
