//! 日志模块 - 文件日志（按大小轮转）和可选的控制台输出

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// 日志文件名
pub const LOG_FILE_NAME: &str = "bunnysync.log";

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb", alias = "max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

struct WriterState {
    writer: Option<BufWriter<File>>,
    written: u64,
}

/// 带大小限制的日志写入器，超过上限时把当前文件改名为 `.old`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    state: Arc<Mutex<WriterState>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;

        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            state: Arc::new(Mutex::new(WriterState {
                writer: Some(writer),
                written,
            })),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 已有文件超过限制时先轮转
        let mut existing = fs::metadata(file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            Self::rotate_log(file_path)?;
            existing = 0;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok((BufWriter::new(file), existing))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 单次日志事件的写入句柄
pub struct LogWriter {
    owner: SizeRotatingWriter,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.owner.lock();

        if state.written > self.owner.max_size {
            if let Some(mut w) = state.writer.take() {
                let _ = w.flush();
            }
            let _ = SizeRotatingWriter::rotate_log(&self.owner.file_path);
            let (writer, written) =
                SizeRotatingWriter::open_file(&self.owner.file_path, self.owner.max_size)?;
            state.writer = Some(writer);
            state.written = written;
        }

        let Some(writer) = state.writer.as_mut() else {
            return Err(io::Error::other("日志文件不可用"));
        };
        let n = writer.write(buf)?;
        writer.flush()?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.owner.lock().writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            owner: self.clone(),
        }
    }
}

/// 日志目录
pub fn get_log_dir() -> PathBuf {
    crate::dirs::cache_dir()
        .map(|p| p.join(crate::APP_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", crate::APP_NAME)))
        .join("logs")
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    let level = config.tracing_level();
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }
    filter
}

/// 初始化日志
///
/// 文件日志按配置开关；`verbose` 时同时输出到 stderr。
/// 返回日志文件路径（未启用文件日志时为 `None`）。
pub fn init_logging(log_dir: &Path, config: &LogConfig, verbose: bool) -> Option<PathBuf> {
    let file_writer = if config.enabled {
        match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
            Ok(w) => Some(w),
            Err(e) => {
                eprintln!("无法创建日志文件 {}: {}", log_dir.display(), e);
                None
            }
        }
    } else {
        None
    };
    let log_path = file_writer.as_ref().map(|w| w.file_path().to_path_buf());

    let file_layer = file_writer.map(|w| {
        tracing_subscriber::fmt::layer()
            .with_writer(w)
            .with_ansi(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    let console_layer = verbose.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(file_layer)
        .with(console_layer)
        .try_init();

    log_path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults_and_aliases() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LogConfig::default());

        let config: LogConfig =
            serde_json::from_str(r#"{"level": "DEBUG", "max_size_mb": 2}"#).unwrap();
        assert_eq!(config.max_size_mb, 2);
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);

        let config: LogConfig = serde_json::from_str(r#"{"level": "loud"}"#).unwrap();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_writer_rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();

        let chunk = vec![b'x'; 64 * 1024];
        let mut w = writer.make_writer();
        for _ in 0..17 {
            w.write_all(&chunk).unwrap();
        }
        // 超过 1MB 后的下一次写入触发轮转
        w.write_all(b"after rotation\n").unwrap();
        w.flush().unwrap();

        let current = fs::read(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(current, b"after rotation\n");
        let old = fs::metadata(dir.path().join("bunnysync.log.old")).unwrap();
        assert_eq!(old.len(), 17 * 64 * 1024);
    }

    #[test]
    fn test_existing_oversized_file_rotated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        fs::write(&path, vec![b'y'; 1024 * 1024 + 1]).unwrap();

        let _writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(dir.path().join("bunnysync.log.old").exists());
    }
}
