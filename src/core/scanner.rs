use crate::error::SyncError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 默认排除的文件名
pub fn default_excluded_files() -> Vec<String> {
    [".DS_Store", "._.DS_Store", "Thumbs.db", ".AppleDouble"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// 按文件名排除的规则，支持 `*` 通配符
#[derive(Debug, Clone, Default)]
pub struct ExcludeRules {
    names: Vec<String>,
    patterns: Vec<regex::Regex>,
}

impl ExcludeRules {
    pub fn new(entries: &[String]) -> Self {
        let mut rules = Self::default();
        for entry in entries {
            if entry.contains('*') {
                let pattern = regex::escape(entry).replace("\\*", ".*");
                match regex::Regex::new(&format!("^{}$", pattern)) {
                    Ok(re) => rules.patterns.push(re),
                    Err(e) => warn!("无效的排除规则 '{}': {}", entry, e),
                }
            } else {
                rules.names.push(entry.clone());
            }
        }
        rules
    }

    /// 检查路径是否应该被排除（只看最后一段文件名）
    pub fn is_excluded(&self, path: &str) -> bool {
        let basename = path.rsplit(['/', '\\']).next().unwrap_or(path);
        self.names.iter().any(|n| n == basename) || self.patterns.iter().any(|re| re.is_match(basename))
    }
}

/// 本地文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

/// 本地文件元数据
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalMeta {
    pub size: u64,
    /// 修改时间（Unix 秒，带小数）
    pub mtime: f64,
}

/// 读取文件大小和修改时间
pub fn file_meta(path: &Path) -> std::io::Result<LocalMeta> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "不是普通文件",
        ));
    }
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(LocalMeta {
        size: meta.len(),
        mtime,
    })
}

/// 本地文件清单，保持扫描顺序
#[derive(Debug, Clone, Default)]
pub struct LocalInventory {
    files: Vec<LocalFile>,
    index: HashMap<String, usize>,
    total_bytes: u64,
}

impl LocalInventory {
    pub fn insert(&mut self, file: LocalFile) {
        if self.index.contains_key(&file.relative_path) {
            return;
        }
        self.index.insert(file.relative_path.clone(), self.files.len());
        self.files.push(file);
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.index.contains_key(relative_path)
    }

    pub fn get(&self, relative_path: &str) -> Option<&Path> {
        self.index
            .get(relative_path)
            .map(|&i| self.files[i].absolute_path.as_path())
    }

    pub fn files(&self) -> &[LocalFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 扫描时统计的总大小
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// 本地目录扫描器
pub struct FileScanner {
    excludes: ExcludeRules,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl FileScanner {
    pub fn new(excludes: ExcludeRules) -> Self {
        Self {
            excludes,
            cancel_flag: None,
        }
    }

    /// 设置取消标志
    pub fn with_cancel(mut self, cancel_flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(cancel_flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// 递归扫描源目录
    pub fn scan(&self, root: &Path) -> Result<LocalInventory, SyncError> {
        if !root.is_dir() {
            return Err(SyncError::SourceMissing(root.to_path_buf()));
        }

        info!("开始扫描本地目录: {}", root.display());

        let mut inventory = LocalInventory::default();
        let mut seen = 0usize;
        let mut excluded = 0usize;

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
        {
            seen += 1;
            if seen % 100 == 0 && self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("扫描出错，跳过: {}", e);
                    continue;
                }
            };

            // 指向文件的符号链接按文件处理，指向目录的不进入
            let is_file = if entry.path_is_symlink() {
                entry.path().is_file()
            } else {
                entry.file_type().is_file()
            };
            if !is_file {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                warn!("文件名不是有效的 UTF-8，跳过: {}", entry.path().display());
                continue;
            };
            let relative_path = relative.replace('\\', "/");

            if self.excludes.is_excluded(&relative_path) {
                debug!("排除文件: {}", relative_path);
                excluded += 1;
                continue;
            }

            // 获取不到大小时只影响统计
            if let Ok(meta) = std::fs::metadata(entry.path()) {
                inventory.total_bytes += meta.len();
            }

            inventory.insert(LocalFile {
                relative_path,
                absolute_path: entry.path().to_path_buf(),
            });
        }

        info!(
            "扫描完成: {} 个文件 ({} 字节), {} 个被排除",
            inventory.len(),
            inventory.total_bytes,
            excluded
        );

        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_exclude_rules() {
        let rules = ExcludeRules::new(&[".DS_Store".to_string(), "*.tmp".to_string()]);
        assert!(rules.is_excluded(".DS_Store"));
        assert!(rules.is_excluded("photos/.DS_Store"));
        assert!(rules.is_excluded("a/b/c.tmp"));
        assert!(!rules.is_excluded("a/b/c.tmpl"));
        assert!(!rules.is_excluded("x.DS_Store"));
        // 规则只作用于文件名
        assert!(!rules.is_excluded(".DS_Store/real.txt"));
    }

    #[test]
    fn test_scan_collects_relative_paths_in_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.txt", b"bb");
        touch(dir.path(), "a/1.txt", b"1");
        touch(dir.path(), "a/.DS_Store", b"junk");
        touch(dir.path(), "Thumbs.db", b"junk");

        let scanner = FileScanner::new(ExcludeRules::new(&default_excluded_files()));
        let inventory = scanner.scan(dir.path()).unwrap();

        let paths: Vec<_> = inventory
            .files()
            .iter()
            .map(|f| f.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["a/1.txt", "b.txt"]);
        assert_eq!(inventory.total_bytes(), 3);
        assert_eq!(inventory.get("b.txt"), Some(dir.path().join("b.txt").as_path()));
        assert!(!inventory.contains("Thumbs.db"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_follows_file_symlinks_only() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        touch(outside.path(), "real.css", b"body{}");
        touch(outside.path(), "shared/inner.txt", b"inner");
        touch(dir.path(), "index.html", b"<html>");
        std::os::unix::fs::symlink(outside.path().join("real.css"), dir.path().join("site.css")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("shared"), dir.path().join("shared")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone.txt"), dir.path().join("dangling.txt")).unwrap();

        let inventory = FileScanner::new(ExcludeRules::default()).scan(dir.path()).unwrap();

        let paths: Vec<_> = inventory
            .files()
            .iter()
            .map(|f| f.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["index.html", "site.css"]);
        assert_eq!(inventory.total_bytes(), 12);
        assert_eq!(file_meta(inventory.get("site.css").unwrap()).unwrap().size, 6);
    }

    #[test]
    fn test_scan_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = FileScanner::new(ExcludeRules::default());
        let err = scanner.scan(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, SyncError::SourceMissing(_)));
    }

    #[test]
    fn test_scan_honours_cancel_flag() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..150 {
            touch(dir.path(), &format!("f{:03}.txt", i), b"x");
        }
        let flag = Arc::new(AtomicBool::new(true));
        let scanner = FileScanner::new(ExcludeRules::default()).with_cancel(flag);
        assert!(matches!(scanner.scan(dir.path()), Err(SyncError::Cancelled)));
    }

    #[test]
    fn test_file_meta() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.txt", b"hello");
        let meta = file_meta(&dir.path().join("a.txt")).unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.mtime > 0.0);
        assert!(file_meta(dir.path()).is_err());
    }
}
