//! 应用配置模块

use crate::core::{default_excluded_files, ChecksumStrategy, ListingPolicy, SyncOptions};
use crate::logging::LogConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 默认配置文件名
pub const CONFIG_FILE_NAME: &str = "config.json";

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// 本地源目录
    #[serde(default, alias = "src_dir")]
    pub src_dir: String,
    /// 存储区地址，`file://` 开头时使用本地目录
    #[serde(default, alias = "bunny_storage_url")]
    pub storage_url: String,
    #[serde(default, alias = "bunny_api_key")]
    pub api_key: String,
    /// 校验和缓存目录，为空时使用系统缓存目录
    #[serde(default, alias = "cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_excluded_files", alias = "excluded_files")]
    pub excluded_files: Vec<String>,
    /// 大文件使用采样校验
    #[serde(default = "default_true", alias = "fast_checksum")]
    pub fast_checksum: bool,
    #[serde(default = "default_true", alias = "parallel_analysis")]
    pub parallel_analysis: bool,
    /// 远程目录列表失败时终止
    #[serde(default, alias = "strict_listing")]
    pub strict_listing: bool,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            src_dir: String::new(),
            storage_url: String::new(),
            api_key: String::new(),
            cache_dir: String::new(),
            excluded_files: default_excluded_files(),
            fast_checksum: true,
            parallel_analysis: true,
            strict_listing: false,
            log: LogConfig::default(),
        }
    }
}

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub src_dir: Option<String>,
    pub api_key: Option<String>,
    pub storage_url: Option<String>,
    pub cache_dir: Option<String>,
}

impl SyncConfig {
    /// 查找并加载配置文件
    pub fn load(config_file: &str) -> Result<Self> {
        let path = Self::locate(config_file)?;
        Self::load_from(&path)
    }

    /// 从指定路径加载
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .with_context(|| format!("配置文件 {} 不是有效的 JSON", path.display()))?;
        tracing::debug!("已加载配置: {}", path.display());
        Ok(config)
    }

    /// 只有文件名时依次在当前目录、程序目录和用户主目录中查找
    pub fn locate(config_file: &str) -> Result<PathBuf> {
        let given = Path::new(config_file);
        let has_dir = given
            .parent()
            .is_some_and(|p| !p.as_os_str().is_empty());
        if has_dir {
            return Ok(expand_tilde(config_file));
        }

        let candidates = search_paths(config_file);
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return Ok(found.clone());
        }

        let locations = candidates
            .iter()
            .map(|p| format!("  {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(
            "找不到配置文件 '{}'，已搜索以下位置:\n{}",
            config_file,
            locations
        )
    }

    /// 应用命令行覆盖
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.src_dir {
            self.src_dir = v;
        }
        if let Some(v) = overrides.api_key {
            self.api_key = v;
        }
        if let Some(v) = overrides.storage_url {
            self.storage_url = v;
        }
        if let Some(v) = overrides.cache_dir {
            self.cache_dir = v;
        }
    }

    pub fn uses_local_storage(&self) -> bool {
        self.storage_url.starts_with("file://")
    }

    /// 检查必填项
    pub fn validate(&self) -> Result<()> {
        if self.src_dir.trim().is_empty() {
            bail!("未配置源目录 (srcDir)");
        }
        if self.storage_url.trim().is_empty() {
            bail!("未配置存储地址 (storageUrl)");
        }
        if !self.uses_local_storage() && self.api_key.trim().is_empty() {
            bail!("未配置 API 密钥 (apiKey)");
        }
        Ok(())
    }

    pub fn source_dir(&self) -> PathBuf {
        expand_tilde(&self.src_dir)
    }

    /// 校验和缓存目录
    pub fn resolved_cache_dir(&self) -> PathBuf {
        if self.cache_dir.trim().is_empty() {
            default_cache_dir()
        } else {
            expand_tilde(&self.cache_dir)
        }
    }

    /// 转换为引擎选项
    pub fn sync_options(&self, dry_run: bool) -> SyncOptions {
        SyncOptions {
            source_dir: self.source_dir(),
            excluded_files: self.excluded_files.clone(),
            checksum_strategy: ChecksumStrategy::from_fast_checksum(self.fast_checksum),
            parallel_analysis: self.parallel_analysis,
            listing_policy: if self.strict_listing {
                ListingPolicy::Strict
            } else {
                ListingPolicy::BestEffort
            },
            dry_run,
        }
    }
}

/// 配置文件搜索路径（去重，保持顺序）
pub fn search_paths(file_name: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(file_name));
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
    {
        paths.push(exe_dir.join(file_name));
    }
    if let Some(home) = crate::dirs::home_dir() {
        paths.push(home.join(file_name));
    }
    if let Some(config_dir) = crate::dirs::config_dir() {
        paths.push(config_dir.join(crate::APP_NAME).join(file_name));
    }

    let mut unique: Vec<PathBuf> = Vec::with_capacity(paths.len());
    for p in paths {
        if !unique.contains(&p) {
            unique.push(p);
        }
    }
    unique
}

/// 默认缓存目录
pub fn default_cache_dir() -> PathBuf {
    crate::dirs::cache_dir()
        .map(|p| p.join(crate::APP_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", crate::APP_NAME)))
        .join("checksums")
}

/// 展开开头的 `~`
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = crate::dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = crate::dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_and_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"srcDir": "/data/site", "storageUrl": "https://storage.bunnycdn.com/zone", "apiKey": "k"}"#,
        )
        .unwrap();
        assert_eq!(config.src_dir, "/data/site");
        assert!(config.fast_checksum);
        assert!(config.parallel_analysis);
        assert!(!config.strict_listing);
        assert_eq!(config.excluded_files, default_excluded_files());
        assert!(config.log.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_legacy_snake_case_keys() {
        let config: SyncConfig = serde_json::from_str(
            r#"{
                "src_dir": "/src",
                "bunny_storage_url": "https://storage.bunnycdn.com/zone",
                "bunny_api_key": "secret",
                "cache_dir": "/tmp/cache",
                "excluded_files": ["*.tmp"],
                "fast_checksum": false,
                "parallel_analysis": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.storage_url, "https://storage.bunnycdn.com/zone");
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.excluded_files, vec!["*.tmp".to_string()]);
        assert!(!config.fast_checksum);

        let options = config.sync_options(true);
        assert_eq!(options.checksum_strategy, ChecksumStrategy::Full);
        assert!(!options.parallel_analysis);
        assert!(options.dry_run);
        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/tmp/cache"));
    }

    #[test]
    fn test_overrides_and_validation() {
        let mut config = SyncConfig::default();
        assert!(config.validate().is_err());

        config.apply_overrides(ConfigOverrides {
            src_dir: Some("/src".to_string()),
            storage_url: Some("file:///mnt/mirror".to_string()),
            ..Default::default()
        });
        // 本地存储不需要 API 密钥
        config.validate().unwrap();

        config.storage_url = "https://storage.bunnycdn.com/zone".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("apiKey"));
    }

    #[test]
    fn test_locate_explicit_path_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        fs::write(&path, r#"{"srcDir": "/s", "storageUrl": "file:///d"}"#).unwrap();

        let found = SyncConfig::locate(path.to_str().unwrap()).unwrap();
        assert_eq!(found, path);
        let config = SyncConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.storage_url, "file:///d");

        let err = SyncConfig::locate("bunnysync-no-such-config-9f3a.json").unwrap_err();
        assert!(err.to_string().contains("bunnysync-no-such-config-9f3a.json"));
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        assert!(SyncConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = crate::dirs::home_dir() {
            assert_eq!(expand_tilde("~/x"), home.join("x"));
        }
    }
}
