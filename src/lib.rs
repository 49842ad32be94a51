pub mod config;
pub mod core;
pub mod error;
pub mod format;
pub mod logging;
pub mod storage;

pub use config::SyncConfig;
pub use crate::core::{Outcome, SyncEngine, SyncReport};
pub use error::SyncError;

/// 应用名，用于缓存、日志和配置目录
pub const APP_NAME: &str = "bunnysync";

/// 平台目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("USERPROFILE").ok().map(PathBuf::from)
        } else {
            std::env::var("HOME").ok().map(PathBuf::from)
        }
    }

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            home_dir().map(|h| h.join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| home_dir().map(|h| h.join(".config")))
        }
    }

    pub fn cache_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            home_dir().map(|h| h.join("Library").join("Caches"))
        } else {
            // Linux
            std::env::var("XDG_CACHE_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| home_dir().map(|h| h.join(".cache")))
        }
    }
}
