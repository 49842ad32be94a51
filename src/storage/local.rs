use super::{ByteStream, RemoteEntry, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// 写入中的临时文件放在存储根目录下的这个目录里，列表时隐藏
pub const STAGING_DIR: &str = ".bunnysync-tmp";

/// 以本地目录作为远程存储（挂载卷、测试）
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> StorageResult<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list(&self, dir: &str) -> StorageResult<Vec<RemoteEntry>> {
        let full_path = self.resolve_path(dir);
        let is_root = full_path == self.base_path;

        let mut read_dir = match fs::read_dir(&full_path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(dir.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_root && name == STAGING_DIR {
                continue;
            }
            entries.push(RemoteEntry {
                name,
                is_dir: metadata.is_dir(),
                length: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, mut body: ByteStream, _content_length: u64) -> StorageResult<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写到暂存目录，然后原子重命名；暂存目录与目标在同一文件系统
        let staging = self.base_path.join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        let temp_path = staging.join(format!("{}.partial", uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(data) => file.write_all(&data).await?,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e.into());
                }
            }
        }
        file.flush().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_dir(&self, path: &str) -> StorageResult<()> {
        let full_path = self.resolve_path(path);
        if full_path == self.base_path {
            return Err(StorageError::Transport("拒绝删除存储根目录".to_string()));
        }
        // 只删除空目录，目录里还有对象时报错
        match fs::remove_dir(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
