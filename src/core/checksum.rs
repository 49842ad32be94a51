//! 文件指纹计算
//!
//! 小文件做完整 MD5；大文件在开启快速校验时只采样头、中、尾三段，
//! 并把文件大小和修改时间（秒）一起参与哈希。采样只覆盖三段，
//! 大文件内部未被采样区域的修改不会被发现，这是快速校验的代价。

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

/// 超过此大小使用采样指纹（10 MiB）
pub const FAST_CHECKSUM_THRESHOLD: u64 = 10 * 1024 * 1024;
/// 完整哈希的读取块大小（1 MiB）
pub const READ_CHUNK_SIZE: usize = 1024 * 1024;
/// 采样块大小（64 KiB）
pub const SAMPLE_SIZE: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("无法读取文件 {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ChecksumError {
    fn unreadable(path: &Path, source: io::Error) -> Self {
        ChecksumError::Unreadable {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 指纹策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStrategy {
    /// 始终完整哈希
    Full,
    /// 大文件采样哈希
    Sampled,
}

impl ChecksumStrategy {
    pub fn from_fast_checksum(fast: bool) -> Self {
        if fast {
            ChecksumStrategy::Sampled
        } else {
            ChecksumStrategy::Full
        }
    }
}

/// 计算文件指纹
///
/// `size_hint` 用于选择策略，采样时以实际 stat 结果为准。
pub fn fingerprint(
    path: &Path,
    size_hint: u64,
    strategy: ChecksumStrategy,
) -> Result<String, ChecksumError> {
    match strategy {
        ChecksumStrategy::Sampled if size_hint >= FAST_CHECKSUM_THRESHOLD => sampled_checksum(path),
        _ => full_checksum(path),
    }
}

/// 完整 MD5
pub fn full_checksum(path: &Path) -> Result<String, ChecksumError> {
    let mut file = File::open(path).map_err(|e| ChecksumError::unreadable(path, e))?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChecksumError::unreadable(path, e)),
        };
        ctx.consume(&buf[..n]);
    }

    Ok(format!("{:x}", ctx.compute()))
}

/// 采样指纹，读取失败时回退到完整哈希
pub fn sampled_checksum(path: &Path) -> Result<String, ChecksumError> {
    match try_sampled(path) {
        Ok(Some(sum)) => Ok(sum),
        // 实际大小低于阈值
        Ok(None) => full_checksum(path),
        Err(e) => {
            warn!("快速校验失败，回退到完整校验 '{}': {}", path.display(), e);
            full_checksum(path)
        }
    }
}

fn try_sampled(path: &Path) -> io::Result<Option<String>> {
    let meta = std::fs::metadata(path)?;
    let size = meta.len();
    if size < FAST_CHECKSUM_THRESHOLD {
        return Ok(None);
    }
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut ctx = md5::Context::new();
    ctx.consume(format!("{}:{}", size, mtime).as_bytes());

    let mut file = File::open(path)?;
    let mut buf = vec![0u8; SAMPLE_SIZE as usize];

    // 头部
    let n = read_up_to(&mut file, &mut buf)?;
    ctx.consume(&buf[..n]);

    // 中部
    if size > SAMPLE_SIZE * 2 {
        file.seek(SeekFrom::Start(size / 2))?;
        let n = read_up_to(&mut file, &mut buf)?;
        ctx.consume(&buf[..n]);
    }

    // 尾部
    if size > SAMPLE_SIZE {
        file.seek(SeekFrom::End(-(SAMPLE_SIZE as i64)))?;
        let n = read_up_to(&mut file, &mut buf)?;
        ctx.consume(&buf[..n]);
    }

    Ok(Some(format!("{:x}", ctx.compute())))
}

/// 尽量读满缓冲区，遇到 EOF 提前返回
fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
