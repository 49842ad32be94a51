//! Bunny.net 存储区后端
//!
//! 通过 Bunny Storage HTTP API 访问存储区：
//! - `GET <zone>/<dir>/` 列出目录（JSON 数组）
//! - `HEAD <zone>/<path>` 检查对象
//! - `PUT <zone>/<path>` 上传对象
//! - `DELETE <zone>/<path>` 删除对象，路径以 `/` 结尾时删除目录

use super::{
    encode_path, ByteStream, RemoteEntry, Storage, StorageError, StorageResult,
    EXISTS_TIMEOUT_SECS, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 最大重试次数
const MAX_RETRIES: u32 = 3;
/// 重试基础延迟（毫秒）
const RETRY_BASE_DELAY_MS: u64 = 1000;

/// 需要重试的状态码
const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// 目录列表中的对象
#[derive(Debug, Deserialize)]
struct BunnyObject {
    #[serde(rename = "ObjectName", default)]
    object_name: String,
    #[serde(rename = "IsDirectory", default)]
    is_directory: bool,
    #[serde(rename = "Length", default)]
    length: Option<f64>,
}

pub struct BunnyStorage {
    client: Client,
    base_url: String,
    name: String,
    retry_base_delay: Duration,
    io_timeout: Duration,
}

/// 上传活动记录，请求体每发出一块刷新一次
struct UploadActivity {
    last: Mutex<Instant>,
    finished: AtomicBool,
}

impl UploadActivity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            finished: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }
}

/// 包装请求体，记录最近一次被读取的时间
struct TrackedBody {
    inner: ByteStream,
    activity: Arc<UploadActivity>,
}

impl Stream for TrackedBody {
    type Item = std::io::Result<bytes::Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(_)) => self.activity.touch(),
            Poll::Ready(None) => {
                // 请求体发完后从这里开始计算等待响应的时间
                if !self.activity.finished.swap(true, Ordering::SeqCst) {
                    self.activity.touch();
                }
            }
            Poll::Pending => {}
        }
        polled
    }
}

/// 上传空闲超过 `limit` 时返回错误，传输持续进行时不会触发
async fn stall_watchdog(activity: &UploadActivity, limit: Duration) -> StorageError {
    let mut interval = tokio::time::interval((limit / 4).max(Duration::from_millis(10)));
    loop {
        interval.tick().await;
        let idle = activity.idle();
        if idle >= limit {
            let phase = if activity.finished.load(Ordering::SeqCst) {
                "等待响应"
            } else {
                "发送数据"
            };
            warn!("上传停滞 {:?}（{}）", idle, phase);
            return StorageError::Timeout;
        }
    }
}

impl BunnyStorage {
    pub fn new(storage_url: &str, api_key: &str) -> StorageResult<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key)
            .map_err(|e| StorageError::Transport(format!("无效的 API Key: {}", e)))?;
        headers.insert("AccessKey", key);

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(concat!("bunnysync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .build()?;

        let base_url = storage_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            name: format!("bunny:{}", base_url),
            base_url,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        })
    }

    /// 设置重试基础延迟
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// 设置上传空闲超时
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, encode_path(path.trim_start_matches('/')))
    }

    /// 发送请求，对临时性错误做指数退避重试
    ///
    /// 只用于可重复构造的请求（不含流式请求体）。
    async fn send_with_retry<F>(&self, build: F) -> StorageResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let result = build().send().await;

            let retryable = match &result {
                Ok(resp) => RETRY_STATUSES.contains(&resp.status().as_u16()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };

            if !retryable || attempt >= MAX_RETRIES {
                return Ok(result?);
            }

            let delay = self.retry_base_delay * 2_u32.pow(attempt);
            match &result {
                Ok(resp) => warn!(
                    "请求返回 {}，{}ms 后重试 ({}/{})",
                    resp.status(),
                    delay.as_millis(),
                    attempt + 1,
                    MAX_RETRIES
                ),
                Err(e) => warn!(
                    "请求失败，{}ms 后重试 ({}/{}): {}",
                    delay.as_millis(),
                    attempt + 1,
                    MAX_RETRIES,
                    e
                ),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn delete_status(path: &str, status: StatusCode) -> StorageResult<()> {
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!("已删除: {} ({})", path, status);
            Ok(())
        } else {
            Err(StorageError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl Storage for BunnyStorage {
    async fn list(&self, dir: &str) -> StorageResult<Vec<RemoteEntry>> {
        let dir = dir.trim_matches('/');
        let url = if dir.is_empty() {
            format!("{}/", self.base_url)
        } else {
            format!("{}/{}/", self.base_url, encode_path(dir))
        };

        let resp = self
            .send_with_retry(|| {
                self.client
                    .get(&url)
                    .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            })
            .await?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(dir.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Status(status.as_u16()));
        }

        let raw = resp.bytes().await?;
        let body: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Transport(format!("目录列表解析失败: {}", e)))?;
        let Some(items) = body.as_array() else {
            warn!("目录列表格式异常: {}", url);
            return Ok(Vec::new());
        };

        let entries = items
            .iter()
            .filter_map(|item| match serde_json::from_value::<BunnyObject>(item.clone()) {
                Ok(obj) => Some(obj),
                Err(e) => {
                    warn!("忽略无法解析的列表项 ({}): {} - {}", url, item, e);
                    None
                }
            })
            .filter(|obj| !obj.object_name.is_empty())
            .map(|obj| RemoteEntry {
                name: obj.object_name,
                is_dir: obj.is_directory,
                length: obj.length.filter(|l| *l > 0.0).map(|l| l as u64).unwrap_or(0),
            })
            .collect();

        Ok(entries)
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let url = self.url(path);
        let resp = self
            .send_with_retry(|| {
                self.client
                    .head(&url)
                    .timeout(Duration::from_secs(EXISTS_TIMEOUT_SECS))
            })
            .await?;
        Ok(resp.status() == StatusCode::OK)
    }

    async fn put(&self, path: &str, body: ByteStream, content_length: u64) -> StorageResult<()> {
        let url = self.url(path);

        let activity = Arc::new(UploadActivity::new());
        let body = TrackedBody {
            inner: body,
            activity: activity.clone(),
        };

        // 流式请求体只能发送一次，不做重试；超时按空闲时间计算，不限制总时长
        let send = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(body))
            .send();

        let resp = tokio::select! {
            resp = send => resp?,
            err = stall_watchdog(&activity, self.io_timeout) => return Err(err),
        };

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StorageError::Status(status.as_u16()))
        }
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let url = self.url(path);
        let resp = self
            .send_with_retry(|| {
                self.client
                    .delete(&url)
                    .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            })
            .await?;
        Self::delete_status(path, resp.status())
    }

    async fn delete_dir(&self, path: &str) -> StorageResult<()> {
        let dir_path = format!("{}/", path.trim_end_matches('/'));
        let url = self.url(&dir_path);
        let resp = self
            .send_with_retry(|| {
                self.client
                    .delete(&url)
                    .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            })
            .await?;
        Self::delete_status(&dir_path, resp.status())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
