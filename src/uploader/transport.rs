// 分片传输
//
// 每个分片一次网络请求，携带分片数据和元信息（文件名、目标路径、分片索引、分片总数、覆盖标记）
// 传输过程中上报该分片的字节级进度
//
// 重试策略：
// - 仅对可重试错误（网络、超时、服务器错误、限流）重试
// - 最多 max_retries 次额外尝试，指数退避
// - 分片按"至少一次"语义传输，服务端需能接受同一 (path, index) 的重复上传

use crate::uploader::error::{TransportError, UploadErrorKind};
use crate::uploader::source::ChunkSource;
use crate::uploader::task::UploadManifest;
use crate::uploader::ChunkTask;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试配置
// =====================================================

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的额外等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - 最大: 5000ms
fn calculate_backoff_delay(retry_count: u32, error_kind: UploadErrorKind) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let delay = base_delay.min(MAX_BACKOFF_MS);

    if error_kind == UploadErrorKind::RateLimited {
        delay.max(RATE_LIMIT_BACKOFF_MS)
    } else {
        delay
    }
}

// =====================================================
// 上传端点
// =====================================================

/// 分片进度回调（单个分片的百分比 0-100）
pub type ChunkProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// 小文件直传请求
///
/// 不预先读取文件内容，由端点从数据源分段读取后流式发送
#[derive(Clone)]
pub struct DirectUploadRequest {
    pub destination_path: String,
    pub file_name: String,
    pub overwrite: bool,
    pub source: Arc<dyn ChunkSource>,
}

impl DirectUploadRequest {
    pub fn size(&self) -> u64 {
        self.source.len()
    }
}

impl fmt::Debug for DirectUploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectUploadRequest")
            .field("destination_path", &self.destination_path)
            .field("file_name", &self.file_name)
            .field("overwrite", &self.overwrite)
            .field("size", &self.size())
            .finish()
    }
}

/// 分片上传请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub destination_path: String,
    pub file_name: String,
    pub index: usize,
    pub total_chunks: usize,
    pub overwrite: bool,
    pub data: Bytes,
}

/// 远端上传端点
///
/// 包含小文件直传、分片上传、分片合并三个接口
#[async_trait]
pub trait UploadEndpoint: Send + Sync {
    /// 小文件单次上传，发送过程中通过 `on_progress` 上报进度
    async fn upload_direct(
        &self,
        request: DirectUploadRequest,
        on_progress: ChunkProgressFn,
    ) -> Result<(), TransportError>;

    /// 上传单个分片，发送过程中通过 `on_progress` 上报进度
    async fn upload_chunk(
        &self,
        request: ChunkRequest,
        on_progress: ChunkProgressFn,
    ) -> Result<(), TransportError>;

    /// 合并分片
    async fn merge_chunks(&self, manifest: &UploadManifest) -> Result<(), TransportError>;
}

// =====================================================
// 分片传输
// =====================================================

/// 分片共享上下文（同一任务的所有分片共用）
#[derive(Clone)]
pub struct ChunkContext {
    pub source: Arc<dyn ChunkSource>,
    pub destination_path: String,
    pub file_name: String,
    pub total_chunks: usize,
    pub overwrite: bool,
}

/// 分片传输器
pub struct ChunkTransport {
    endpoint: Arc<dyn UploadEndpoint>,
    max_retries: u32,
}

impl ChunkTransport {
    pub fn new(endpoint: Arc<dyn UploadEndpoint>, max_retries: u32) -> Self {
        Self {
            endpoint,
            max_retries,
        }
    }

    /// 传输单个分片
    ///
    /// 成功时最后一次进度回调一定为 100
    pub async fn transmit(
        &self,
        ctx: &ChunkContext,
        task: &ChunkTask,
        on_progress: ChunkProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::cancelled());
        }

        debug!(
            "[分片#{}] 开始上传 (范围: {}-{}, 大小: {} bytes)",
            task.index,
            task.range.start,
            task.range.end,
            task.size()
        );

        let data = ctx.source.read_range(task.range.clone()).await?;

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let request = ChunkRequest {
                destination_path: ctx.destination_path.clone(),
                file_name: ctx.file_name.clone(),
                index: task.index,
                total_chunks: ctx.total_chunks,
                overwrite: ctx.overwrite,
                data: data.clone(),
            };

            // 每次尝试单独保证进度单调；重试从 0 重新开始
            let monotonic = monotonic_progress(on_progress.clone());
            monotonic(0);

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransportError::cancelled()),
                r = self.endpoint.upload_chunk(request, monotonic) => r,
            };

            match result {
                Ok(()) => {
                    on_progress(100);
                    info!("[分片#{}] ✓ 上传成功 ({} bytes)", task.index, task.size());
                    return Ok(());
                }
                Err(e) if e.kind == UploadErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    if !e.is_retriable() {
                        error!(
                            "[分片#{}] 上传失败（不可重试）: {:?}, 错误: {}",
                            task.index, e.kind, e
                        );
                        return Err(e);
                    }

                    if attempt < self.max_retries {
                        let backoff_ms = calculate_backoff_delay(attempt, e.kind);
                        warn!(
                            "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
                            task.index,
                            backoff_ms,
                            attempt + 1,
                            self.max_retries,
                            e
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(TransportError::cancelled()),
                            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        }
                    }

                    last_error = Some(e);
                }
            }
        }

        error!(
            "[分片#{}] 上传失败，已达最大重试次数 ({})",
            task.index, self.max_retries
        );

        Err(last_error
            .unwrap_or_else(|| TransportError::new(UploadErrorKind::Unknown, "分片上传失败")))
    }
}

/// 过滤回退的进度值，保证单次尝试内进度单调不减
fn monotonic_progress(inner: ChunkProgressFn) -> ChunkProgressFn {
    let high_water = Mutex::new(None::<u8>);
    Arc::new(move |percent: u8| {
        let percent = percent.min(100);
        let mut last = high_water.lock();
        if last.is_some_and(|l| percent < l) {
            return;
        }
        *last = Some(percent);
        inner(percent);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::source::MemorySource;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// 前 `failures` 次返回指定错误，之后成功
    struct FlakyEndpoint {
        failures: u32,
        kind: UploadErrorKind,
        calls: AtomicU32,
        received: StdMutex<Vec<(usize, usize, Vec<u8>)>>,
    }

    impl FlakyEndpoint {
        fn new(failures: u32, kind: UploadErrorKind) -> Self {
            Self {
                failures,
                kind,
                calls: AtomicU32::new(0),
                received: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UploadEndpoint for FlakyEndpoint {
        async fn upload_direct(
            &self,
            _request: DirectUploadRequest,
            _on_progress: ChunkProgressFn,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn upload_chunk(
            &self,
            request: ChunkRequest,
            on_progress: ChunkProgressFn,
        ) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            on_progress(40);
            // 回退值应被过滤
            on_progress(10);
            if call < self.failures {
                return Err(TransportError::new(self.kind, "boom"));
            }
            on_progress(90);
            self.received.lock().unwrap().push((
                request.index,
                request.total_chunks,
                request.data.to_vec(),
            ));
            Ok(())
        }

        async fn merge_chunks(&self, _manifest: &UploadManifest) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn context(total_chunks: usize) -> ChunkContext {
        ChunkContext {
            source: Arc::new(MemorySource::new(b"abcdefghij".to_vec())),
            destination_path: "docs".to_string(),
            file_name: "letters.txt".to_string(),
            total_chunks,
            overwrite: false,
        }
    }

    fn recorder() -> (ChunkProgressFn, Arc<StdMutex<Vec<u8>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |p: u8| sink.lock().unwrap().push(p)), seen)
    }

    #[test]
    fn test_calculate_backoff_delay() {
        assert_eq!(calculate_backoff_delay(0, UploadErrorKind::Network), 100);
        assert_eq!(calculate_backoff_delay(1, UploadErrorKind::Network), 200);
        assert_eq!(calculate_backoff_delay(2, UploadErrorKind::Network), 400);
        assert_eq!(calculate_backoff_delay(10, UploadErrorKind::Network), 5000);
        assert_eq!(calculate_backoff_delay(0, UploadErrorKind::RateLimited), 10000);
    }

    #[tokio::test]
    async fn test_transmit_sends_chunk_bytes_and_reports_100() {
        let endpoint = Arc::new(FlakyEndpoint::new(0, UploadErrorKind::Network));
        let transport = ChunkTransport::new(endpoint.clone(), 0);
        let (progress, seen) = recorder();

        let task = ChunkTask::new(1, 4..8);
        transport
            .transmit(&context(3), &task, progress, &CancellationToken::new())
            .await
            .unwrap();

        let received = endpoint.received.lock().unwrap();
        assert_eq!(received.as_slice(), &[(1, 3, b"efgh".to_vec())]);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![0, 40, 90, 100]);
    }

    #[tokio::test]
    async fn test_transmit_retries_retriable_errors() {
        let endpoint = Arc::new(FlakyEndpoint::new(2, UploadErrorKind::ServerError));
        let transport = ChunkTransport::new(endpoint.clone(), 2);
        let (progress, _) = recorder();

        let task = ChunkTask::new(0, 0..4);
        transport
            .transmit(&context(1), &task, progress, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transmit_gives_up_after_max_retries() {
        let endpoint = Arc::new(FlakyEndpoint::new(5, UploadErrorKind::Timeout));
        let transport = ChunkTransport::new(endpoint.clone(), 1);
        let (progress, seen) = recorder();

        let task = ChunkTask::new(0, 0..4);
        let err = transport
            .transmit(&context(1), &task, progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::Timeout);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
        assert!(!seen.lock().unwrap().contains(&100));
    }

    #[tokio::test]
    async fn test_transmit_does_not_retry_fatal_errors() {
        let endpoint = Arc::new(FlakyEndpoint::new(1, UploadErrorKind::Rejected));
        let transport = ChunkTransport::new(endpoint.clone(), 3);
        let (progress, _) = recorder();

        let task = ChunkTask::new(0, 0..4);
        let err = transport
            .transmit(&context(1), &task, progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::Rejected);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transmit_cancelled_before_start() {
        let endpoint = Arc::new(FlakyEndpoint::new(0, UploadErrorKind::Network));
        let transport = ChunkTransport::new(endpoint.clone(), 0);
        let (progress, _) = recorder();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transport
            .transmit(&context(1), &ChunkTask::new(0, 0..4), progress, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::Cancelled);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transmit_reports_source_errors() {
        let endpoint = Arc::new(FlakyEndpoint::new(0, UploadErrorKind::Network));
        let transport = ChunkTransport::new(endpoint, 0);
        let (progress, _) = recorder();

        // 超出数据源长度
        let err = transport
            .transmit(
                &context(1),
                &ChunkTask::new(0, 8..16),
                progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, UploadErrorKind::Source);
    }
}
