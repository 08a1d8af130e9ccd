// 上传错误类型
//
// 错误分层：
// - PlanningError: 配置无效，任何网络请求之前失败
// - TransportError: 单个分片（或小文件直传）请求失败
// - SchedulerAbort: 并发分片中第一个被观察到的失败
// - FinalizeError: 所有分片成功后合并失败
// - UploadError: 面向调用方的统一终止错误

use thiserror::Error;

/// 上传错误分类
///
/// 决定分片级重试是否有意义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试，需要更长等待时间）
    RateLimited,
    /// 参数错误（不可重试）
    BadRequest,
    /// 服务端业务拒绝，如文件已存在（不可重试）
    Rejected,
    /// 响应格式无法解析（不可重试）
    InvalidResponse,
    /// 本地文件读取失败（不可重试）
    Source,
    /// 已取消
    Cancelled,
    /// 未知错误
    Unknown,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::Network
                | UploadErrorKind::Timeout
                | UploadErrorKind::ServerError
                | UploadErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => UploadErrorKind::Timeout,
            429 => UploadErrorKind::RateLimited,
            400..=499 => UploadErrorKind::BadRequest,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }
}

/// 上传配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("分片大小必须大于 0")]
    InvalidChunkSize,
    #[error("最大并发分片数必须大于等于 1，当前: {0}")]
    InvalidConcurrency(usize),
}

/// 单次传输失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: UploadErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: UploadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(UploadErrorKind::Cancelled, "上传已取消")
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            UploadErrorKind::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            UploadErrorKind::Network
        } else if let Some(status) = e.status() {
            UploadErrorKind::from_status(status.as_u16())
        } else if e.is_decode() {
            UploadErrorKind::InvalidResponse
        } else {
            UploadErrorKind::Unknown
        };
        Self::new(kind, e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::new(UploadErrorKind::Source, format!("读取本地文件失败: {}", e))
    }
}

/// 调度中止原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerAbort {
    /// 第一个失败的分片
    #[error("分片 #{index} 上传失败: {error}")]
    ChunkFailed { index: usize, error: TransportError },
    /// 分片任务异常退出（无法定位分片）
    #[error("分片任务异常: {0}")]
    WorkerLost(String),
    /// 调用方取消
    #[error("上传已取消")]
    Cancelled,
}

/// 合并失败（此时所有分片均已传输）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("合并分片失败: {0}")]
pub struct FinalizeError(pub TransportError);

/// 上传任务终止错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("上传配置无效: {0}")]
    Planning(#[from] PlanningError),
    #[error("文件上传失败: {0}")]
    Direct(TransportError),
    #[error("{0}")]
    Aborted(SchedulerAbort),
    #[error("{0}")]
    Finalize(#[from] FinalizeError),
    #[error("上传已取消")]
    Cancelled,
}

impl From<SchedulerAbort> for UploadError {
    fn from(abort: SchedulerAbort) -> Self {
        match abort {
            SchedulerAbort::Cancelled => UploadError::Cancelled,
            other => UploadError::Aborted(other),
        }
    }
}
