// 上传分片规划
//
// 分片规则：
// - 文件大小 <= 分片阈值：不分片，走小文件直传
// - 空文件：始终直传（单次空请求体）
// - 关闭分片上传：始终直传
// - 其余情况：按固定分片大小切分，最后一个分片可能小于分片大小

use crate::config::UploadConfig;
use crate::uploader::error::PlanningError;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// 默认分片大小: 2MB
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 默认分片阈值: 2MB 以上使用分片上传
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 2 * 1024 * 1024;

/// 分片状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 等待调度
    Pending,
    /// 上传中
    Running,
    /// 上传成功
    Succeeded,
    /// 上传失败
    Failed,
}

/// 分片任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
    /// 分片状态
    pub status: ChunkStatus,
}

impl ChunkTask {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            status: ChunkStatus::Pending,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分片策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub chunk_size: u64,
    pub chunk_threshold: u64,
    pub enable_chunked: bool,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            enable_chunked: true,
        }
    }
}

impl From<&UploadConfig> for ChunkPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_threshold: config.chunk_threshold,
            enable_chunked: config.enable_chunked,
        }
    }
}

/// 规划结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPlan {
    /// 小文件直传
    Direct,
    /// 分片上传（按索引升序）
    Chunked(Vec<ChunkTask>),
}

impl UploadPlan {
    pub fn is_chunked(&self) -> bool {
        matches!(self, UploadPlan::Chunked(_))
    }

    /// 分片数量，直传为 1
    pub fn total_chunks(&self) -> usize {
        match self {
            UploadPlan::Direct => 1,
            UploadPlan::Chunked(chunks) => chunks.len(),
        }
    }
}

/// 决定是否分片，并计算分片列表
///
/// 分片大小为 0 时立即失败，不会触发任何网络请求
pub fn plan(file_size: u64, policy: &ChunkPolicy) -> Result<UploadPlan, PlanningError> {
    if policy.chunk_size == 0 {
        return Err(PlanningError::InvalidChunkSize);
    }

    if file_size == 0 || !policy.enable_chunked || file_size <= policy.chunk_threshold {
        debug!(
            "无需分片: 文件大小={} bytes, 阈值={} bytes, 启用分片={}",
            file_size, policy.chunk_threshold, policy.enable_chunked
        );
        return Ok(UploadPlan::Direct);
    }

    let chunks = split_into_chunks(file_size, policy.chunk_size)?;
    debug!(
        "分片规划完成: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        file_size,
        policy.chunk_size,
        chunks.len()
    );
    Ok(UploadPlan::Chunked(chunks))
}

/// 按固定大小切分字节范围
pub fn split_into_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkTask>, PlanningError> {
    if chunk_size == 0 {
        return Err(PlanningError::InvalidChunkSize);
    }

    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset.saturating_add(chunk_size), total_size);
        chunks.push(ChunkTask::new(index, offset..end));
        offset = end;
        index += 1;
    }

    Ok(chunks)
}
