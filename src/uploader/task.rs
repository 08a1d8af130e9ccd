// 上传任务定义

use crate::config::UploadConfig;
use crate::uploader::source::ChunkSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadJobStatus {
    /// 排队中
    Queued,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadJobStatus {
    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadJobStatus::Completed | UploadJobStatus::Failed | UploadJobStatus::Cancelled
        )
    }
}

/// 单次上传任务
///
/// 任务生命周期内由上传引擎独占，任务结束（成功、失败或取消）后释放
#[derive(Clone)]
pub struct UploadJob {
    /// 任务ID
    pub id: String,
    /// 数据源
    pub source: Arc<dyn ChunkSource>,
    /// 网盘目标目录
    pub destination_path: String,
    /// 远端文件名
    pub file_name: String,
    /// 目标已存在时是否覆盖
    pub overwrite: bool,
    /// 分片大小
    pub chunk_size: u64,
    /// 最大并发分片数
    pub max_concurrency: usize,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
}

impl UploadJob {
    /// 使用配置中的分片大小和并发数创建任务
    pub fn new(
        source: Arc<dyn ChunkSource>,
        destination_path: impl Into<String>,
        file_name: impl Into<String>,
        overwrite: bool,
        config: &UploadConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            destination_path: destination_path.into(),
            file_name: file_name.into(),
            overwrite,
            chunk_size: config.chunk_size,
            max_concurrency: config.max_concurrency,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// 文件大小
    pub fn file_size(&self) -> u64 {
        self.source.len()
    }

    /// 生成合并清单
    pub fn manifest(&self, total_chunks: usize) -> UploadManifest {
        UploadManifest {
            destination_path: self.destination_path.clone(),
            file_name: self.file_name.clone(),
            total_chunks,
            overwrite: self.overwrite,
        }
    }
}

impl fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadJob")
            .field("id", &self.id)
            .field("size", &self.source.len())
            .field("destination_path", &self.destination_path)
            .field("file_name", &self.file_name)
            .field("overwrite", &self.overwrite)
            .field("chunk_size", &self.chunk_size)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

/// 合并清单
///
/// 所有分片成功后构建一次，由合并步骤消费
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadManifest {
    /// 网盘目标目录
    #[serde(rename = "path")]
    pub destination_path: String,
    /// 远端文件名
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// 分片总数
    #[serde(rename = "totalChunks")]
    pub total_chunks: usize,
    /// 是否覆盖
    #[serde(rename = "override")]
    pub overwrite: bool,
}
