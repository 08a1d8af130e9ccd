// 上传管理器
//
// 负责管理多个上传任务：
// - 任务注册与状态快照
// - 任务级并发控制（同时上传的文件数）
// - 进度跟踪
// - 取消

use crate::uploader::chunk::{plan, ChunkPolicy};
use crate::uploader::engine::UploadEngine;
use crate::uploader::error::UploadError;
use crate::uploader::task::{UploadJob, UploadJobStatus};
use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 上传任务信息快照
#[derive(Debug, Clone, Serialize)]
pub struct UploadTaskInfo {
    pub id: String,
    pub file_name: String,
    pub destination_path: String,
    pub file_size: u64,
    /// 分片数（直传为 1）
    pub total_chunks: usize,
    pub status: UploadJobStatus,
    /// 总进度百分比
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

/// 受管上传任务
struct ManagedUpload {
    info: Arc<Mutex<UploadTaskInfo>>,
    cancel_token: CancellationToken,
    status_tx: Arc<watch::Sender<UploadJobStatus>>,
}

/// 上传管理器
pub struct UploadManager {
    engine: Arc<UploadEngine>,
    /// 所有任务（task_id -> 任务）
    tasks: Arc<DashMap<String, ManagedUpload>>,
    /// 任务级并发控制
    job_semaphore: Arc<Semaphore>,
}

impl UploadManager {
    pub fn new(engine: Arc<UploadEngine>) -> Self {
        let max_jobs = engine.config().max_concurrent_jobs.max(1);
        info!("创建上传管理器: 最大同时上传任务数={}", max_jobs);
        Self {
            engine,
            tasks: Arc::new(DashMap::new()),
            job_semaphore: Arc::new(Semaphore::new(max_jobs)),
        }
    }

    /// 提交上传任务，立即返回任务ID
    ///
    /// 超出任务并发上限时排队，按提交顺序获得上传许可
    pub fn submit(&self, job: UploadJob) -> String {
        let task_id = job.id.clone();
        let policy = ChunkPolicy {
            chunk_size: job.chunk_size,
            ..ChunkPolicy::from(self.engine.config())
        };
        // 规划失败的任务仍然登记，由引擎以同样的错误结束，快照分片数记为 0
        let total_chunks = match plan(job.file_size(), &policy) {
            Ok(upload_plan) => upload_plan.total_chunks(),
            Err(e) => {
                warn!(
                    "上传任务规划失败: id={}, file={}, 错误: {}",
                    task_id, job.file_name, e
                );
                0
            }
        };

        let info = Arc::new(Mutex::new(UploadTaskInfo {
            id: task_id.clone(),
            file_name: job.file_name.clone(),
            destination_path: job.destination_path.clone(),
            file_size: job.file_size(),
            total_chunks,
            status: UploadJobStatus::Queued,
            progress: 0,
            error: None,
            created_at: job.created_at,
            finished_at: None,
        }));
        let cancel_token = CancellationToken::new();
        let (status_tx, _) = watch::channel(UploadJobStatus::Queued);
        let status_tx = Arc::new(status_tx);

        self.tasks.insert(
            task_id.clone(),
            ManagedUpload {
                info: info.clone(),
                cancel_token: cancel_token.clone(),
                status_tx: status_tx.clone(),
            },
        );

        info!(
            "提交上传任务: id={}, file={}, size={}, chunks={}",
            task_id,
            job.file_name,
            job.file_size(),
            total_chunks
        );

        let engine = self.engine.clone();
        let semaphore = self.job_semaphore.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            let Some(_permit) = permit else {
                finish(&info, &status_tx, UploadJobStatus::Cancelled, None);
                return;
            };

            info.lock().status = UploadJobStatus::Uploading;
            status_tx.send_replace(UploadJobStatus::Uploading);

            let progress_info = info.clone();
            let result = engine
                .run_with_cancel(
                    job,
                    Arc::new(move |percent: u8| {
                        progress_info.lock().progress = percent;
                    }),
                    cancel_token,
                )
                .await;

            match result {
                Ok(_) => finish(&info, &status_tx, UploadJobStatus::Completed, None),
                Err(UploadError::Cancelled) => {
                    finish(&info, &status_tx, UploadJobStatus::Cancelled, None)
                }
                Err(e) => finish(
                    &info,
                    &status_tx,
                    UploadJobStatus::Failed,
                    Some(e.to_string()),
                ),
            }
        });

        task_id
    }

    /// 取消上传任务
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;

        let status = task.info.lock().status;
        if status.is_terminal() {
            anyhow::bail!("任务已结束，无法取消: {} ({:?})", task_id, status);
        }

        task.cancel_token.cancel();
        info!("取消上传任务: {}", task_id);
        Ok(())
    }

    /// 获取任务状态
    pub fn get(&self, task_id: &str) -> Option<UploadTaskInfo> {
        self.tasks.get(task_id).map(|t| t.info.lock().clone())
    }

    /// 获取所有任务（按创建时间排序）
    pub fn list(&self) -> Vec<UploadTaskInfo> {
        let mut tasks: Vec<UploadTaskInfo> =
            self.tasks.iter().map(|t| t.info.lock().clone()).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// 正在上传或排队中的任务数
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.info.lock().status.is_terminal())
            .count()
    }

    /// 等待任务结束，返回最终状态快照
    pub async fn wait(&self, task_id: &str) -> Result<UploadTaskInfo> {
        let (mut rx, info) = {
            let task = self
                .tasks
                .get(task_id)
                .ok_or_else(|| anyhow::anyhow!("任务不存在: {}", task_id))?;
            (task.status_tx.subscribe(), task.info.clone())
        };

        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| anyhow::anyhow!("任务状态通道已关闭: {}", task_id))?;

        let snapshot = info.lock().clone();
        Ok(snapshot)
    }

    /// 清除已结束的任务，返回清除数量
    pub fn remove_finished(&self) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, t| !t.info.lock().status.is_terminal());
        let removed = before - self.tasks.len();
        info!("清除了 {} 个已结束的上传任务", removed);
        removed
    }
}

fn finish(
    info: &Mutex<UploadTaskInfo>,
    status_tx: &watch::Sender<UploadJobStatus>,
    status: UploadJobStatus,
    error: Option<String>,
) {
    {
        let mut info = info.lock();
        info.status = status;
        info.finished_at = Some(chrono::Utc::now().timestamp());
        if let Some(message) = &error {
            warn!("上传任务失败: id={}, 错误: {}", info.id, message);
        }
        info.error = error;
    }
    status_tx.send_replace(status);
}
