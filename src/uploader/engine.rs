// 上传引擎
//
// 核心功能：
// 1. 规划：根据文件大小决定直传或分片
// 2. 直传：单次调用小文件上传接口
// 3. 分片：调度器并发驱动分片传输，进度汇总到聚合器
// 4. 合并：所有分片成功后调用一次合并接口
//
// 每个任务恰好触发一次终止回调（成功或失败），终止回调之后不再上报进度

use crate::config::UploadConfig;
use crate::uploader::chunk::{plan, ChunkPolicy, ChunkTask, UploadPlan};
use crate::uploader::error::{FinalizeError, PlanningError, UploadError};
use crate::uploader::finalize::FinalizeCoordinator;
use crate::uploader::progress::{ProgressAggregator, ProgressCallback};
use crate::uploader::scheduler::ChunkScheduler;
use crate::uploader::task::{UploadJob, UploadManifest};
use crate::uploader::transport::{
    ChunkContext, ChunkProgressFn, ChunkTransport, DirectUploadRequest, UploadEndpoint,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 小文件直传完成
    Direct,
    /// 分片上传并合并完成
    Chunked { total_chunks: usize },
}

/// 调用方回调
///
/// `on_success` 与 `on_error` 互斥，每个任务恰好触发其中一个
pub struct UploadCallbacks {
    on_progress: ProgressCallback,
    on_success: Box<dyn FnOnce() + Send>,
    on_error: Box<dyn FnOnce(String) + Send>,
}

impl UploadCallbacks {
    pub fn new(
        on_progress: impl Fn(u8) + Send + Sync + 'static,
        on_success: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(String) + Send + 'static,
    ) -> Self {
        Self {
            on_progress: Arc::new(on_progress),
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }
}

/// 上传引擎
pub struct UploadEngine {
    endpoint: Arc<dyn UploadEndpoint>,
    config: UploadConfig,
    finalizer: FinalizeCoordinator,
}

impl UploadEngine {
    /// 创建上传引擎，配置无效时立即失败
    pub fn new(endpoint: Arc<dyn UploadEndpoint>, config: UploadConfig) -> Result<Self, PlanningError> {
        config.validate()?;
        Ok(Self {
            finalizer: FinalizeCoordinator::new(endpoint.clone()),
            endpoint,
            config,
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 执行上传，通过回调报告进度和结果
    pub async fn upload(&self, job: UploadJob, callbacks: UploadCallbacks) {
        let UploadCallbacks {
            on_progress,
            on_success,
            on_error,
        } = callbacks;

        match self.run(job, on_progress).await {
            Ok(_) => on_success(),
            Err(e) => on_error(e.to_string()),
        }
    }

    /// 执行上传
    pub async fn run(
        &self,
        job: UploadJob,
        on_progress: ProgressCallback,
    ) -> Result<UploadOutcome, UploadError> {
        self.run_with_cancel(job, on_progress, CancellationToken::new())
            .await
    }

    /// 执行上传（可取消）
    pub async fn run_with_cancel(
        &self,
        job: UploadJob,
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let file_size = job.file_size();
        info!(
            "开始上传: id={}, file={}, path={}, size={}, override={}",
            job.id, job.file_name, job.destination_path, file_size, job.overwrite
        );

        if job.max_concurrency == 0 {
            return Err(PlanningError::InvalidConcurrency(job.max_concurrency).into());
        }

        let policy = ChunkPolicy {
            chunk_size: job.chunk_size,
            ..ChunkPolicy::from(&self.config)
        };
        let upload_plan = plan(file_size, &policy)?;

        let aggregator = Arc::new(ProgressAggregator::with_callback(
            upload_plan.total_chunks(),
            on_progress,
        ));

        let result = match upload_plan {
            UploadPlan::Direct => self.upload_direct(&job, &aggregator, &cancel).await,
            UploadPlan::Chunked(tasks) => {
                self.upload_chunked(&job, tasks, &aggregator, &cancel)
                    .await
            }
        };

        // 终止回调之前封存进度
        aggregator.seal();

        match &result {
            Ok(outcome) => info!("上传完成: id={}, {:?}", job.id, outcome),
            Err(e) => error!("上传失败: id={}, 错误: {}", job.id, e),
        }

        result
    }

    /// 重新合并（调用方在合并失败后使用同一清单重试）
    pub async fn finalize(&self, manifest: UploadManifest) -> Result<(), FinalizeError> {
        self.finalizer.finalize(manifest).await
    }

    async fn upload_direct(
        &self,
        job: &UploadJob,
        aggregator: &Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        info!("小文件直传: file={}, size={}", job.file_name, job.file_size());

        let request = DirectUploadRequest {
            destination_path: job.destination_path.clone(),
            file_name: job.file_name.clone(),
            overwrite: job.overwrite,
            source: job.source.clone(),
        };
        let progress: ChunkProgressFn = {
            let aggregator = aggregator.clone();
            Arc::new(move |percent: u8| {
                aggregator.on_chunk_progress(0, percent);
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            r = self.endpoint.upload_direct(request, progress) => r.map_err(UploadError::Direct)?,
        }

        aggregator.mark_succeeded(0);
        Ok(UploadOutcome::Direct)
    }

    async fn upload_chunked(
        &self,
        job: &UploadJob,
        tasks: Vec<ChunkTask>,
        aggregator: &Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let total_chunks = tasks.len();
        info!(
            "[分片上传] 文件: {}, 分片数: {}, 分片大小: {}, 最大并发: {}",
            job.file_name, total_chunks, job.chunk_size, job.max_concurrency
        );

        let ctx = Arc::new(ChunkContext {
            source: job.source.clone(),
            destination_path: job.destination_path.clone(),
            file_name: job.file_name.clone(),
            total_chunks,
            overwrite: job.overwrite,
        });
        let transport = Arc::new(ChunkTransport::new(
            self.endpoint.clone(),
            self.config.max_retries,
        ));
        let scheduler = ChunkScheduler::new(job.max_concurrency)?
            .cancel_in_flight_on_failure(self.config.cancel_in_flight_on_failure)
            .with_cancel_token(cancel.clone());

        scheduler
            .run(tasks, |task, token| {
                let ctx = ctx.clone();
                let transport = transport.clone();
                let aggregator = aggregator.clone();
                async move {
                    let index = task.index;
                    let progress: ChunkProgressFn = {
                        let aggregator = aggregator.clone();
                        Arc::new(move |percent: u8| {
                            aggregator.on_chunk_progress(index, percent);
                        })
                    };
                    transport.transmit(&ctx, &task, progress, &token).await?;
                    aggregator.mark_succeeded(index);
                    Ok(())
                }
            })
            .await?;

        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        self.finalizer.finalize(job.manifest(total_chunks)).await?;
        Ok(UploadOutcome::Chunked { total_chunks })
    }
}
