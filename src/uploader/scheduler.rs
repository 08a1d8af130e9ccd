// 上传分片调度器
//
// 固定宽度、自动补位的并发池：
// - 待上传队列按分片索引升序排列（准入顺序确定，完成顺序不确定）
// - Semaphore 限制同时上传的分片数，JoinSet 管理运行中的分片
// - 任一分片完成后立即从队列补位，直到队列耗尽
// - 任一分片失败后停止准入新分片，等待运行中的分片结束后返回第一个失败
// - 可选：失败时取消运行中的分片（仍然等待其退出）
// - 调用方取消：停止准入、取消运行中的分片、等待退出后返回 Cancelled
//
// 调度器本身不做重试，重试由分片传输层负责

use crate::uploader::chunk::{ChunkStatus, ChunkTask};
use crate::uploader::error::{PlanningError, SchedulerAbort, TransportError, UploadErrorKind};
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片调度器
#[derive(Debug, Clone)]
pub struct ChunkScheduler {
    /// 最大并发分片数
    max_concurrency: usize,
    /// 失败时是否取消运行中的分片
    cancel_in_flight_on_failure: bool,
    /// 调用方取消令牌
    cancel_token: CancellationToken,
}

impl ChunkScheduler {
    /// 创建调度器，并发数必须 >= 1
    pub fn new(max_concurrency: usize) -> Result<Self, PlanningError> {
        if max_concurrency == 0 {
            return Err(PlanningError::InvalidConcurrency(max_concurrency));
        }
        Ok(Self {
            max_concurrency,
            cancel_in_flight_on_failure: false,
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn cancel_in_flight_on_failure(mut self, enabled: bool) -> Self {
        self.cancel_in_flight_on_failure = enabled;
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// 执行所有分片
    ///
    /// `worker` 为每个分片调用一次，收到分片描述和该分片的取消令牌
    ///
    /// # 返回
    /// 全部成功时返回状态均为 Succeeded 的分片列表，否则返回第一个失败
    pub async fn run<F, Fut>(
        &self,
        tasks: Vec<ChunkTask>,
        worker: F,
    ) -> Result<Vec<ChunkTask>, SchedulerAbort>
    where
        F: Fn(ChunkTask, CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let mut board = tasks;
        board.sort_by_key(|t| t.index);
        let total = board.len();

        info!(
            "[分片调度] 开始调度 {} 个分片，并发数: {}",
            total, self.max_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let in_flight_token = self.cancel_token.child_token();
        let mut queue: VecDeque<usize> = (0..total).collect();
        let mut join_set: JoinSet<(usize, Result<(), TransportError>)> = JoinSet::new();
        let mut first_failure: Option<SchedulerAbort> = None;
        let mut cancel_seen = false;

        loop {
            if first_failure.is_none() && self.cancel_token.is_cancelled() {
                first_failure = Some(SchedulerAbort::Cancelled);
            }

            // 准入：填满并发池
            if first_failure.is_none() {
                while let Some(&pos) = queue.front() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    queue.pop_front();

                    let task = board[pos].clone();
                    board[pos].status = ChunkStatus::Running;
                    debug!(
                        "[分片调度] 准入分片 #{} (运行中: {}/{})",
                        task.index,
                        self.max_concurrency - semaphore.available_permits(),
                        self.max_concurrency
                    );

                    let fut = worker(task, in_flight_token.clone());
                    join_set.spawn(async move {
                        let result = AssertUnwindSafe(fut).catch_unwind().await.unwrap_or_else(|_| {
                            Err(TransportError::new(UploadErrorKind::Unknown, "分片任务异常退出"))
                        });
                        drop(permit);
                        (pos, result)
                    });
                }
            }

            // 等待任意一个分片结束
            let joined = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("[分片调度] 上传已取消，等待 {} 个运行中的分片退出", join_set.len());
                    if first_failure.is_none() {
                        first_failure = Some(SchedulerAbort::Cancelled);
                    }
                    continue;
                }
                joined = join_set.join_next() => joined,
            };

            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((pos, Ok(()))) => {
                    board[pos].status = ChunkStatus::Succeeded;
                }
                Ok((pos, Err(e))) => {
                    board[pos].status = ChunkStatus::Failed;
                    let index = board[pos].index;
                    if first_failure.is_none()
                        && e.kind == UploadErrorKind::Cancelled
                        && self.cancel_token.is_cancelled()
                    {
                        first_failure = Some(SchedulerAbort::Cancelled);
                    } else if first_failure.is_none() {
                        error!(
                            "[分片调度] 分片 #{} 失败，停止调度剩余分片: {}",
                            index, e
                        );
                        first_failure = Some(SchedulerAbort::ChunkFailed { index, error: e });
                        if self.cancel_in_flight_on_failure {
                            in_flight_token.cancel();
                        }
                    } else {
                        debug!("[分片调度] 分片 #{} 在中止后结束: {}", index, e);
                    }
                }
                Err(e) => {
                    error!("[分片调度] 分片任务异常: {}", e);
                    if first_failure.is_none() {
                        first_failure = Some(SchedulerAbort::WorkerLost(e.to_string()));
                        if self.cancel_in_flight_on_failure {
                            in_flight_token.cancel();
                        }
                    }
                }
            }
        }

        match first_failure {
            Some(abort) => {
                let succeeded = board
                    .iter()
                    .filter(|t| t.status == ChunkStatus::Succeeded)
                    .count();
                warn!(
                    "[分片调度] 调度中止: 成功 {}/{}，未调度 {}",
                    succeeded,
                    total,
                    queue.len()
                );
                Err(abort)
            }
            None => {
                info!("[分片调度] 所有 {} 个分片上传完成", total);
                Ok(board)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::split_into_chunks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct WorkLog {
        running: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<usize>>,
        finished: Mutex<Vec<usize>>,
    }

    impl WorkLog {
        async fn work(&self, index: usize, delay: Duration) {
            self.started.lock().unwrap().push(index);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.lock().unwrap().push(index);
        }
    }

    fn tasks(n: usize) -> Vec<ChunkTask> {
        split_into_chunks(n as u64 * 10, 10).unwrap()
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert_eq!(
            ChunkScheduler::new(0).unwrap_err(),
            PlanningError::InvalidConcurrency(0)
        );
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let scheduler = ChunkScheduler::new(3).unwrap();
        let done = scheduler
            .run(tasks(7), |_task, _token| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(done.len(), 7);
        assert!(done.iter().all(|t| t.status == ChunkStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_never_exceeds_max_concurrency() {
        for (n, width) in [(1, 1), (5, 2), (12, 3), (3, 8)] {
            let work_log = Arc::new(WorkLog::default());
            let scheduler = ChunkScheduler::new(width).unwrap();
            scheduler
                .run(tasks(n), |task, _token| {
                    let work_log = work_log.clone();
                    // 不同分片耗时不同，打乱完成顺序
                    let delay = Duration::from_millis(5 + (task.index as u64 * 7) % 20);
                    async move {
                        work_log.work(task.index, delay).await;
                        Ok(())
                    }
                })
                .await
                .unwrap();

            let peak = work_log.peak.load(Ordering::SeqCst);
            assert!(peak <= width, "peak {} > width {}", peak, width);
            assert_eq!(peak, n.min(width));
            assert_eq!(work_log.finished.lock().unwrap().len(), n);
        }
    }

    #[tokio::test]
    async fn test_admission_order_is_ascending() {
        let work_log = Arc::new(WorkLog::default());
        let scheduler = ChunkScheduler::new(2).unwrap();
        // 乱序传入
        let mut input = tasks(6);
        input.reverse();
        scheduler
            .run(input, |task, _token| {
                let work_log = work_log.clone();
                async move {
                    work_log.work(task.index, Duration::from_millis(3)).await;
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(*work_log.started.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_single_slot_is_sequential() {
        let work_log = Arc::new(WorkLog::default());
        let scheduler = ChunkScheduler::new(1).unwrap();
        scheduler
            .run(tasks(4), |task, _token| {
                let work_log = work_log.clone();
                async move {
                    work_log.work(task.index, Duration::from_millis(2)).await;
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(*work_log.started.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(*work_log.finished.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(work_log.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_admission_and_drains() {
        let work_log = Arc::new(WorkLog::default());
        let scheduler = ChunkScheduler::new(2).unwrap();
        let abort = scheduler
            .run(tasks(5), |task, _token| {
                let work_log = work_log.clone();
                async move {
                    if task.index == 2 {
                        work_log.started.lock().unwrap().push(2);
                        return Err(TransportError::new(UploadErrorKind::Rejected, "chunk 2 rejected"));
                    }
                    work_log.work(task.index, Duration::from_millis(40)).await;
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        match abort {
            SchedulerAbort::ChunkFailed { index, error } => {
                assert_eq!(index, 2);
                assert_eq!(error.message, "chunk 2 rejected");
            }
            other => panic!("unexpected abort: {:?}", other),
        }

        let started = work_log.started.lock().unwrap().clone();
        assert!(!started.contains(&4), "chunk 4 admitted after failure: {:?}", started);
        // 运行中的分片允许结束（未强制取消）
        assert_eq!(work_log.running.load(Ordering::SeqCst), 0);
        let finished = work_log.finished.lock().unwrap().clone();
        for index in started.iter().filter(|&&i| i != 2) {
            assert!(finished.contains(index));
        }
    }

    #[tokio::test]
    async fn test_reports_first_failure_only() {
        let scheduler = ChunkScheduler::new(4).unwrap();
        let abort = scheduler
            .run(tasks(4), |task, _token| async move {
                // 分片 1 最先失败，分片 3 稍后失败
                let delay = if task.index == 1 { 5 } else { 30 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if task.index == 1 || task.index == 3 {
                    Err(TransportError::new(UploadErrorKind::ServerError, format!("fail {}", task.index)))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(abort, SchedulerAbort::ChunkFailed { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancel_in_flight_on_failure() {
        let work_log = Arc::new(WorkLog::default());
        let scheduler = ChunkScheduler::new(3).unwrap().cancel_in_flight_on_failure(true);
        let abort = scheduler
            .run(tasks(3), |task, token| {
                let work_log = work_log.clone();
                async move {
                    if task.index == 0 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        return Err(TransportError::new(UploadErrorKind::Rejected, "fail"));
                    }
                    tokio::select! {
                        _ = token.cancelled() => {
                            work_log.finished.lock().unwrap().push(task.index);
                            Err(TransportError::cancelled())
                        }
                        _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                    }
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(abort, SchedulerAbort::ChunkFailed { index: 0, .. }));
        // 被取消的分片在返回前已退出
        let mut finished = work_log.finished.lock().unwrap().clone();
        finished.sort();
        assert_eq!(finished, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let cancel = CancellationToken::new();
        let scheduler = ChunkScheduler::new(2).unwrap().with_cancel_token(cancel.clone());
        let admitted = Arc::new(AtomicUsize::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let abort = scheduler
            .run(tasks(10), |_task, token| {
                let admitted = admitted.clone();
                async move {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = token.cancelled() => Err(TransportError::cancelled()),
                        _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(abort, SchedulerAbort::Cancelled);
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_a_failure() {
        let scheduler = ChunkScheduler::new(2).unwrap();
        let abort = scheduler
            .run(tasks(2), |task, _token| async move {
                if task.index == 1 {
                    panic!("worker bug");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(abort, SchedulerAbort::ChunkFailed { index: 1, .. }));
    }
}
