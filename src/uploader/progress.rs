// 上传进度聚合
//
// 每个分片保存最新上报的百分比（覆盖而非累加），总进度 = floor(sum / total_chunks)
//
// - 分片成功后进度固定为 100，之后的部分进度上报被忽略
// - 对外上报的总进度单调不减：分片重试从 0 开始时，内部总进度可能回落，
//   但只有超过已上报值时才会再次上报
// - 任务结束后封存，封存后不再上报任何进度

use parking_lot::Mutex;
use std::sync::Arc;

/// 总进度回调（0-100）
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug)]
struct ProgressState {
    /// 每个分片的进度百分比
    percents: Vec<u8>,
    /// 分片是否已成功
    succeeded: Vec<bool>,
    /// 上次上报的总进度
    reported: Option<u8>,
    /// 是否已封存
    sealed: bool,
}

impl ProgressState {
    fn aggregate(&self) -> u8 {
        let sum: u64 = self.percents.iter().map(|&p| p as u64).sum();
        (sum / self.percents.len() as u64) as u8
    }
}

/// 进度聚合器
pub struct ProgressAggregator {
    state: Mutex<ProgressState>,
    on_progress: Option<ProgressCallback>,
}

impl ProgressAggregator {
    /// 创建聚合器，`total_chunks` 为 0 时按 1 处理
    pub fn new(total_chunks: usize) -> Self {
        let total = total_chunks.max(1);
        Self {
            state: Mutex::new(ProgressState {
                percents: vec![0; total],
                succeeded: vec![false; total],
                reported: None,
                sealed: false,
            }),
            on_progress: None,
        }
    }

    pub fn with_callback(total_chunks: usize, on_progress: ProgressCallback) -> Self {
        Self {
            on_progress: Some(on_progress),
            ..Self::new(total_chunks)
        }
    }

    /// 分片进度更新
    ///
    /// 返回本次触发上报的总进度（未上报则为 None）
    pub fn on_chunk_progress(&self, index: usize, percent: u8) -> Option<u8> {
        let mut state = self.state.lock();
        if index >= state.percents.len() || state.succeeded[index] {
            return None;
        }
        state.percents[index] = percent.min(100);
        self.emit(&mut state)
    }

    /// 标记分片成功，进度固定为 100
    pub fn mark_succeeded(&self, index: usize) -> Option<u8> {
        let mut state = self.state.lock();
        if index >= state.percents.len() {
            return None;
        }
        state.percents[index] = 100;
        state.succeeded[index] = true;
        self.emit(&mut state)
    }

    /// 当前总进度
    pub fn aggregate(&self) -> u8 {
        self.state.lock().aggregate()
    }

    /// 已上报的最高总进度
    pub fn reported(&self) -> u8 {
        self.state.lock().reported.unwrap_or(0)
    }

    /// 各分片进度快照（按索引）
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().percents.clone()
    }

    /// 封存，之后不再上报进度
    pub fn seal(&self) {
        self.state.lock().sealed = true;
    }

    // 回调在锁内调用，保证上报顺序与数值顺序一致；回调中不得再访问聚合器
    fn emit(&self, state: &mut ProgressState) -> Option<u8> {
        if state.sealed {
            return None;
        }
        let aggregate = state.aggregate();
        if state.reported.is_some_and(|reported| aggregate <= reported) {
            return None;
        }
        state.reported = Some(aggregate);
        if let Some(callback) = &self.on_progress {
            callback(aggregate);
        }
        Some(aggregate)
    }
}
