// 上传模块
//
// 分片规划 -> 并发调度分片传输 -> 进度汇总 -> 合并

pub mod chunk;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod manager;
pub mod progress;
pub mod scheduler;
pub mod source;
pub mod task;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use chunk::{
    plan, split_into_chunks, ChunkPolicy, ChunkStatus, ChunkTask, UploadPlan,
    DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD,
};
pub use engine::{UploadCallbacks, UploadEngine, UploadOutcome};
pub use error::{
    FinalizeError, PlanningError, SchedulerAbort, TransportError, UploadError, UploadErrorKind,
};
pub use finalize::FinalizeCoordinator;
pub use manager::{UploadManager, UploadTaskInfo};
pub use progress::{ProgressAggregator, ProgressCallback};
pub use scheduler::ChunkScheduler;
pub use source::{read_pieces, ChunkSource, FileSource, MemorySource};
pub use task::{UploadJob, UploadJobStatus, UploadManifest};
pub use transport::{
    ChunkContext, ChunkProgressFn, ChunkRequest, ChunkTransport,
    DirectUploadRequest, UploadEndpoint,
};
