// FileNest Upload Library
// FileNest 文件服务并发分片上传客户端核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 文件服务API模块
pub mod remote;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, LogConfig, ServerConfig, UploadConfig};
pub use remote::FileNestClient;
pub use uploader::{
    FileSource, MemorySource, UploadCallbacks, UploadEngine, UploadError, UploadJob,
    UploadJobStatus, UploadManager, UploadOutcome,
};
