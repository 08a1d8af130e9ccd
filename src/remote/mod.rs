// 文件服务 API 模块

pub mod client;
pub mod types;

pub use client::FileNestClient;
pub use types::*;
