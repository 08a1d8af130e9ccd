// 文件服务接口类型定义

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 业务成功码
pub const CODE_SUCCESS: i32 = 1000;
/// 业务失败码
pub const CODE_ERROR: i32 = 1001;

/// 统一响应包装 `{code, message, data}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    /// 业务码（1000 表示成功）
    pub code: i32,

    /// 提示信息
    #[serde(default)]
    pub message: String,

    /// 业务数据
    #[serde(default)]
    pub data: Option<Value>,
}

impl ApiResponse {
    /// 是否成功
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}
