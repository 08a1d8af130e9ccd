// 分片合并
//
// 仅在所有分片成功后调用一次，请求只携带合并清单，不携带分片数据
// 合并失败即视为整个上传失败（此时目标文件尚不可用）
// 本组件不自动重试；合并在覆盖标记不变时是幂等的，调用方可用同一清单重新调用

use crate::uploader::error::FinalizeError;
use crate::uploader::task::UploadManifest;
use crate::uploader::transport::UploadEndpoint;
use std::sync::Arc;
use tracing::{error, info};

/// 合并协调器
pub struct FinalizeCoordinator {
    endpoint: Arc<dyn UploadEndpoint>,
}

impl FinalizeCoordinator {
    pub fn new(endpoint: Arc<dyn UploadEndpoint>) -> Self {
        Self { endpoint }
    }

    /// 合并分片，消费清单
    pub async fn finalize(&self, manifest: UploadManifest) -> Result<(), FinalizeError> {
        info!(
            "合并上传分片: path={}, file={}, chunks={}, override={}",
            manifest.destination_path, manifest.file_name, manifest.total_chunks, manifest.overwrite
        );

        match self.endpoint.merge_chunks(&manifest).await {
            Ok(()) => {
                info!(
                    "合并成功: {}/{}",
                    manifest.destination_path, manifest.file_name
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "合并失败: {}/{}, 错误: {}",
                    manifest.destination_path, manifest.file_name, e
                );
                Err(FinalizeError(e))
            }
        }
    }
}
