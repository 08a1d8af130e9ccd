// 测试用上传端点

use crate::uploader::error::{TransportError, UploadErrorKind};
use crate::uploader::source::read_pieces;
use crate::uploader::task::UploadManifest;
use crate::uploader::transport::{
    ChunkProgressFn, ChunkRequest, DirectUploadRequest, UploadEndpoint,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// 记录所有请求的内存端点
#[derive(Default)]
pub(crate) struct MockEndpoint {
    /// 该索引的分片开始后立即失败
    pub fail_chunk: Option<usize>,
    pub fail_direct: bool,
    pub fail_merge: bool,
    /// 分片耗时基数，实际耗时随索引变化以打乱完成顺序
    pub chunk_delay: Duration,
    /// 已开始的分片 (index, total_chunks, len)
    pub started: Mutex<Vec<(usize, usize, usize)>>,
    pub directs: Mutex<Vec<DirectUploadRequest>>,
    /// 直传收到的总字节数
    pub direct_bytes: AtomicUsize,
    pub merges: Mutex<Vec<UploadManifest>>,
    pub running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl MockEndpoint {
    pub fn with_delay(ms: u64) -> Self {
        Self {
            chunk_delay: Duration::from_millis(ms),
            ..Self::default()
        }
    }

    pub fn started_indices(&self) -> Vec<usize> {
        self.started.lock().unwrap().iter().map(|c| c.0).collect()
    }
}

#[async_trait]
impl UploadEndpoint for MockEndpoint {
    async fn upload_direct(
        &self,
        request: DirectUploadRequest,
        on_progress: ChunkProgressFn,
    ) -> Result<(), TransportError> {
        self.directs.lock().unwrap().push(request.clone());
        if self.fail_direct {
            return Err(TransportError::new(UploadErrorKind::Rejected, "direct rejected"));
        }

        // 与 HTTP 端点一样分段读取数据源
        let total = request.size().max(1);
        let mut pieces = read_pieces(request.source, 64 * 1024, move |sent| {
            on_progress((sent * 99 / total) as u8)
        });
        while let Some(piece) = pieces.next().await {
            self.direct_bytes.fetch_add(piece?.len(), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn upload_chunk(
        &self,
        request: ChunkRequest,
        on_progress: ChunkProgressFn,
    ) -> Result<(), TransportError> {
        self.started
            .lock()
            .unwrap()
            .push((request.index, request.total_chunks, request.data.len()));
        if self.fail_chunk == Some(request.index) {
            return Err(TransportError::new(
                UploadErrorKind::Rejected,
                format!("chunk {} rejected", request.index),
            ));
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        on_progress(50);
        let factor = (request.index % 3) as u32 + 1;
        tokio::time::sleep(self.chunk_delay * factor).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn merge_chunks(&self, manifest: &UploadManifest) -> Result<(), TransportError> {
        self.merges.lock().unwrap().push(manifest.clone());
        if self.fail_merge {
            return Err(TransportError::new(UploadErrorKind::Rejected, "merge rejected"));
        }
        Ok(())
    }
}
