// 上传数据源
//
// 数据源只读且可按范围读取，多个分片并发读取互不影响，无需加锁

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// 可按字节范围读取的数据源
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// 数据总长度
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 读取 [start, end) 范围内的数据
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

/// 按固定大小顺序读取整个数据源
///
/// 后台任务逐段读取并写入容量为 1 的通道，内存中最多缓存两三段。
/// 接收端被丢弃（请求中止）时读取随即停止，读取失败时发送错误后结束。
/// 每段读取成功、写入通道之前以累计字节数调用 `on_piece`。
pub fn read_pieces<F>(
    source: Arc<dyn ChunkSource>,
    piece_size: u64,
    mut on_piece: F,
) -> mpsc::Receiver<io::Result<Bytes>>
where
    F: FnMut(u64) + Send + 'static,
{
    let (mut tx, rx) = mpsc::channel(1);
    let total = source.len();
    let piece_size = piece_size.max(1);

    tokio::spawn(async move {
        let mut offset = 0u64;
        while offset < total {
            let end = (offset + piece_size).min(total);
            match source.read_range(offset..end).await {
                Ok(piece) => {
                    on_piece(end);
                    if tx.send(Ok(piece)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
            offset = end;
        }
    });

    rx
}

/// 本地文件数据源
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// 打开本地文件，读取文件大小
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("不是普通文件: {:?}", path),
            ));
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件名（用作远端文件名）
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        if range.start > range.end || range.end > self.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("读取范围越界: {:?}, 文件大小={}", range, self.size),
            ));
        }

        let path = self.path.clone();
        let start = range.start;
        let size = (range.end - range.start) as usize;

        // 每次读取独立打开文件句柄，避免共享 seek 位置
        let buffer = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(start))?;

            let mut buffer = vec![0u8; size];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        debug!(
            "读取分片数据: bytes={}-{}, 大小={} bytes",
            range.start,
            range.end,
            buffer.len()
        );

        Ok(Bytes::from(buffer))
    }
}

/// 内存数据源
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let len = self.data.len() as u64;
        if range.start > range.end || range.end > len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("读取范围越界: {:?}, 数据长度={}", range, len),
            ));
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}
