// 文件服务客户端实现

use crate::config::ServerConfig;
use crate::remote::ApiResponse;
use crate::uploader::{
    read_pieces, ChunkProgressFn, ChunkRequest, DirectUploadRequest, TransportError,
    UploadEndpoint, UploadErrorKind, UploadManifest,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart;
use reqwest::{Body, Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::{debug, error, info};

/// 流式发送时每次写出（直传时每次读取）的字节数
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// 错误信息中保留的响应体最大长度
const MAX_ERROR_BODY_LEN: usize = 256;

/// 文件服务客户端
#[derive(Debug, Clone)]
pub struct FileNestClient {
    /// HTTP客户端
    client: Client,
    /// 服务地址（不含末尾斜杠）
    base_url: String,
    /// Bearer 令牌
    auth_token: Option<String>,
}

impl FileNestClient {
    /// 创建文件服务客户端
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化文件服务客户端: {}, 令牌={}",
            config.base_url,
            if config.auth_token.is_some() {
                "已设置"
            } else {
                "未设置"
            }
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    /// 文件接口地址
    pub fn endpoint(&self, name: &str) -> String {
        format!("{}/api/file/{}", self.base_url, name)
    }

    fn post(&self, name: &str) -> RequestBuilder {
        let request = self.client.post(self.endpoint(name));
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// 构建带发送进度的请求体
///
/// 进度按已交给连接的字节计算，最高上报 99，100 由调用方在服务端确认后上报
fn progress_body(data: Bytes, on_progress: ChunkProgressFn) -> Body {
    let total = data.len().max(1);
    let pieces = split_pieces(&data);

    let mut sent = 0usize;
    let stream = futures::stream::iter(pieces).map(move |piece| {
        sent += piece.len();
        on_progress((sent * 99 / total) as u8);
        Ok::<Bytes, std::io::Error>(piece)
    });

    Body::wrap_stream(stream)
}

fn split_pieces(data: &Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(STREAM_PIECE_SIZE)
        .map(|start| data.slice(start..(start + STREAM_PIECE_SIZE).min(data.len())))
        .collect()
}

/// 构建直传请求体：从数据源分段读取，不在内存中保留整个文件
///
/// 进度规则与分片请求体相同
fn source_body(request: &DirectUploadRequest, on_progress: ChunkProgressFn) -> Body {
    let total = request.size().max(1);
    let pieces = read_pieces(
        request.source.clone(),
        STREAM_PIECE_SIZE as u64,
        move |sent| on_progress((sent * 99 / total) as u8),
    );
    Body::wrap_stream(pieces)
}

fn truncate_body(text: &str) -> String {
    text.chars().take(MAX_ERROR_BODY_LEN).collect()
}

/// 解析统一响应，HTTP 错误和业务错误都转换为传输错误
async fn check_response(response: Response, action: &str) -> Result<ApiResponse, TransportError> {
    let status = response.status();
    let text = response.text().await?;

    debug!("{}响应: status={}, body={}", action, status, truncate_body(&text));

    let parsed = serde_json::from_str::<ApiResponse>(&text);

    if !status.is_success() {
        let detail = match parsed {
            Ok(body) if !body.message.is_empty() => body.message,
            _ => truncate_body(&text),
        };
        error!("{}失败: HTTP {}, {}", action, status, detail);
        return Err(TransportError::new(
            UploadErrorKind::from_status(status.as_u16()),
            format!("{}失败: HTTP {}: {}", action, status.as_u16(), detail),
        ));
    }

    let body = parsed.map_err(|e| {
        TransportError::new(
            UploadErrorKind::InvalidResponse,
            format!("解析{}响应失败: {}, body={}", action, e, truncate_body(&text)),
        )
    })?;

    if !body.is_success() {
        error!("{}失败: code={}, message={}", action, body.code, body.message);
        return Err(TransportError::new(
            UploadErrorKind::Rejected,
            format!("{}失败: {}", action, body.message),
        ));
    }

    Ok(body)
}

#[async_trait]
impl UploadEndpoint for FileNestClient {
    async fn upload_direct(
        &self,
        request: DirectUploadRequest,
        on_progress: ChunkProgressFn,
    ) -> Result<(), TransportError> {
        let size = request.size();
        info!(
            "上传文件: path={}, file={}, size={}",
            request.destination_path, request.file_name, size
        );

        let part = multipart::Part::stream_with_length(source_body(&request, on_progress), size)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("fileName", request.file_name)
            .text("path", request.destination_path)
            .text("override", request.overwrite.to_string());

        let response = self.post("upload").multipart(form).send().await?;
        check_response(response, "上传文件").await?;
        Ok(())
    }

    async fn upload_chunk(
        &self,
        request: ChunkRequest,
        on_progress: ChunkProgressFn,
    ) -> Result<(), TransportError> {
        let len = request.data.len() as u64;
        debug!(
            "上传分片: file={}, part={}/{}, size={}",
            request.file_name, request.index, request.total_chunks, len
        );

        let part = multipart::Part::stream_with_length(progress_body(request.data, on_progress), len)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("fileName", request.file_name)
            .text("path", request.destination_path)
            .text("indexChunk", request.index.to_string())
            .text("totalChunks", request.total_chunks.to_string())
            .text("override", request.overwrite.to_string());

        let response = self.post("upload-chunk").multipart(form).send().await?;
        check_response(response, "上传分片").await?;
        Ok(())
    }

    async fn merge_chunks(&self, manifest: &UploadManifest) -> Result<(), TransportError> {
        let response = self.post("merge-chunks").json(manifest).send().await?;
        check_response(response, "合并分片").await?;
        Ok(())
    }
}
