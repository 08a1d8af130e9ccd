use anyhow::{Context, Result};
use filenest_upload::{
    logging, AppConfig, FileNestClient, FileSource, UploadEngine, UploadJob, UploadOutcome,
};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

const USAGE: &str = "用法: filenest-upload <本地文件> <远端目录> [--overwrite] [--config <配置文件>]";

/// 命令行参数
#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    local_file: String,
    remote_dir: String,
    overwrite: bool,
    config_path: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs> {
    let mut positional = Vec::new();
    let mut overwrite = false;
    let mut config_path = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--overwrite" => overwrite = true,
            "--config" => {
                let path = args.next().context("--config 缺少配置文件路径")?;
                config_path = Some(path);
            }
            flag if flag.starts_with("--") => anyhow::bail!("未知参数: {}\n{}", flag, USAGE),
            _ => positional.push(arg),
        }
    }

    let [local_file, remote_dir]: [String; 2] = positional
        .try_into()
        .map_err(|_| anyhow::anyhow!("{}", USAGE))?;

    Ok(CliArgs {
        local_file,
        remote_dir,
        overwrite,
        config_path,
    })
}

async fn load_config(path: Option<&str>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from_file(path)
            .await
            .with_context(|| format!("加载配置文件失败: {}", path)),
        None => Ok(AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let config = load_config(args.config_path.as_deref()).await?;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("FileNest Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let source = FileSource::open(&args.local_file)
        .await
        .with_context(|| format!("无法打开本地文件: {}", args.local_file))?;
    let file_name = source
        .file_name()
        .with_context(|| format!("无法获取文件名: {}", args.local_file))?;

    let client = FileNestClient::new(&config.server)?;
    let engine = UploadEngine::new(Arc::new(client), config.upload.clone())?;
    let job = UploadJob::new(
        Arc::new(source),
        args.remote_dir.clone(),
        file_name,
        args.overwrite,
        &config.upload,
    );

    // Ctrl+C 取消上传
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消上传...");
            ctrl_c_cancel.cancel();
        }
    });

    let outcome = engine
        .run_with_cancel(
            job,
            Arc::new(|percent: u8| {
                eprint!("\r上传进度: {:>3}%", percent);
                let _ = std::io::stderr().flush();
            }),
            cancel,
        )
        .await;
    eprintln!();

    match outcome? {
        UploadOutcome::Direct => info!("✓ 上传完成: {}", args.local_file),
        UploadOutcome::Chunked { total_chunks } => {
            info!("✓ 上传完成: {} ({} 个分片)", args.local_file, total_chunks)
        }
    }

    Ok(())
}
