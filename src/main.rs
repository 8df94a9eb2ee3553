use anyhow::{Context, Result};
use chunked_upload::{
    config::AppConfig,
    events::{EventKind, UploadEvent},
    logging,
    uploader::{FileSource, FileStatus, UploadDriver},
};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// 分片断点续传上传工具
#[derive(Debug, Parser)]
#[command(name = "chunked-upload", version, about)]
struct Cli {
    /// 上传目标地址（覆盖配置文件）
    #[arg(short, long)]
    target: Option<String>,

    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: String,

    /// 分片大小（字节）
    #[arg(long)]
    chunk_size: Option<u64>,

    /// 同时上传分片数
    #[arg(short, long)]
    simultaneous: Option<usize>,

    /// 上传前探测服务端已有分片
    #[arg(long)]
    test_chunks: bool,

    /// 分片最大重试次数
    #[arg(long)]
    retries: Option<u32>,

    /// 以 JSON 行输出所有事件到标准输出
    #[arg(long)]
    json_events: bool,

    /// 要上传的文件
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Cli {
    /// 命令行参数覆盖配置文件
    fn apply(&self, config: &mut AppConfig) {
        if let Some(target) = &self.target {
            config.upload.target = target.clone();
        }
        if let Some(chunk_size) = self.chunk_size {
            config.upload.chunk_size = chunk_size;
        }
        if let Some(simultaneous) = self.simultaneous {
            config.upload.simultaneous_uploads = simultaneous;
        }
        if let Some(retries) = self.retries {
            config.upload.max_chunk_retries = retries;
        }
        if self.test_chunks {
            config.upload.test_chunks = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config).await;
    cli.apply(&mut config);
    config.upload.validate().context("上传配置无效")?;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!(
        "chunked-upload v{} 启动中... 目标: {}",
        env!("CARGO_PKG_VERSION"),
        config.upload.target
    );

    let mut sources = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        match FileSource::from_path(path).await {
            Ok(source) => sources.push(source),
            Err(e) => warn!("跳过文件 {:?}: {:#}", path, e),
        }
    }

    let mut driver = UploadDriver::http(&config)?;
    let manager = driver.manager_mut();

    if cli.json_events {
        manager.on_all(|event| match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("事件序列化失败: {}", e),
        });
    }

    manager.on(EventKind::FileSuccess, |event| {
        if let UploadEvent::FileSuccess { file, .. } = event {
            info!("✓ 上传完成: {}", file);
        }
    });
    manager.on(EventKind::FileError, |event| {
        if let UploadEvent::FileError { file, message, .. } = event {
            error!("✗ 上传失败: {}: {}", file, message);
        }
    });
    manager.on(EventKind::FileRetry, |event| {
        if let UploadEvent::FileRetry { file, chunk } = event {
            warn!("分片重试: {} #{}", file, chunk);
        }
    });

    let added = manager.add_files(sources)?;
    if added.is_empty() {
        warn!("没有可上传的文件");
        return Ok(());
    }
    manager.upload();

    let interrupted = tokio::select! {
        _ = driver.run_until_idle() => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        info!("收到 Ctrl+C，取消全部上传...");
        driver.manager_mut().cancel_all();
        return Ok(());
    }

    let manager = driver.manager();
    let failed: Vec<String> = manager
        .files()
        .iter()
        .filter(|f| f.status() == FileStatus::Error)
        .map(|f| f.name().to_string())
        .collect();

    info!(
        "上传结束: {} 个文件, {} bytes, 失败 {} 个",
        manager.files().len(),
        manager.size_uploaded(),
        failed.len()
    );

    if !failed.is_empty() {
        anyhow::bail!("以下文件上传失败: {}", failed.join(", "));
    }

    Ok(())
}
