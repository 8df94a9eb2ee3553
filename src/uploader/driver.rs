// 异步驱动
//
// UploadManager 本身不做 IO，也不等待。UploadDriver 在 tokio 上运行它：
// - 传输层和异步钩子的完成通知经 mpsc 通道送回，逐条交给管理器处理
// - 没有通知时睡到最近的定时器截止时间（重试退避、complete）
// - 管理器空闲（无进行中请求、无定时器、无等待中的钩子）时返回
//
// 所有状态变更都在驱动循环所在的任务内串行发生

use crate::config::{AppConfig, UploadConfig};
use crate::uploader::hooks::{HookOutcome, UploadHooks};
use crate::uploader::http::HttpTransport;
use crate::uploader::manager::UploadManager;
use crate::uploader::timer::MonotonicClock;
use crate::uploader::transport::{Transport, TransportEvent};
use crate::uploader::{FileId, UploadChunk, UploadFile};
use anyhow::Result;
use async_trait::async_trait;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 驱动消息
#[derive(Debug, Clone)]
pub enum DriverMessage {
    /// 传输层通知
    Transport(TransportEvent),
    /// 初始化钩子完成
    InitializeFinished { file: FileId, outcome: HookOutcome },
    /// 收尾钩子完成
    FinalizeFinished { file: FileId, outcome: HookOutcome },
    /// 分片预处理完成
    PreprocessFinished { file: FileId, chunk: usize },
    /// 外部控制
    Pause(FileId),
    Resume(FileId),
    Retry(FileId),
    Remove(FileId),
    PauseAll,
    CancelAll,
}

/// 向驱动发送消息的句柄
#[derive(Debug, Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverMessage>,
}

impl DriverHandle {
    /// 创建句柄和对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DriverMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// 发送消息，驱动已退出时返回 false
    pub fn send(&self, message: DriverMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn send_transport(&self, event: TransportEvent) -> bool {
        self.send(DriverMessage::Transport(event))
    }
}

/// 传给异步钩子的文件快照
#[derive(Debug, Clone)]
pub struct FileContext {
    pub file: FileId,
    pub identifier: String,
    pub name: String,
    pub relative_path: String,
    pub size: u64,
    pub path: Option<PathBuf>,
    pub total_chunks: usize,
}

impl From<&UploadFile> for FileContext {
    fn from(file: &UploadFile) -> Self {
        Self {
            file: file.id(),
            identifier: file.unique_identifier().to_string(),
            name: file.name().to_string(),
            relative_path: file.relative_path().to_string(),
            size: file.size(),
            path: file.path().map(|p| p.to_path_buf()),
            total_chunks: file.chunks().len(),
        }
    }
}

/// 传给预处理钩子的分片快照
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub file: FileId,
    pub index: usize,
    pub range: Range<u64>,
}

impl From<&UploadChunk> for ChunkContext {
    fn from(chunk: &UploadChunk) -> Self {
        Self {
            file: chunk.file,
            index: chunk.index,
            range: chunk.range.clone(),
        }
    }
}

/// 异步生命周期钩子
///
/// `has_*` 返回 false 的阶段直接放行，对应的方法不会被调用
#[async_trait]
pub trait UploadLifecycle: Send + Sync + 'static {
    fn has_initialize(&self) -> bool {
        false
    }

    fn has_finalize(&self) -> bool {
        false
    }

    fn has_preprocess(&self) -> bool {
        false
    }

    async fn initialize(&self, _file: FileContext) -> HookOutcome {
        HookOutcome::Ok
    }

    async fn finalize(&self, _file: FileContext) -> HookOutcome {
        HookOutcome::Ok
    }

    async fn preprocess(&self, _chunk: ChunkContext) {}
}

/// 上传驱动
pub struct UploadDriver<T: Transport> {
    manager: UploadManager<T>,
    clock: MonotonicClock,
    handle: DriverHandle,
    rx: mpsc::UnboundedReceiver<DriverMessage>,
}

impl UploadDriver<HttpTransport> {
    /// 使用 HTTP 传输创建驱动
    pub fn http(config: &AppConfig) -> Result<Self> {
        Self::with_transport(config.upload.clone(), |handle| {
            HttpTransport::new(&config.http, &config.upload, handle)
        })
    }
}

impl<T: Transport> UploadDriver<T> {
    /// 使用自定义传输创建驱动，传输通过句柄回送通知
    pub fn with_transport<F>(config: UploadConfig, make_transport: F) -> Result<Self>
    where
        F: FnOnce(DriverHandle) -> Result<T>,
    {
        let (handle, rx) = DriverHandle::channel();
        let clock = MonotonicClock::new();
        let transport = make_transport(handle.clone())?;
        let manager = UploadManager::with_clock(config, transport, Arc::new(clock.clone()))?;

        Ok(Self {
            manager,
            clock,
            handle,
            rx,
        })
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle.clone()
    }

    pub fn manager(&self) -> &UploadManager<T> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut UploadManager<T> {
        &mut self.manager
    }

    /// 安装异步钩子
    ///
    /// 钩子在独立任务中运行，完成后通过通道回送确认
    pub fn set_lifecycle(&mut self, lifecycle: Arc<dyn UploadLifecycle>) {
        let mut hooks = UploadHooks::new();

        if lifecycle.has_initialize() {
            let lifecycle = lifecycle.clone();
            let handle = self.handle.clone();
            hooks = hooks.with_initialize(move |file: &UploadFile| {
                let lifecycle = lifecycle.clone();
                let handle = handle.clone();
                let context = FileContext::from(file);
                tokio::spawn(async move {
                    let file = context.file;
                    let outcome = lifecycle.initialize(context).await;
                    handle.send(DriverMessage::InitializeFinished { file, outcome });
                });
            });
        }

        if lifecycle.has_finalize() {
            let lifecycle = lifecycle.clone();
            let handle = self.handle.clone();
            hooks = hooks.with_finalize(move |file: &UploadFile| {
                let lifecycle = lifecycle.clone();
                let handle = handle.clone();
                let context = FileContext::from(file);
                tokio::spawn(async move {
                    let file = context.file;
                    let outcome = lifecycle.finalize(context).await;
                    handle.send(DriverMessage::FinalizeFinished { file, outcome });
                });
            });
        }

        if lifecycle.has_preprocess() {
            let handle = self.handle.clone();
            hooks = hooks.with_preprocess(move |chunk: &UploadChunk| {
                let lifecycle = lifecycle.clone();
                let handle = handle.clone();
                let context = ChunkContext::from(chunk);
                tokio::spawn(async move {
                    let (file, chunk) = (context.file, context.index);
                    lifecycle.preprocess(context).await;
                    handle.send(DriverMessage::PreprocessFinished { file, chunk });
                });
            });
        }

        self.manager.set_hooks(hooks);
    }

    /// 运行直到管理器空闲
    pub async fn run_until_idle(&mut self) {
        info!("上传驱动开始运行");

        loop {
            self.manager.tick();
            if self.manager.is_idle() {
                break;
            }

            let deadline = self
                .manager
                .next_deadline()
                .map(|at| self.clock.instant_at(at));

            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.dispatch(message),
                    None => break,
                },
                _ = sleep_until(deadline) => {}
            }
        }

        info!(
            "上传驱动空闲: 进度={:.1}%, 已上传 {}/{} bytes",
            self.manager.progress() * 100.0,
            self.manager.size_uploaded(),
            self.manager.total_size()
        );
    }

    fn dispatch(&mut self, message: DriverMessage) {
        let result = match message {
            DriverMessage::Transport(event) => {
                self.manager.on_transport_event(event);
                Ok(())
            }
            DriverMessage::InitializeFinished { file, outcome } => {
                self.manager.initialize_finished(file, outcome)
            }
            DriverMessage::FinalizeFinished { file, outcome } => {
                self.manager.finalize_finished(file, outcome)
            }
            DriverMessage::PreprocessFinished { file, chunk } => {
                self.manager.preprocess_finished(file, chunk)
            }
            DriverMessage::Pause(file) => self.manager.pause_file(file),
            DriverMessage::Resume(file) => self.manager.resume_file(file),
            DriverMessage::Retry(file) => self.manager.retry_file(file),
            DriverMessage::Remove(file) => self.manager.remove_file(file),
            DriverMessage::PauseAll => {
                self.manager.pause_all();
                Ok(())
            }
            DriverMessage::CancelAll => {
                self.manager.cancel_all();
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("忽略驱动消息: {}", e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => {
            debug!("等待定时器: {:?}", at);
            tokio::time::sleep_until(at).await
        }
        None => std::future::pending().await,
    }
}
