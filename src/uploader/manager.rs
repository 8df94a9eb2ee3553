// 上传管理器
//
// 负责协调所有上传文件：
// - 文件注册（文件夹过滤、重复过滤）
// - 全局调度（每次状态变化后同步跑一轮调度，填满空闲槽位）
// - 分片完成 / 失败 / 重试退避
// - 初始化 → 上传 → 收尾 生命周期钩子
// - 暂停 / 恢复 / 重试 / 移除
// - 进度、速度汇总与事件发布
//
// 管理器是单线程、无 IO 的：网络请求交给 Transport，时间来自 Clock，
// 所有外部完成通知都通过 `on_*` / `*_finished` 方法回送，
// 每个入口返回前都会重新调度一次，因此不需要任何锁

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::events::{EventBus, EventKind, SubscriptionId, UploadEvent};
use crate::uploader::hooks::{HookOutcome, UploadHooks};
use crate::uploader::scheduler::{Dispatch, SchedulePolicy, UploadChunkScheduler};
use crate::uploader::task::{IdentifierGenerator, Released};
use crate::uploader::timer::{Clock, MonotonicClock, TimerId, TimerQueue};
use crate::uploader::transport::{
    build_url, chunk_params, ChunkRequest, Query, RequestId, RequestKind, Target, Transport,
    TransportEvent,
};
use crate::uploader::{FileId, FileSource, FileStatus, UploadFile};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 定时器用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// 分片重试退避结束
    ChunkRetry { file: FileId, chunk: usize },
    /// 延迟发布 complete
    Complete,
}

/// 进行中的请求
#[derive(Debug, Clone, Copy)]
struct InFlight {
    file: FileId,
    chunk: usize,
    kind: RequestKind,
}

/// 上传管理器
pub struct UploadManager<T: Transport> {
    config: UploadConfig,
    scheduler: UploadChunkScheduler,
    transport: T,
    clock: Arc<dyn Clock>,
    timers: TimerQueue<TimerKind>,
    events: EventBus,
    hooks: UploadHooks,
    identifier_generator: Option<IdentifierGenerator>,
    target: Target,
    query: Query,
    next_request_id: u64,
    in_flight: HashMap<RequestId, InFlight>,
    /// upload() 是否已调用过，之前不启动任何分片
    started: bool,
    /// 所有文件到达终态时是否需要发布 complete
    complete_armed: bool,
    complete_timer: Option<TimerId>,
}

impl<T: Transport> UploadManager<T> {
    /// 创建上传管理器（使用单调时钟）
    pub fn new(config: UploadConfig, transport: T) -> UploadResult<Self> {
        Self::with_clock(config, transport, Arc::new(MonotonicClock::new()))
    }

    /// 使用指定时钟创建上传管理器
    pub fn with_clock(
        config: UploadConfig,
        transport: T,
        clock: Arc<dyn Clock>,
    ) -> UploadResult<Self> {
        config.validate()?;

        info!(
            "创建上传管理器: 分片大小={}, 同时上传分片数={}, 最大重试={}, 重试间隔={}ms",
            config.chunk_size,
            config.simultaneous_uploads,
            config.max_chunk_retries,
            config.chunk_retry_interval_ms
        );

        let target = Target::Static(config.target.clone());
        let query = Query::Static(config.query_pairs());

        Ok(Self {
            scheduler: UploadChunkScheduler::new(config.simultaneous_uploads),
            config,
            transport,
            clock,
            timers: TimerQueue::new(),
            events: EventBus::new(),
            hooks: UploadHooks::default(),
            identifier_generator: None,
            target,
            query,
            next_request_id: 1,
            in_flight: HashMap::new(),
            started: false,
            complete_armed: false,
            complete_timer: None,
        })
    }

    // =====================================================
    // 设置
    // =====================================================

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn set_hooks(&mut self, hooks: UploadHooks) {
        debug!("设置生命周期钩子: {:?}", hooks);
        self.hooks = hooks;
    }

    pub fn set_identifier_generator<F>(&mut self, generator: F)
    where
        F: Fn(&FileSource) -> String + Send + 'static,
    {
        self.identifier_generator = Some(Box::new(generator));
    }

    pub fn set_target(&mut self, target: Target) {
        self.target = target;
    }

    pub fn set_query(&mut self, query: Query) {
        self.query = query;
    }

    /// 动态调整同时上传分片数
    pub fn set_simultaneous_uploads(&mut self, max: usize) {
        info!("🔧 上传管理器: 动态调整同时上传分片数为 {}", max);
        self.config.simultaneous_uploads = max.max(1);
        self.scheduler.set_max_simultaneous(max);
        self.pump();
    }

    /// 订阅指定种类的事件
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&UploadEvent) + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    /// 订阅全部事件
    pub fn on_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&UploadEvent) + Send + 'static,
    {
        self.events.subscribe_all(handler)
    }

    pub fn off(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    // =====================================================
    // 文件注册
    // =====================================================

    /// 添加单个文件，被过滤时返回 None
    pub fn add_file(&mut self, source: FileSource) -> UploadResult<Option<FileId>> {
        Ok(self.add_files(vec![source])?.into_iter().next())
    }

    /// 批量添加文件
    ///
    /// 文件夹和重复标识的条目被静默跳过；
    /// 每个通过的文件发布 fileAdded，整批再发布 filesAdded 和 filesSubmitted
    pub fn add_files(&mut self, sources: Vec<FileSource>) -> UploadResult<Vec<FileId>> {
        let mut accepted = Vec::new();

        for source in sources {
            if source.is_folder_like() {
                debug!("跳过文件夹条目: {} ({} bytes)", source.name, source.size);
                continue;
            }

            let identifier = match &self.identifier_generator {
                Some(generate) => generate(&source),
                None => source.default_identifier(),
            };

            if !self.config.allow_duplicate_uploads
                && self.scheduler.find_by_identifier(&identifier).is_some()
            {
                debug!("跳过重复文件: {} (标识={})", source.name, identifier);
                continue;
            }

            let id = self.scheduler.allocate_id();
            let file = UploadFile::new(
                id,
                identifier,
                source,
                self.config.chunk_size,
                self.config.speed_smoothing_factor,
                self.config.progress_callbacks_interval(),
            )?;

            info!(
                "添加上传文件: {} name={}, size={}, 分片数={}",
                id,
                file.name(),
                file.size(),
                file.chunks().len()
            );

            self.scheduler.register(file);
            self.events.publish(&UploadEvent::FileAdded { file: id });
            accepted.push(id);
        }

        if !accepted.is_empty() {
            self.events.publish(&UploadEvent::FilesAdded {
                files: accepted.clone(),
            });
            self.events.publish(&UploadEvent::FilesSubmitted {
                files: accepted.clone(),
            });
            self.pump();
        }

        Ok(accepted)
    }

    /// 移除文件，中止其所有进行中的请求
    pub fn remove_file(&mut self, id: FileId) -> UploadResult<()> {
        let mut file = self
            .scheduler
            .remove(id)
            .ok_or(UploadError::FileNotFound(id))?;
        let released = file.release_all();
        self.release(released);
        info!("移除上传文件: {} ({})", id, file.name());
        self.pump();
        Ok(())
    }

    /// 移除全部文件
    pub fn cancel_all(&mut self) {
        let ids: Vec<FileId> = self.scheduler.files().iter().map(|f| f.id()).collect();
        info!("取消全部上传: {} 个文件", ids.len());
        for id in ids {
            if let Some(mut file) = self.scheduler.remove(id) {
                let released = file.release_all();
                self.release(released);
            }
        }
        if let Some(timer) = self.complete_timer.take() {
            self.timers.cancel(timer);
        }
        self.complete_armed = false;
    }

    // =====================================================
    // 上传控制
    // =====================================================

    /// 开始上传
    pub fn upload(&mut self) {
        info!("开始上传: {} 个文件", self.scheduler.files().len());
        self.events.publish(&UploadEvent::UploadStart);
        self.started = true;
        self.complete_armed = true;
        self.pump();
    }

    /// 暂停文件：中止进行中的分片，腾出的槽位交给其他文件
    pub fn pause_file(&mut self, id: FileId) -> UploadResult<()> {
        let file = self
            .scheduler
            .get_mut(id)
            .ok_or(UploadError::FileNotFound(id))?;
        let released = file.pause();
        info!(
            "暂停上传文件: {} (中止 {} 个请求)",
            id,
            released.requests.len()
        );
        self.release(released);
        self.pump();
        Ok(())
    }

    /// 恢复文件，下一轮调度时重新参与选择
    pub fn resume_file(&mut self, id: FileId) -> UploadResult<()> {
        let file = self
            .scheduler
            .get_mut(id)
            .ok_or(UploadError::FileNotFound(id))?;
        file.resume();
        info!("恢复上传文件: {}", id);
        self.complete_armed = true;
        self.pump();
        Ok(())
    }

    /// 重试失败的文件
    ///
    /// 总是从初始化阶段重新开始，已成功的分片保留并被跳过
    pub fn retry_file(&mut self, id: FileId) -> UploadResult<()> {
        let file = self
            .scheduler
            .get_mut(id)
            .ok_or(UploadError::FileNotFound(id))?;
        file.prepare_retry()?;
        info!("重试上传文件: {}", id);
        self.complete_armed = true;
        self.pump();
        Ok(())
    }

    pub fn pause_all(&mut self) {
        let ids: Vec<FileId> = self.scheduler.files().iter().map(|f| f.id()).collect();
        for id in ids {
            if let Some(file) = self.scheduler.get_mut(id) {
                let released = file.pause();
                self.release(released);
            }
        }
        info!("暂停全部上传");
        self.pump();
    }

    pub fn resume_all(&mut self) {
        for file in self.scheduler.files_mut() {
            file.resume();
        }
        info!("恢复全部上传");
        self.complete_armed = true;
        self.pump();
    }

    // =====================================================
    // 传输层通知
    // =====================================================

    /// 处理传输层通知
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Progress {
                request,
                loaded,
                total,
            } => self.on_chunk_progress(request, loaded, total),
            TransportEvent::Success { request, body } => self.on_chunk_success(request, body),
            TransportEvent::Failure {
                request,
                status,
                body,
            } => self.on_chunk_failure(request, status, body),
        }
    }

    /// 分片字节进度
    pub fn on_chunk_progress(&mut self, request: RequestId, loaded: u64, total: u64) {
        let Some(slot) = self.lookup(request) else {
            return;
        };
        if slot.kind == RequestKind::Test {
            return;
        }

        let now = self.clock.now();
        let Some(file) = self.scheduler.get_mut(slot.file) else {
            return;
        };
        if let Some(chunk) = file.chunk_mut(slot.chunk) {
            chunk.record_progress(loaded, total);
        }

        if file.throttler_mut().should_emit(now) {
            file.sample_speed(now);
            self.publish_progress(slot.file, slot.chunk);
        }

        self.pump();
    }

    /// 分片请求成功
    pub fn on_chunk_success(&mut self, request: RequestId, body: String) {
        let Some(slot) = self.take(request) else {
            return;
        };
        let now = self.clock.now();
        let Some(file) = self.scheduler.get_mut(slot.file) else {
            return;
        };

        if let Some(chunk) = file.chunk_mut(slot.chunk) {
            chunk.mark_success();
        }
        file.set_last_response(body.clone());
        file.refresh_current_speed();
        file.throttler_mut().force_emit(now);
        let finished = file.all_chunks_succeeded();

        debug!("分片上传成功: {} #{} ({:?})", slot.file, slot.chunk, slot.kind);

        self.publish_progress(slot.file, slot.chunk);

        if finished {
            info!("文件所有分片上传完成: {}", slot.file);
            self.events.publish(&UploadEvent::FileUploadSuccess {
                file: slot.file,
                message: body,
                chunk: slot.chunk,
            });
            self.begin_finalize(slot.file);
        }

        self.complete_armed = true;
        self.pump();
    }

    /// 分片请求失败
    ///
    /// 永久错误码或重试次数用尽时整个文件失败，否则分片回到 pending 等待重试
    pub fn on_chunk_failure(&mut self, request: RequestId, status: u16, body: String) {
        let Some(slot) = self.take(request) else {
            return;
        };

        if slot.kind == RequestKind::Test {
            // 探测失败：同一槽位直接发起真正的上传
            debug!(
                "分片探测未命中: {} #{} (status={})，开始上传",
                slot.file, slot.chunk, status
            );
            self.send_chunk(slot.file, slot.chunk);
            self.pump();
            return;
        }

        let now = self.clock.now();
        let permanent = self.config.is_permanent_error(status);
        let max_retries = self.config.max_chunk_retries;
        let retry_interval = self.config.chunk_retry_interval();

        let Some(file) = self.scheduler.get_mut(slot.file) else {
            return;
        };
        let retries = file.chunk(slot.chunk).map_or(0, |c| c.retries());

        if permanent || retries >= max_retries {
            error!(
                "分片上传失败，文件终止: {} #{} (status={}, 已重试 {} 次): {}",
                slot.file, slot.chunk, status, retries, body
            );
            if let Some(chunk) = file.chunk_mut(slot.chunk) {
                chunk.mark_error();
            }
            let released = file.fail_permanently();
            file.set_last_response(body.clone());
            self.release(released);
            self.events.publish(&UploadEvent::FileError {
                file: slot.file,
                message: body,
                chunk: Some(slot.chunk),
            });
        } else {
            warn!(
                "分片上传失败，准备重试: {} #{} (status={}, 第 {}/{} 次)",
                slot.file,
                slot.chunk,
                status,
                retries + 1,
                max_retries
            );
            if let Some(chunk) = file.chunk_mut(slot.chunk) {
                chunk.mark_retry();
            }
            file.record_retry();
            file.refresh_current_speed();

            if !retry_interval.is_zero() {
                let timer = self.timers.schedule(
                    now + retry_interval,
                    TimerKind::ChunkRetry {
                        file: slot.file,
                        chunk: slot.chunk,
                    },
                );
                if let Some(chunk) = self
                    .scheduler
                    .get_mut(slot.file)
                    .and_then(|f| f.chunk_mut(slot.chunk))
                {
                    chunk.set_retry_timer(timer);
                }
            }

            self.events.publish(&UploadEvent::FileRetry {
                file: slot.file,
                chunk: slot.chunk,
            });
        }

        self.complete_armed = true;
        self.pump();
    }

    // =====================================================
    // 钩子确认
    // =====================================================

    /// 初始化钩子完成
    pub fn initialize_finished(&mut self, id: FileId, outcome: HookOutcome) -> UploadResult<()> {
        let file = self
            .scheduler
            .get_mut(id)
            .ok_or(UploadError::FileNotFound(id))?;
        if file.status() != FileStatus::Initializing {
            return Err(UploadError::InvalidState {
                file: id,
                status: file.status(),
                operation: "initialize_finished",
            });
        }

        match outcome {
            HookOutcome::Ok => {
                file.set_status(FileStatus::Uploading);
                let finished = file.all_chunks_succeeded();
                info!("文件初始化完成: {}", id);
                self.events.publish(&UploadEvent::FileInitialized { file: id });
                if finished {
                    self.begin_finalize(id);
                }
            }
            HookOutcome::Failed(message) => {
                file.mark_error();
                error!("文件初始化失败: {}: {}", id, message);
                self.events.publish(&UploadEvent::FileError {
                    file: id,
                    message,
                    chunk: None,
                });
            }
        }

        self.complete_armed = true;
        self.pump();
        Ok(())
    }

    /// 收尾钩子完成
    pub fn finalize_finished(&mut self, id: FileId, outcome: HookOutcome) -> UploadResult<()> {
        let file = self
            .scheduler
            .get_mut(id)
            .ok_or(UploadError::FileNotFound(id))?;
        if file.status() != FileStatus::Finalizing {
            return Err(UploadError::InvalidState {
                file: id,
                status: file.status(),
                operation: "finalize_finished",
            });
        }

        match outcome {
            HookOutcome::Ok => {
                file.set_status(FileStatus::Success);
                let message = file.last_response().unwrap_or_default().to_string();
                info!("✓ 文件上传成功: {}", id);
                self.events
                    .publish(&UploadEvent::FileSuccess { file: id, message });
            }
            HookOutcome::Failed(message) => {
                file.mark_error();
                error!("文件收尾失败: {}: {}", id, message);
                self.events.publish(&UploadEvent::FileError {
                    file: id,
                    message,
                    chunk: None,
                });
            }
        }

        self.complete_armed = true;
        self.pump();
        Ok(())
    }

    /// 分片预处理完成
    ///
    /// 文件仍在上传时立即发起请求；已暂停或已失败时分片保持 pending，
    /// 之后被重新选中时不再预处理
    pub fn preprocess_finished(&mut self, id: FileId, index: usize) -> UploadResult<()> {
        let file = self
            .scheduler
            .get_mut(id)
            .ok_or(UploadError::FileNotFound(id))?;
        let sendable = file.status() == FileStatus::Uploading && !file.is_paused();
        let Some(chunk) = file.chunk_mut(index) else {
            warn!("忽略预处理确认: {} 不存在分片 #{}", id, index);
            return Ok(());
        };
        if !chunk.finish_preprocess() {
            warn!("忽略过期的预处理确认: {} #{}", id, index);
            return Ok(());
        }

        debug!("分片预处理完成: {} #{}", id, index);
        if sendable && chunk.is_startable() {
            self.send_chunk(id, index);
        }

        self.pump();
        Ok(())
    }

    // =====================================================
    // 定时器
    // =====================================================

    /// 触发所有已到期的定时器
    pub fn tick(&mut self) {
        let now = self.clock.now();
        let mut fired = false;

        while let Some((timer, kind)) = self.timers.pop_due(now) {
            fired = true;
            match kind {
                TimerKind::ChunkRetry { file, chunk } => {
                    if let Some(c) = self
                        .scheduler
                        .get_mut(file)
                        .and_then(|f| f.chunk_mut(chunk))
                    {
                        if c.clear_retry_timer(timer) {
                            debug!("分片重试等待结束: {} #{}", file, chunk);
                        }
                    }
                }
                TimerKind::Complete => {
                    self.complete_timer = None;
                    if self.complete_armed && self.is_all_terminal() {
                        self.complete_armed = false;
                        info!("所有文件上传结束");
                        self.events.publish(&UploadEvent::Complete);
                    }
                }
            }
        }

        if fired {
            self.pump();
        }
    }

    /// 最近的定时器截止时间
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// 没有任何进行中的请求、定时器或等待中的钩子
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
            && self.timers.is_empty()
            && self.scheduler.active_slots() == 0
            && !self.scheduler.files().iter().any(|f| {
                matches!(
                    f.status(),
                    FileStatus::Initializing | FileStatus::Finalizing
                )
            })
    }

    // =====================================================
    // 查询
    // =====================================================

    pub fn file(&self, id: FileId) -> Option<&UploadFile> {
        self.scheduler.get(id)
    }

    pub fn files(&self) -> &[UploadFile] {
        self.scheduler.files()
    }

    pub fn file_by_identifier(&self, identifier: &str) -> Option<&UploadFile> {
        self.scheduler.find_by_identifier(identifier)
    }

    /// 当前占用的槽位数
    pub fn active_slots(&self) -> usize {
        self.scheduler.active_slots()
    }

    /// 任意文件在上传中
    pub fn is_uploading(&self) -> bool {
        self.scheduler.files().iter().any(|f| f.is_uploading())
    }

    pub fn total_size(&self) -> u64 {
        self.scheduler.files().iter().map(|f| f.size()).sum()
    }

    pub fn size_uploaded(&self) -> u64 {
        self.scheduler.files().iter().map(|f| f.size_uploaded()).sum()
    }

    /// 全局进度，按文件大小加权；全部为空文件时按文件数平均
    pub fn progress(&self) -> f64 {
        let files = self.scheduler.files();
        if files.is_empty() {
            return 0.0;
        }

        let total = self.total_size();
        if total == 0 {
            return files.iter().map(|f| f.progress()).sum::<f64>() / files.len() as f64;
        }

        let done: f64 = files
            .iter()
            .map(|f| f.progress() * f.size() as f64)
            .sum();
        (done / total as f64).clamp(0.0, 1.0)
    }

    /// 未暂停文件的当前速度之和
    pub fn current_speed(&self) -> f64 {
        self.scheduler
            .files()
            .iter()
            .filter(|f| !f.is_paused())
            .map(|f| f.current_speed())
            .sum()
    }

    /// 未暂停文件的平均速度之和
    pub fn average_speed(&self) -> f64 {
        self.scheduler
            .files()
            .iter()
            .filter(|f| !f.is_paused())
            .map(|f| f.average_speed())
            .sum()
    }

    /// 全局剩余时间（秒）
    pub fn time_remaining(&self) -> f64 {
        let remaining: u64 = self
            .scheduler
            .files()
            .iter()
            .filter(|f| !f.is_paused())
            .map(|f| f.remaining_bytes())
            .sum();
        crate::uploader::speed::time_remaining(remaining, self.current_speed(), false)
    }

    // =====================================================
    // 内部
    // =====================================================

    /// 状态变化后的统一出口：调度、速度归零、检查 complete
    fn pump(&mut self) {
        if self.started {
            let policy = SchedulePolicy {
                has_initialize: self.hooks.has_initialize(),
                has_preprocess: self.hooks.has_preprocess(),
            };
            let plan = self.scheduler.schedule(policy);
            for dispatch in plan {
                self.execute(dispatch);
            }
        }

        for file in self.scheduler.files_mut() {
            file.settle_speed();
        }

        if self.complete_armed
            && self.complete_timer.is_none()
            && !self.scheduler.files().is_empty()
            && self.is_all_terminal()
        {
            let now = self.clock.now();
            self.complete_timer = Some(self.timers.schedule(now, TimerKind::Complete));
        }
    }

    fn execute(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Initialize(id) => {
                if let Some(hook) = self.hooks.initialize.as_mut() {
                    if let Some(file) = self.scheduler.get(id) {
                        info!("开始初始化文件: {}", id);
                        hook(file);
                    }
                    return;
                }

                self.events.publish(&UploadEvent::FileInitialized { file: id });
                // 重试时分片可能已全部成功
                if self
                    .scheduler
                    .get(id)
                    .map_or(false, |f| f.all_chunks_succeeded())
                {
                    self.begin_finalize(id);
                }
            }
            Dispatch::Preprocess { file, chunk } => {
                if let Some(hook) = self.hooks.preprocess.as_mut() {
                    if let Some(c) = self.scheduler.get(file).and_then(|f| f.chunk(chunk)) {
                        debug!("开始预处理分片: {} #{}", file, chunk);
                        hook(c);
                    }
                }
            }
            Dispatch::Send { file, chunk } => self.send_chunk(file, chunk),
        }
    }

    /// 所有分片成功后进入收尾
    fn begin_finalize(&mut self, id: FileId) {
        let Some(file) = self.scheduler.get_mut(id) else {
            return;
        };

        match self.hooks.finalize.as_mut() {
            Some(hook) => {
                file.set_status(FileStatus::Finalizing);
                info!("开始收尾文件: {}", id);
                hook(file);
            }
            None => {
                file.set_status(FileStatus::Success);
                let message = file.last_response().unwrap_or_default().to_string();
                info!("✓ 文件上传成功: {}", id);
                self.events
                    .publish(&UploadEvent::FileSuccess { file: id, message });
            }
        }
    }

    /// 为分片发起请求（首次且开启探测时先发探测请求）
    fn send_chunk(&mut self, file_id: FileId, index: usize) {
        let now = self.clock.now();
        let request_id = RequestId(self.next_request_id);
        let test_chunks = self.config.test_chunks;

        let Some(file) = self.scheduler.get_mut(file_id) else {
            return;
        };
        let Some(chunk) = file.chunk_mut(index) else {
            return;
        };

        let kind = if test_chunks && !chunk.is_tested() {
            chunk.mark_tested();
            RequestKind::Test
        } else {
            RequestKind::Upload
        };
        chunk.mark_uploading(request_id, now);
        self.next_request_id += 1;

        let Some(file) = self.scheduler.get(file_id) else {
            return;
        };
        let Some(chunk) = file.chunk(index) else {
            return;
        };

        let target = self.target.resolve(file, chunk);
        let mut params = self.query.resolve(file, chunk);
        params.extend(chunk_params(file, chunk, file.chunk_size()));
        let url = build_url(&target, &params);

        let request = ChunkRequest {
            id: request_id,
            kind,
            file: file_id,
            chunk_index: index,
            range: chunk.range.clone(),
            path: file.path().map(|p| p.to_path_buf()),
            url,
            params,
        };

        debug!(
            "发起分片请求: {} {} #{} ({:?}, bytes={}..{})",
            request_id, file_id, index, kind, request.range.start, request.range.end
        );

        self.in_flight.insert(
            request_id,
            InFlight {
                file: file_id,
                chunk: index,
                kind,
            },
        );
        self.transport.start(request);
    }

    /// 查找进行中的请求，过期请求返回 None
    fn lookup(&self, request: RequestId) -> Option<InFlight> {
        let slot = match self.in_flight.get(&request) {
            Some(slot) => *slot,
            None => {
                warn!("忽略过期的传输通知: {}", request);
                return None;
            }
        };

        let owned = self
            .scheduler
            .get(slot.file)
            .and_then(|f| f.chunk(slot.chunk))
            .map_or(false, |c| c.request() == Some(request));
        if !owned {
            warn!("忽略过期的传输通知: {}", request);
            return None;
        }
        Some(slot)
    }

    /// 取出进行中的请求（终态通知）
    fn take(&mut self, request: RequestId) -> Option<InFlight> {
        let slot = self.lookup(request)?;
        self.in_flight.remove(&request);
        Some(slot)
    }

    /// 中止请求、取消定时器
    fn release(&mut self, released: Released) {
        for request in released.requests {
            self.in_flight.remove(&request);
            self.transport.abort(request);
        }
        for timer in released.timers {
            self.timers.cancel(timer);
        }
    }

    fn publish_progress(&mut self, file: FileId, chunk: usize) {
        let file_progress = self.scheduler.get(file).map_or(0.0, |f| f.progress());
        self.events.publish(&UploadEvent::FileProgress {
            file,
            chunk,
            progress: file_progress,
        });
        let progress = self.progress();
        self.events.publish(&UploadEvent::Progress { progress });
    }

    fn is_all_terminal(&self) -> bool {
        self.scheduler.all_terminal()
    }
}

impl<T: Transport> std::fmt::Debug for UploadManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("files", &self.scheduler.files().len())
            .field("active_slots", &self.scheduler.active_slots())
            .field("in_flight", &self.in_flight.len())
            .field("timers", &self.timers.len())
            .field("started", &self.started)
            .finish()
    }
}
