// 上传文件定义
//
// UploadFile 独占持有自己的分片序列，负责：
// - 把分片状态汇总为文件状态、进度、速度
// - 初始化 → 上传 → 收尾 的生命周期状态
// - 文件级暂停 / 恢复 / 重试
//
// 网络请求、钩子调用和事件发布由 UploadManager 完成，这里只做状态变更

use crate::error::{UploadError, UploadResult};
use crate::events::ProgressThrottler;
use crate::uploader::chunk::{split_ranges, ChunkStatus, UploadChunk};
use crate::uploader::speed::{time_remaining, SpeedTracker};
use crate::uploader::timer::TimerId;
use crate::uploader::transport::RequestId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 文件系统目录块大小（用于识别被当作文件提交的目录）
pub const DIRECTORY_BLOCK_SIZE: u64 = 4096;

/// 注册表中的文件 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file-{}", self.0)
    }
}

/// 待上传文件的描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 相对路径（目录上传时），如 "2024/01/photo.jpg"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    /// 本地文件路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// 是否为目录
    #[serde(default)]
    pub is_dir: bool,
}

impl FileSource {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            relative_path: None,
            path: None,
            is_dir: false,
        }
    }

    pub fn with_relative_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// 从本地路径读取元数据
    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("读取文件元数据失败: {:?}", path))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        Ok(Self {
            name,
            size: metadata.len(),
            relative_path: None,
            path: Some(path.to_path_buf()),
            is_dir: metadata.is_dir(),
        })
    }

    /// 相对路径，未设置时使用文件名
    pub fn relative_path(&self) -> &str {
        self.relative_path.as_deref().unwrap_or(&self.name)
    }

    /// 是否像目录
    ///
    /// 部分来源无法区分目录和文件，此时名为 "." 且大小为目录块整数倍（含 0）的条目视为目录
    pub fn is_folder_like(&self) -> bool {
        self.is_dir || (self.name == "." && self.size % DIRECTORY_BLOCK_SIZE == 0)
    }

    /// 默认唯一标识：`大小-相对路径`（只保留字母数字、下划线和连字符）
    pub fn default_identifier(&self) -> String {
        let cleaned: String = self
            .relative_path()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        format!("{}-{}", self.size, cleaned)
    }
}

/// 唯一标识生成器
pub type IdentifierGenerator = Box<dyn Fn(&FileSource) -> String + Send>;

/// 文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// 已添加，尚未开始
    Ready,
    /// 初始化钩子执行中
    Initializing,
    /// 分片上传中
    Uploading,
    /// 收尾钩子执行中
    Finalizing,
    /// 已完成
    Success,
    /// 失败
    Error,
}

impl FileStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Success | FileStatus::Error)
    }
}

/// 中止分片时需要释放的外部资源
#[derive(Debug, Default)]
pub(crate) struct Released {
    pub requests: Vec<RequestId>,
    pub timers: Vec<TimerId>,
}

impl Released {
    fn push(&mut self, (request, timer): (Option<RequestId>, Option<TimerId>)) {
        self.requests.extend(request);
        self.timers.extend(timer);
    }
}

/// 上传文件
#[derive(Debug)]
pub struct UploadFile {
    /// 注册表 ID
    id: FileId,
    /// 唯一标识（去重用）
    unique_identifier: String,
    /// 文件描述
    source: FileSource,
    /// 分片大小
    chunk_size: u64,
    /// 分片序列（按偏移升序）
    chunks: Vec<UploadChunk>,
    /// 文件状态
    status: FileStatus,
    /// 是否暂停
    paused: bool,
    /// 是否已永久失败
    error: bool,
    /// 分片瞬时失败的累计重试次数（仅观测用）
    retry_count: u32,
    /// 速度统计
    speed: SpeedTracker,
    /// 进度下限，保证进度不回退
    progress_floor: Cell<f64>,
    /// 进度事件节流
    throttler: ProgressThrottler,
    /// 最后一个分片的响应内容
    last_response: Option<String>,
    /// 创建时间 (Unix timestamp)
    created_at: i64,
}

impl UploadFile {
    /// 创建文件并切分分片
    pub fn new(
        id: FileId,
        unique_identifier: String,
        source: FileSource,
        chunk_size: u64,
        speed_smoothing_factor: f64,
        progress_interval: Duration,
    ) -> UploadResult<Self> {
        let mut file = Self {
            id,
            unique_identifier,
            source,
            chunk_size,
            chunks: Vec::new(),
            status: FileStatus::Ready,
            paused: false,
            error: false,
            retry_count: 0,
            speed: SpeedTracker::new(speed_smoothing_factor),
            progress_floor: Cell::new(0.0),
            throttler: ProgressThrottler::new(progress_interval),
            last_response: None,
            created_at: chrono::Utc::now().timestamp(),
        };
        file.rebuild_chunks()?;
        Ok(file)
    }

    fn rebuild_chunks(&mut self) -> UploadResult<()> {
        let ranges = split_ranges(self.source.size, self.chunk_size)?;
        self.chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| UploadChunk::new(self.id, index, range))
            .collect();
        Ok(())
    }

    // =====================================================
    // 查询
    // =====================================================

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn unique_identifier(&self) -> &str {
        &self.unique_identifier
    }

    pub fn source(&self) -> &FileSource {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn relative_path(&self) -> &str {
        self.source.relative_path()
    }

    pub fn path(&self) -> Option<&Path> {
        self.source.path.as_deref()
    }

    /// 小写扩展名，无扩展名时为空串
    pub fn extension(&self) -> String {
        match self.source.name.rfind('.') {
            Some(pos) if pos > 0 => self.source.name[pos + 1..].to_lowercase(),
            _ => String::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.source.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> Option<&UploadChunk> {
        self.chunks.get(index)
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    pub fn current_speed(&self) -> f64 {
        self.speed.current()
    }

    pub fn average_speed(&self) -> f64 {
        self.speed.average()
    }

    /// 是否正在上传（含初始化和收尾阶段）
    pub fn is_uploading(&self) -> bool {
        matches!(
            self.status,
            FileStatus::Initializing | FileStatus::Uploading | FileStatus::Finalizing
        ) && !self.paused
            && !self.error
    }

    /// 是否已成功完成
    pub fn is_complete(&self) -> bool {
        self.status == FileStatus::Success
    }

    /// 是否没有剩余可做的工作：分片全部成功，或已永久失败
    pub fn is_fully_uploaded(&self) -> bool {
        self.error || self.all_chunks_succeeded()
    }

    pub(crate) fn all_chunks_succeeded(&self) -> bool {
        !self.chunks.is_empty()
            && self
                .chunks
                .iter()
                .all(|c| c.status() == ChunkStatus::Success)
    }

    /// 上传进度 [0, 1]，按分片字节数加权，不回退
    ///
    /// 永久失败的文件返回 1
    pub fn progress(&self) -> f64 {
        if self.error {
            return 1.0;
        }
        if self.chunks.is_empty() {
            return 0.0;
        }

        let raw = if self.source.size == 0 {
            // 空文件只有一个零长度分片，按分片数平均
            self.chunks.iter().map(|c| c.progress()).sum::<f64>() / self.chunks.len() as f64
        } else {
            let uploaded: f64 = self
                .chunks
                .iter()
                .map(|c| c.progress() * c.size() as f64)
                .sum();
            uploaded / self.source.size as f64
        };

        let progress = raw.clamp(0.0, 1.0).max(self.progress_floor.get());
        self.progress_floor.set(progress);
        progress
    }

    /// 已上传字节数
    pub fn size_uploaded(&self) -> u64 {
        if self.error {
            return self.source.size;
        }
        self.chunks.iter().map(|c| c.uploaded_bytes()).sum()
    }

    /// 剩余字节数
    pub fn remaining_bytes(&self) -> u64 {
        self.source.size.saturating_sub(self.size_uploaded())
    }

    /// 剩余时间（秒），暂停返回 0，无速度数据返回正无穷
    pub fn time_remaining(&self) -> f64 {
        time_remaining(self.remaining_bytes(), self.speed.current(), self.paused)
    }

    /// 占用的全局并发槽位数
    pub fn active_slots(&self) -> usize {
        self.chunks.iter().filter(|c| c.holds_slot()).count()
    }

    /// 是否有分片在传输
    pub fn has_uploading_chunk(&self) -> bool {
        self.chunks
            .iter()
            .any(|c| c.status() == ChunkStatus::Uploading)
    }

    /// 是否有等待中的分片重试
    pub fn has_pending_retry(&self) -> bool {
        self.chunks.iter().any(|c| c.is_waiting_retry())
    }

    // =====================================================
    // 状态变更（由 UploadManager 调用）
    // =====================================================

    pub(crate) fn chunk_mut(&mut self, index: usize) -> Option<&mut UploadChunk> {
        self.chunks.get_mut(index)
    }

    pub(crate) fn chunks_mut(&mut self) -> &mut [UploadChunk] {
        &mut self.chunks
    }

    pub(crate) fn set_status(&mut self, status: FileStatus) {
        self.status = status;
    }

    pub(crate) fn set_last_response(&mut self, response: String) {
        self.last_response = Some(response);
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    pub(crate) fn throttler_mut(&mut self) -> &mut ProgressThrottler {
        &mut self.throttler
    }

    /// 暂停：中止所有进行中的分片并回到 pending
    pub(crate) fn pause(&mut self) -> Released {
        self.paused = true;
        let mut released = Released::default();
        for chunk in &mut self.chunks {
            released.push(chunk.abort());
        }
        self.speed.reset();
        released
    }

    pub(crate) fn resume(&mut self) {
        self.paused = false;
    }

    /// 永久失败：中止全部分片并清空分片列表
    pub(crate) fn fail_permanently(&mut self) -> Released {
        let mut released = Released::default();
        for chunk in &mut self.chunks {
            released.push(chunk.abort());
        }
        self.chunks.clear();
        self.mark_error();
        released
    }

    /// 钩子失败：只标记错误，保留分片
    pub(crate) fn mark_error(&mut self) {
        self.status = FileStatus::Error;
        self.error = true;
        self.speed.reset();
    }

    /// 重试前的准备，仅 Error 状态可用
    ///
    /// 分片列表已清空时重新切分，否则保留成功分片、重置其余分片
    pub(crate) fn prepare_retry(&mut self) -> UploadResult<()> {
        if self.status != FileStatus::Error {
            return Err(UploadError::InvalidState {
                file: self.id,
                status: self.status,
                operation: "retry",
            });
        }

        if self.chunks.is_empty() {
            self.rebuild_chunks()?;
        } else {
            for chunk in &mut self.chunks {
                chunk.reset_for_retry();
            }
        }

        self.status = FileStatus::Ready;
        self.error = false;
        self.last_response = None;
        self.progress_floor.set(0.0);
        self.speed.reset();
        self.throttler.reset();
        Ok(())
    }

    /// 移除前释放所有外部资源
    pub(crate) fn release_all(&mut self) -> Released {
        let mut released = Released::default();
        for chunk in &mut self.chunks {
            released.push(chunk.abort());
        }
        released
    }

    /// 进度采样：刷新各活跃分片速度并做一次平滑
    pub(crate) fn sample_speed(&mut self, now: Duration) {
        let current: f64 = self
            .chunks
            .iter_mut()
            .filter(|c| c.status() == ChunkStatus::Uploading)
            .map(|c| c.sample_speed(now))
            .sum();
        self.speed.update(current);
    }

    /// 分片结束后重新汇总当前速度
    pub(crate) fn refresh_current_speed(&mut self) {
        let current: f64 = self
            .chunks
            .iter()
            .filter(|c| c.status() == ChunkStatus::Uploading)
            .map(|c| c.current_speed())
            .sum();
        self.speed.set_current(current);
    }

    /// 没有分片在传输时速度归零
    pub(crate) fn settle_speed(&mut self) {
        if !self.has_uploading_chunk() {
            self.speed.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64, chunk_size: u64) -> UploadFile {
        let source = FileSource::new("a.txt", size);
        let identifier = source.default_identifier();
        UploadFile::new(
            FileId(1),
            identifier,
            source,
            chunk_size,
            0.5,
            Duration::ZERO,
        )
        .unwrap()
    }

    fn complete_chunk(file: &mut UploadFile, index: usize, request: u64) {
        let chunk = file.chunk_mut(index).unwrap();
        chunk.mark_uploading(RequestId(request), Duration::ZERO);
        chunk.mark_success();
    }

    #[test]
    fn test_file_creation() {
        let file = file(10, 4);
        assert_eq!(file.chunks().len(), 3);
        assert_eq!(file.status(), FileStatus::Ready);
        assert_eq!(file.progress(), 0.0);
        assert!(!file.is_uploading());
        assert!(!file.is_complete());
        assert!(!file.is_fully_uploaded());
        assert_eq!(file.time_remaining(), f64::INFINITY);
    }

    #[test]
    fn test_folder_detection() {
        assert!(FileSource::new(".", 0).is_folder_like());
        assert!(FileSource::new(".", 4096).is_folder_like());
        assert!(FileSource::new(".", 8192).is_folder_like());
        assert!(!FileSource::new(".", 100).is_folder_like());
        assert!(!FileSource::new("empty.txt", 0).is_folder_like());
        assert!(!FileSource::new("page.bin", 4096).is_folder_like());

        let mut dir = FileSource::new("photos", 0);
        dir.is_dir = true;
        assert!(dir.is_folder_like());
    }

    #[test]
    fn test_default_identifier() {
        let source = FileSource::new("my file.txt", 12).with_relative_path("dir/my file.txt");
        assert_eq!(source.default_identifier(), "12-dirmyfiletxt");
        assert_eq!(FileSource::new("a.txt", 3).default_identifier(), "3-atxt");
    }

    #[test]
    fn test_extension() {
        let mut f = file(1, 1);
        assert_eq!(f.extension(), "txt");
        f.source.name = "archive.TAR.GZ".to_string();
        assert_eq!(f.extension(), "gz");
        f.source.name = ".hidden".to_string();
        assert_eq!(f.extension(), "");
    }

    #[test]
    fn test_progress_weighted_by_size() {
        let mut f = file(10, 4);
        complete_chunk(&mut f, 0, 1);
        assert!((f.progress() - 0.4).abs() < 1e-9);

        let chunk = f.chunk_mut(2).unwrap();
        chunk.mark_uploading(RequestId(2), Duration::ZERO);
        chunk.record_progress(1, 2);
        assert!((f.progress() - 0.5).abs() < 1e-9);
        assert_eq!(f.size_uploaded(), 5);
    }

    #[test]
    fn test_progress_never_regresses_on_pause() {
        let mut f = file(10, 10);
        let chunk = f.chunk_mut(0).unwrap();
        chunk.mark_uploading(RequestId(1), Duration::ZERO);
        chunk.record_progress(5, 10);
        assert!((f.progress() - 0.5).abs() < 1e-9);

        let released = f.pause();
        assert_eq!(released.requests, vec![RequestId(1)]);
        assert!((f.progress() - 0.5).abs() < 1e-9);
        assert_eq!(f.chunks()[0].status(), ChunkStatus::Pending);
    }

    #[test]
    fn test_empty_file_progress() {
        let mut f = file(0, 4);
        assert_eq!(f.chunks().len(), 1);
        assert_eq!(f.progress(), 0.0);
        complete_chunk(&mut f, 0, 1);
        assert_eq!(f.progress(), 1.0);
        assert!(f.is_fully_uploaded());
    }

    #[test]
    fn test_permanent_failure_reports_done() {
        let mut f = file(10, 4);
        f.set_status(FileStatus::Uploading);
        let chunk = f.chunk_mut(0).unwrap();
        chunk.mark_uploading(RequestId(9), Duration::ZERO);

        let released = f.fail_permanently();
        assert_eq!(released.requests, vec![RequestId(9)]);
        assert!(f.chunks().is_empty());
        assert_eq!(f.status(), FileStatus::Error);
        assert!(f.has_error());
        assert!(f.is_fully_uploaded());
        assert!(!f.is_uploading());
        assert_eq!(f.progress(), 1.0);
        assert_eq!(f.time_remaining(), 0.0);
    }

    #[test]
    fn test_retry_requires_error() {
        let mut f = file(10, 4);
        assert!(matches!(
            f.prepare_retry(),
            Err(UploadError::InvalidState { operation: "retry", .. })
        ));
    }

    #[test]
    fn test_retry_rebuilds_cleared_chunks() {
        let mut f = file(10, 4);
        f.fail_permanently();
        f.prepare_retry().unwrap();
        assert_eq!(f.chunks().len(), 3);
        assert_eq!(f.status(), FileStatus::Ready);
        assert!(!f.has_error());
        assert_eq!(f.progress(), 0.0);
    }

    #[test]
    fn test_retry_keeps_successful_chunks() {
        let mut f = file(10, 4);
        complete_chunk(&mut f, 0, 1);
        f.mark_error();
        f.prepare_retry().unwrap();
        assert_eq!(f.chunks()[0].status(), ChunkStatus::Success);
        assert_eq!(f.chunks()[1].status(), ChunkStatus::Pending);
    }

    #[test]
    fn test_retry_keeps_pause_flag() {
        let mut f = file(10, 4);
        f.pause();
        f.mark_error();
        f.prepare_retry().unwrap();
        assert_eq!(f.status(), FileStatus::Ready);
        assert!(f.is_paused());
        assert!(!f.has_error());
    }

    #[test]
    fn test_speed_sampling_and_settle() {
        let mut f = file(10, 10);
        let chunk = f.chunk_mut(0).unwrap();
        chunk.mark_uploading(RequestId(1), Duration::ZERO);
        chunk.record_progress(50, 100);
        f.sample_speed(Duration::from_secs(1));
        assert_eq!(f.current_speed(), 5.0);
        assert_eq!(f.average_speed(), 2.5);
        assert_eq!(f.time_remaining(), 1.0);

        f.chunk_mut(0).unwrap().mark_success();
        f.refresh_current_speed();
        f.settle_speed();
        assert_eq!(f.current_speed(), 0.0);
        assert_eq!(f.average_speed(), 0.0);
    }
}
