// 上传分片管理
//
// 分片规则：
// - 按固定大小切分，最后一个分片可能更小
// - 空文件固定产生一个长度为 0 的分片（上传空请求体）
// - 分片按起始偏移升序排列，覆盖 [0, size)，无空洞、无重叠

use crate::error::{UploadError, UploadResult};
use crate::uploader::speed::ChunkSpeed;
use crate::uploader::timer::TimerId;
use crate::uploader::transport::RequestId;
use crate::uploader::FileId;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 默认分片大小: 1MB
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// 计算分片范围
///
/// 返回 `ceil(size / chunk_size)` 个连续范围；`size == 0` 时返回一个空范围。
///
/// # 错误
/// `chunk_size == 0` 时返回 [`UploadError::InvalidChunkSize`]
pub fn split_ranges(total_size: u64, chunk_size: u64) -> UploadResult<Vec<Range<u64>>> {
    if chunk_size == 0 {
        return Err(UploadError::InvalidChunkSize(chunk_size));
    }

    if total_size == 0 {
        return Ok(vec![0..0]);
    }

    let mut ranges = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;

    while offset < total_size {
        let end = std::cmp::min(offset.saturating_add(chunk_size), total_size);
        ranges.push(offset..end);
        offset = end;
    }

    Ok(ranges)
}

/// 分片状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 等待调度
    Pending,
    /// 正在上传（含探测请求）
    Uploading,
    /// 上传成功
    Success,
    /// 永久失败
    Error,
}

/// 预处理状态（仅在配置了预处理钩子时有意义）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessState {
    /// 尚未预处理
    Unprocessed,
    /// 预处理中，等待外部确认（占用并发槽位）
    Processing,
    /// 预处理完成
    Finished,
}

/// 上传分片
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 所属文件（只读引用，用于状态查询）
    pub file: FileId,
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 分片状态
    status: ChunkStatus,
    /// 预处理状态
    preprocess_state: PreprocessState,
    /// 当前请求已发送字节数（传输层上报）
    loaded: u64,
    /// 当前请求总字节数（传输层上报）
    total: u64,
    /// 瞬时失败重试次数
    retries: u32,
    /// 进行中的请求
    request: Option<RequestId>,
    /// 等待中的重试定时器
    retry_timer: Option<TimerId>,
    /// 是否已做过探测请求
    tested: bool,
    /// 速度采样
    speed: ChunkSpeed,
}

impl UploadChunk {
    pub fn new(file: FileId, index: usize, range: Range<u64>) -> Self {
        Self {
            file,
            index,
            range,
            status: ChunkStatus::Pending,
            preprocess_state: PreprocessState::Unprocessed,
            loaded: 0,
            total: 0,
            retries: 0,
            request: None,
            retry_timer: None,
            tested: false,
            speed: ChunkSpeed::default(),
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn preprocess_state(&self) -> PreprocessState {
        self.preprocess_state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn loaded(&self) -> u64 {
        self.loaded
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn is_tested(&self) -> bool {
        self.tested
    }

    /// 是否在等待重试定时器
    pub fn is_waiting_retry(&self) -> bool {
        self.retry_timer.is_some()
    }

    /// 当前速度 (bytes/s)
    pub fn current_speed(&self) -> f64 {
        self.speed.current()
    }

    /// 是否可被调度器选中
    pub fn is_startable(&self) -> bool {
        self.status == ChunkStatus::Pending
            && self.retry_timer.is_none()
            && self.preprocess_state != PreprocessState::Processing
    }

    /// 是否占用全局并发槽位
    pub fn holds_slot(&self) -> bool {
        self.status == ChunkStatus::Uploading
            || (self.status == ChunkStatus::Pending
                && self.preprocess_state == PreprocessState::Processing)
    }

    /// 分片进度 [0, 1]
    pub fn progress(&self) -> f64 {
        match self.status {
            ChunkStatus::Success | ChunkStatus::Error => 1.0,
            ChunkStatus::Pending => 0.0,
            ChunkStatus::Uploading => {
                if self.total == 0 {
                    0.0
                } else {
                    (self.loaded as f64 / self.total as f64).min(1.0)
                }
            }
        }
    }

    /// 已上传字节数（按 loaded/total 比例折算到分片大小）
    pub fn uploaded_bytes(&self) -> u64 {
        match self.status {
            ChunkStatus::Success | ChunkStatus::Error => self.size(),
            ChunkStatus::Pending => 0,
            ChunkStatus::Uploading => {
                if self.total == 0 {
                    0
                } else {
                    let loaded = self.loaded.min(self.total) as u128;
                    (loaded * self.size() as u128 / self.total as u128) as u64
                }
            }
        }
    }

    /// 进入预处理
    pub(crate) fn begin_preprocess(&mut self) {
        self.preprocess_state = PreprocessState::Processing;
    }

    /// 预处理确认
    ///
    /// 返回 false 表示分片并不在预处理中（过期的确认）
    pub(crate) fn finish_preprocess(&mut self) -> bool {
        if self.preprocess_state != PreprocessState::Processing {
            return false;
        }
        self.preprocess_state = PreprocessState::Finished;
        true
    }

    /// 标记开始发送请求，loaded 归零
    pub(crate) fn mark_uploading(&mut self, request: RequestId, now: Duration) {
        self.status = ChunkStatus::Uploading;
        self.request = Some(request);
        self.loaded = 0;
        self.total = 0;
        self.speed.start(now);
    }

    pub(crate) fn mark_tested(&mut self) {
        self.tested = true;
    }

    /// 记录传输层进度
    pub(crate) fn record_progress(&mut self, loaded: u64, total: u64) {
        self.loaded = loaded;
        self.total = total;
    }

    /// 按当前已上传字节采样速度
    pub(crate) fn sample_speed(&mut self, now: Duration) -> f64 {
        let bytes = self.uploaded_bytes();
        self.speed.sample(now, bytes)
    }

    /// 标记成功，释放请求句柄
    pub(crate) fn mark_success(&mut self) -> Option<RequestId> {
        self.status = ChunkStatus::Success;
        self.loaded = self.total;
        self.speed.stop();
        self.request.take()
    }

    /// 瞬时失败：回到 pending，重试次数 +1
    pub(crate) fn mark_retry(&mut self) {
        self.status = ChunkStatus::Pending;
        self.retries += 1;
        self.loaded = 0;
        self.request = None;
        self.speed.stop();
    }

    /// 永久失败
    pub(crate) fn mark_error(&mut self) -> Option<RequestId> {
        self.status = ChunkStatus::Error;
        self.speed.stop();
        self.request.take()
    }

    /// 中止进行中的请求，回到 pending（从 0 字节重新开始）
    ///
    /// 返回需要中止的请求句柄和需要取消的重试定时器
    pub(crate) fn abort(&mut self) -> (Option<RequestId>, Option<TimerId>) {
        if self.status == ChunkStatus::Uploading {
            self.status = ChunkStatus::Pending;
        }
        self.loaded = 0;
        self.total = 0;
        self.speed.stop();
        (self.request.take(), self.retry_timer.take())
    }

    pub(crate) fn set_retry_timer(&mut self, timer: TimerId) {
        self.retry_timer = Some(timer);
    }

    /// 重试定时器到期
    pub(crate) fn clear_retry_timer(&mut self, timer: TimerId) -> bool {
        if self.retry_timer == Some(timer) {
            self.retry_timer = None;
            true
        } else {
            false
        }
    }

    /// 文件重试时重置未成功分片
    pub(crate) fn reset_for_retry(&mut self) {
        if self.status != ChunkStatus::Success {
            self.status = ChunkStatus::Pending;
            self.retries = 0;
            self.loaded = 0;
            self.total = 0;
            self.request = None;
            self.retry_timer = None;
            self.speed.stop();
        }
    }

    /// 读取分片数据
    ///
    /// # 参数
    /// * `file_path` - 本地文件路径
    ///
    /// # 返回
    /// 分片数据字节数组
    pub async fn read_data(&self, file_path: &Path) -> UploadResult<Vec<u8>> {
        read_range(file_path, self.range.clone()).await
    }
}

/// 读取文件指定范围的数据
///
/// 打开、定位、读取失败都以 [`UploadError::Io`] 返回
pub async fn read_range(file_path: &Path, range: Range<u64>) -> UploadResult<Vec<u8>> {
    let mut file = File::open(file_path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;

    let chunk_size = (range.end - range.start) as usize;
    let mut buffer = vec![0u8; chunk_size];
    file.read_exact(&mut buffer).await?;

    debug!(
        "读取分片: {:?} bytes={}..{}, 大小={} bytes",
        file_path, range.start, range.end, chunk_size
    );

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn chunk(range: Range<u64>) -> UploadChunk {
        UploadChunk::new(FileId(1), 0, range)
    }

    #[test]
    fn test_split_exact_multiple() {
        let ranges = split_ranges(16, 4).unwrap();
        assert_eq!(ranges, vec![0..4, 4..8, 8..12, 12..16]);
    }

    #[test]
    fn test_split_with_remainder() {
        let ranges = split_ranges(17, 4).unwrap();
        assert_eq!(ranges.len(), 5);
        assert_eq!(ranges[4], 16..17);
    }

    #[test]
    fn test_split_empty_file() {
        assert_eq!(split_ranges(0, 4).unwrap(), vec![0..0]);
    }

    #[test]
    fn test_split_smaller_than_chunk() {
        assert_eq!(split_ranges(3, 1024).unwrap(), vec![0..3]);
    }

    #[test]
    fn test_split_rejects_zero_chunk_size() {
        assert!(matches!(
            split_ranges(10, 0),
            Err(UploadError::InvalidChunkSize(0))
        ));
    }

    proptest! {
        #[test]
        fn prop_split_is_contiguous(size in 0u64..100_000, chunk_size in 1u64..5_000) {
            let ranges = split_ranges(size, chunk_size).unwrap();

            let expected = if size == 0 { 1 } else { size.div_ceil(chunk_size) as usize };
            prop_assert_eq!(ranges.len(), expected);
            prop_assert_eq!(ranges[0].start, 0);
            prop_assert_eq!(ranges.last().unwrap().end, size);

            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            for range in &ranges {
                prop_assert!(range.end - range.start <= chunk_size);
            }
            let total: u64 = ranges.iter().map(|r| r.end - r.start).sum();
            prop_assert_eq!(total, size);
        }
    }

    #[test]
    fn test_chunk_creation() {
        let chunk = chunk(0..1024);
        assert_eq!(chunk.size(), 1024);
        assert_eq!(chunk.status(), ChunkStatus::Pending);
        assert_eq!(chunk.preprocess_state(), PreprocessState::Unprocessed);
        assert!(chunk.is_startable());
        assert!(!chunk.holds_slot());
    }

    #[test]
    fn test_progress_scaled_to_chunk_size() {
        let mut chunk = chunk(0..10);
        chunk.mark_uploading(RequestId(1), Duration::ZERO);
        chunk.record_progress(50, 100);
        assert_eq!(chunk.uploaded_bytes(), 5);
        assert!((chunk.progress() - 0.5).abs() < f64::EPSILON);

        chunk.mark_success();
        assert_eq!(chunk.uploaded_bytes(), 10);
        assert_eq!(chunk.progress(), 1.0);
    }

    #[test]
    fn test_abort_returns_handle_and_resets() {
        let mut chunk = chunk(0..10);
        chunk.mark_uploading(RequestId(7), Duration::ZERO);
        chunk.record_progress(5, 10);

        let (request, timer) = chunk.abort();
        assert_eq!(request, Some(RequestId(7)));
        assert_eq!(timer, None);
        assert_eq!(chunk.status(), ChunkStatus::Pending);
        assert_eq!(chunk.loaded(), 0);
        assert!(chunk.is_startable());
    }

    #[test]
    fn test_preprocess_gate_holds_slot() {
        let mut chunk = chunk(0..10);
        chunk.begin_preprocess();
        assert!(chunk.holds_slot());
        assert!(!chunk.is_startable());

        assert!(chunk.finish_preprocess());
        assert!(!chunk.holds_slot());
        assert!(chunk.is_startable());
        // 重复确认无效
        assert!(!chunk.finish_preprocess());
    }

    #[test]
    fn test_retry_timer_blocks_selection() {
        let mut chunk = chunk(0..10);
        chunk.mark_uploading(RequestId(1), Duration::ZERO);
        chunk.mark_retry();
        chunk.set_retry_timer(TimerId(3));
        assert_eq!(chunk.retries(), 1);
        assert!(!chunk.is_startable());
        assert!(!chunk.holds_slot());

        assert!(!chunk.clear_retry_timer(TimerId(4)));
        assert!(chunk.clear_retry_timer(TimerId(3)));
        assert!(chunk.is_startable());
    }

    #[test]
    fn test_reset_for_retry_keeps_success() {
        let mut done = chunk(0..10);
        done.mark_uploading(RequestId(1), Duration::ZERO);
        done.mark_success();
        done.reset_for_retry();
        assert_eq!(done.status(), ChunkStatus::Success);

        let mut failed = chunk(0..10);
        failed.mark_uploading(RequestId(2), Duration::ZERO);
        failed.mark_retry();
        failed.reset_for_retry();
        assert_eq!(failed.status(), ChunkStatus::Pending);
        assert_eq!(failed.retries(), 0);
    }

    #[tokio::test]
    async fn test_read_data() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let chunk = UploadChunk::new(FileId(1), 1, 4..8);
        let data = chunk.read_data(file.path()).await.unwrap();
        assert_eq!(data, b"4567");
    }

    #[tokio::test]
    async fn test_read_past_end_is_io_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123").unwrap();

        let result = read_range(file.path(), 2..8).await;
        assert!(matches!(result, Err(UploadError::Io(_))));
    }
}
