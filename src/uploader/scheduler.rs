// 上传分片调度器
//
// 功能：
// - 持有活跃文件注册表（按注册顺序）
// - 全局并发控制（上传中 + 预处理中的分片数不超过 simultaneous_uploads）
// - 固定填充策略：先按文件注册顺序、再按分片索引顺序选取可启动分片
//
// 调度器只做选择和状态占位，返回的 Dispatch 列表由 UploadManager 按顺序执行
// （调用钩子、发起请求、发布事件）

use crate::uploader::chunk::PreprocessState;
use crate::uploader::{FileId, FileStatus, UploadFile};
use tracing::debug;

/// 默认同时上传分片数
pub const DEFAULT_SIMULTANEOUS_UPLOADS: usize = 3;

/// 调度动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// 文件首次被选中，进入初始化（无初始化钩子时已直接置为 Uploading）
    Initialize(FileId),
    /// 分片进入预处理，占用槽位等待外部确认
    Preprocess { file: FileId, chunk: usize },
    /// 发起分片请求
    Send { file: FileId, chunk: usize },
}

/// 调度策略（由钩子配置决定）
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulePolicy {
    pub has_initialize: bool,
    pub has_preprocess: bool,
}

/// 全局上传分片调度器
#[derive(Debug)]
pub struct UploadChunkScheduler {
    /// 活跃文件（注册顺序）
    files: Vec<UploadFile>,
    /// 最大同时上传分片数
    max_simultaneous: usize,
    /// 下一个文件 ID
    next_file_id: u64,
}

impl UploadChunkScheduler {
    pub fn new(max_simultaneous: usize) -> Self {
        debug!("创建上传分片调度器: 同时上传分片数={}", max_simultaneous);
        Self {
            files: Vec::new(),
            max_simultaneous: max_simultaneous.max(1),
            next_file_id: 1,
        }
    }

    pub fn max_simultaneous(&self) -> usize {
        self.max_simultaneous
    }

    /// 动态调整同时上传分片数
    ///
    /// 调小时不会中止已在传输的分片，只是在它们结束前不再启动新分片
    pub fn set_max_simultaneous(&mut self, max: usize) {
        let old = self.max_simultaneous;
        self.max_simultaneous = max.max(1);
        debug!("调整同时上传分片数: {} -> {}", old, self.max_simultaneous);
    }

    /// 分配新的文件 ID
    pub(crate) fn allocate_id(&mut self) -> FileId {
        let id = FileId(self.next_file_id);
        self.next_file_id += 1;
        id
    }

    /// 注册文件（追加到末尾）
    pub(crate) fn register(&mut self, file: UploadFile) {
        self.files.push(file);
    }

    /// 从注册表移除文件
    pub(crate) fn remove(&mut self, id: FileId) -> Option<UploadFile> {
        let pos = self.files.iter().position(|f| f.id() == id)?;
        Some(self.files.remove(pos))
    }

    pub fn files(&self) -> &[UploadFile] {
        &self.files
    }

    pub(crate) fn files_mut(&mut self) -> &mut [UploadFile] {
        &mut self.files
    }

    pub fn get(&self, id: FileId) -> Option<&UploadFile> {
        self.files.iter().find(|f| f.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: FileId) -> Option<&mut UploadFile> {
        self.files.iter_mut().find(|f| f.id() == id)
    }

    /// 按唯一标识查找
    pub fn find_by_identifier(&self, identifier: &str) -> Option<&UploadFile> {
        self.files
            .iter()
            .find(|f| f.unique_identifier() == identifier)
    }

    /// 当前占用的槽位数
    pub fn active_slots(&self) -> usize {
        self.files.iter().map(|f| f.active_slots()).sum()
    }

    /// 剩余槽位数
    pub fn available_slots(&self) -> usize {
        self.max_simultaneous.saturating_sub(self.active_slots())
    }

    /// 所有文件是否都已到达终态
    pub fn all_terminal(&self) -> bool {
        self.files.iter().all(|f| f.status().is_terminal())
    }

    /// 调度一轮
    ///
    /// 没有空闲槽位时返回空列表（重复调用不会重复启动）
    pub(crate) fn schedule(&mut self, policy: SchedulePolicy) -> Vec<Dispatch> {
        let mut available = self.available_slots();
        let mut plan = Vec::new();

        if available == 0 {
            debug!(
                "无空闲槽位，跳过调度 ({}/{})",
                self.active_slots(),
                self.max_simultaneous
            );
            return plan;
        }

        for file in &mut self.files {
            if available == 0 {
                break;
            }
            if file.is_paused() {
                continue;
            }

            match file.status() {
                FileStatus::Ready => {
                    plan.push(Dispatch::Initialize(file.id()));
                    if policy.has_initialize {
                        // 等待初始化钩子确认，不占用槽位
                        file.set_status(FileStatus::Initializing);
                        continue;
                    }
                    file.set_status(FileStatus::Uploading);
                }
                FileStatus::Uploading => {}
                _ => continue,
            }

            let file_id = file.id();
            for chunk in file.chunks_mut() {
                if available == 0 {
                    break;
                }
                if !chunk.is_startable() {
                    continue;
                }

                if policy.has_preprocess && chunk.preprocess_state() == PreprocessState::Unprocessed
                {
                    chunk.begin_preprocess();
                    plan.push(Dispatch::Preprocess {
                        file: file_id,
                        chunk: chunk.index,
                    });
                } else {
                    plan.push(Dispatch::Send {
                        file: file_id,
                        chunk: chunk.index,
                    });
                }
                available -= 1;
            }
        }

        if !plan.is_empty() {
            debug!(
                "调度结果: {:?} (活跃槽位: {}/{})",
                plan,
                self.active_slots(),
                self.max_simultaneous
            );
        }

        plan
    }
}

impl Default for UploadChunkScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULTANEOUS_UPLOADS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::transport::RequestId;
    use crate::uploader::FileSource;
    use std::time::Duration;

    fn add_file(scheduler: &mut UploadChunkScheduler, size: u64) -> FileId {
        let id = scheduler.allocate_id();
        let source = FileSource::new(format!("{}.bin", id.0), size);
        let identifier = source.default_identifier();
        let file =
            UploadFile::new(id, identifier, source, 1, 0.1, Duration::ZERO).unwrap();
        scheduler.register(file);
        id
    }

    /// 模拟管理器执行 Send：标记分片为上传中
    fn apply(scheduler: &mut UploadChunkScheduler, plan: &[Dispatch]) {
        for (n, dispatch) in plan.iter().enumerate() {
            if let Dispatch::Send { file, chunk } = *dispatch {
                scheduler
                    .get_mut(file)
                    .unwrap()
                    .chunk_mut(chunk)
                    .unwrap()
                    .mark_uploading(RequestId(n as u64), Duration::ZERO);
            }
        }
    }

    #[test]
    fn test_fill_in_registration_then_index_order() {
        let mut scheduler = UploadChunkScheduler::new(3);
        let a = add_file(&mut scheduler, 2);
        let b = add_file(&mut scheduler, 2);

        let plan = scheduler.schedule(SchedulePolicy::default());
        assert_eq!(
            plan,
            vec![
                Dispatch::Initialize(a),
                Dispatch::Send { file: a, chunk: 0 },
                Dispatch::Send { file: a, chunk: 1 },
                Dispatch::Initialize(b),
                Dispatch::Send { file: b, chunk: 0 },
            ]
        );
        assert_eq!(scheduler.get(a).unwrap().status(), FileStatus::Uploading);
    }

    #[test]
    fn test_schedule_without_free_slots_is_noop() {
        let mut scheduler = UploadChunkScheduler::new(2);
        add_file(&mut scheduler, 4);

        let plan = scheduler.schedule(SchedulePolicy::default());
        apply(&mut scheduler, &plan);
        assert_eq!(scheduler.active_slots(), 2);

        assert!(scheduler.schedule(SchedulePolicy::default()).is_empty());
        assert!(scheduler.schedule(SchedulePolicy::default()).is_empty());
        assert_eq!(scheduler.active_slots(), 2);
    }

    #[test]
    fn test_paused_file_skipped() {
        let mut scheduler = UploadChunkScheduler::new(2);
        let a = add_file(&mut scheduler, 4);
        let b = add_file(&mut scheduler, 2);
        scheduler.get_mut(a).unwrap().pause();

        let plan = scheduler.schedule(SchedulePolicy::default());
        assert_eq!(
            plan,
            vec![
                Dispatch::Initialize(b),
                Dispatch::Send { file: b, chunk: 0 },
                Dispatch::Send { file: b, chunk: 1 },
            ]
        );
        assert_eq!(scheduler.get(a).unwrap().status(), FileStatus::Ready);
    }

    #[test]
    fn test_initialize_hook_blocks_file_not_slots() {
        let mut scheduler = UploadChunkScheduler::new(1);
        let a = add_file(&mut scheduler, 3);
        let b = add_file(&mut scheduler, 3);
        let policy = SchedulePolicy {
            has_initialize: true,
            has_preprocess: false,
        };

        let plan = scheduler.schedule(policy);
        assert_eq!(plan, vec![Dispatch::Initialize(a), Dispatch::Initialize(b)]);
        assert_eq!(scheduler.get(a).unwrap().status(), FileStatus::Initializing);

        // 初始化中的文件不再重复选中
        assert!(scheduler.schedule(policy).is_empty());
    }

    #[test]
    fn test_preprocess_occupies_slot() {
        let mut scheduler = UploadChunkScheduler::new(1);
        let a = add_file(&mut scheduler, 3);
        add_file(&mut scheduler, 4);
        let policy = SchedulePolicy {
            has_initialize: false,
            has_preprocess: true,
        };

        let plan = scheduler.schedule(policy);
        assert_eq!(
            plan,
            vec![
                Dispatch::Initialize(a),
                Dispatch::Preprocess { file: a, chunk: 0 }
            ]
        );
        assert_eq!(scheduler.active_slots(), 1);
        assert!(scheduler.schedule(policy).is_empty());
    }

    #[test]
    fn test_remove_and_lookup() {
        let mut scheduler = UploadChunkScheduler::default();
        let a = add_file(&mut scheduler, 3);
        let identifier = scheduler.get(a).unwrap().unique_identifier().to_string();
        assert!(scheduler.find_by_identifier(&identifier).is_some());

        assert!(scheduler.remove(a).is_some());
        assert!(scheduler.remove(a).is_none());
        assert!(scheduler.files().is_empty());
        assert!(scheduler.all_terminal());
    }
}
