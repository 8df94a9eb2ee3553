//! 上传事件类型定义
//!
//! 所有事件都在触发它的状态变更中同步发布，只有 `Complete` 会延后一个调度周期

use crate::uploader::FileId;
use serde::{Deserialize, Serialize};

/// 事件种类（用于按类型订阅）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    FileAdded,
    FilesAdded,
    FilesSubmitted,
    UploadStart,
    FileInitialized,
    FileProgress,
    Progress,
    FileRetry,
    FileError,
    FileUploadSuccess,
    FileSuccess,
    Complete,
}

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "camelCase")]
pub enum UploadEvent {
    /// 单个文件通过校验并加入注册表
    FileAdded { file: FileId },
    /// 一批文件添加完成
    FilesAdded { files: Vec<FileId> },
    /// 一批文件已提交，可以开始上传
    FilesSubmitted { files: Vec<FileId> },
    /// 调用了 upload()
    UploadStart,
    /// 文件初始化完成，开始调度分片
    FileInitialized { file: FileId },
    /// 文件进度更新
    FileProgress {
        file: FileId,
        chunk: usize,
        progress: f64,
    },
    /// 全局进度更新
    Progress { progress: f64 },
    /// 分片瞬时失败，准备重试
    FileRetry { file: FileId, chunk: usize },
    /// 文件失败
    FileError {
        file: FileId,
        message: String,
        chunk: Option<usize>,
    },
    /// 所有分片上传成功（收尾之前）
    FileUploadSuccess {
        file: FileId,
        message: String,
        chunk: usize,
    },
    /// 文件完成（收尾之后）
    FileSuccess { file: FileId, message: String },
    /// 所有文件都已到达终态
    Complete,
}

impl UploadEvent {
    /// 事件种类
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::FileAdded { .. } => EventKind::FileAdded,
            UploadEvent::FilesAdded { .. } => EventKind::FilesAdded,
            UploadEvent::FilesSubmitted { .. } => EventKind::FilesSubmitted,
            UploadEvent::UploadStart => EventKind::UploadStart,
            UploadEvent::FileInitialized { .. } => EventKind::FileInitialized,
            UploadEvent::FileProgress { .. } => EventKind::FileProgress,
            UploadEvent::Progress { .. } => EventKind::Progress,
            UploadEvent::FileRetry { .. } => EventKind::FileRetry,
            UploadEvent::FileError { .. } => EventKind::FileError,
            UploadEvent::FileUploadSuccess { .. } => EventKind::FileUploadSuccess,
            UploadEvent::FileSuccess { .. } => EventKind::FileSuccess,
            UploadEvent::Complete => EventKind::Complete,
        }
    }

    /// 关联的文件 ID
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            UploadEvent::FileAdded { file }
            | UploadEvent::FileInitialized { file }
            | UploadEvent::FileProgress { file, .. }
            | UploadEvent::FileRetry { file, .. }
            | UploadEvent::FileError { file, .. }
            | UploadEvent::FileUploadSuccess { file, .. }
            | UploadEvent::FileSuccess { file, .. } => Some(*file),
            _ => None,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self.kind() {
            EventKind::FileAdded => "fileAdded",
            EventKind::FilesAdded => "filesAdded",
            EventKind::FilesSubmitted => "filesSubmitted",
            EventKind::UploadStart => "uploadStart",
            EventKind::FileInitialized => "fileInitialized",
            EventKind::FileProgress => "fileProgress",
            EventKind::Progress => "progress",
            EventKind::FileRetry => "fileRetry",
            EventKind::FileError => "fileError",
            EventKind::FileUploadSuccess => "fileUploadSuccess",
            EventKind::FileSuccess => "fileSuccess",
            EventKind::Complete => "complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = UploadEvent::FileRetry {
            file: FileId(1),
            chunk: 0,
        };
        assert_eq!(event.event_type_name(), "fileRetry");
        assert_eq!(event.kind(), EventKind::FileRetry);
        assert_eq!(event.file_id(), Some(FileId(1)));
        assert_eq!(UploadEvent::Complete.file_id(), None);
    }

    #[test]
    fn test_serialize_tag() {
        let event = UploadEvent::FileError {
            file: FileId(3),
            message: "Err".to_string(),
            chunk: Some(1),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "fileError");
        assert_eq!(json["file"], 3);
        assert_eq!(json["message"], "Err");
    }
}
