//! 上传引擎错误类型
//!
//! 校验类错误（文件夹、重复文件）在添加阶段被静默过滤，不会出现在这里；
//! 分片级别的失败只通过事件和文件状态对外暴露，也不会以错误返回。

use crate::uploader::{FileId, FileStatus};

/// 上传引擎错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 分片大小必须大于 0
    #[error("分片大小无效: {0}")]
    InvalidChunkSize(u64),

    /// 配置项不合法
    #[error("上传配置无效: {0}")]
    InvalidConfig(String),

    /// 注册表中找不到该文件
    #[error("文件不存在: {0}")]
    FileNotFound(FileId),

    /// 当前状态不允许执行该操作
    #[error("文件 {file} 当前状态为 {status:?}，无法执行 {operation}")]
    InvalidState {
        file: FileId,
        status: FileStatus,
        operation: &'static str,
    },

    /// 读取分片数据失败
    #[error("读取分片数据失败: {0}")]
    Io(#[from] std::io::Error),
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
