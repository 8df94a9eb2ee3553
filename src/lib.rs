// Chunked Upload Library
// 分片断点续传上传引擎核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 事件模块
pub mod events;

// 日志模块
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AppConfig, HttpConfig, LogConfig, UploadConfig};
pub use error::{UploadError, UploadResult};
pub use events::{EventBus, EventKind, UploadEvent};
pub use uploader::{
    FileId, FileSource, FileStatus, HookOutcome, HttpTransport, UploadDriver, UploadFile,
    UploadHooks, UploadManager,
};
