// 上传引擎模块
//
// 分片断点续传上传引擎：
// - 固定大小切分分片（空文件产生一个空分片）
// - 全局并发槽位控制，按文件注册顺序 + 分片索引顺序填充
// - 瞬时失败按分片重试（可配置退避间隔），永久错误直接终止文件
// - 暂停 / 恢复 / 重试，初始化 / 收尾 / 预处理钩子
// - 指数滑动平均速度统计

pub mod chunk;
pub mod driver;
pub mod hooks;
pub mod http;
pub mod manager;
pub mod scheduler;
pub mod speed;
pub mod task;
pub mod timer;
pub mod transport;

pub use chunk::{split_ranges, ChunkStatus, PreprocessState, UploadChunk, DEFAULT_CHUNK_SIZE};
pub use driver::{
    ChunkContext, DriverHandle, DriverMessage, FileContext, UploadDriver, UploadLifecycle,
};
pub use hooks::{HookOutcome, UploadHooks};
pub use http::HttpTransport;
pub use manager::UploadManager;
pub use scheduler::{Dispatch, UploadChunkScheduler, DEFAULT_SIMULTANEOUS_UPLOADS};
pub use speed::{SpeedTracker, DEFAULT_SPEED_SMOOTHING_FACTOR};
pub use task::{FileId, FileSource, FileStatus, IdentifierGenerator, UploadFile};
pub use timer::{Clock, ManualClock, MonotonicClock, TimerId};
pub use transport::{
    ChunkRequest, Query, RequestId, RequestKind, Resolvable, Target, Transport, TransportEvent,
};
