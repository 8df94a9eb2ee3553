// 传输层接口
//
// 上传管理器只负责"何时发哪个分片"，真正的网络请求由外部传输实现：
// - `start` 发起请求（探测或上传），之后异步上报 0..n 次进度和恰好一次终态
// - `abort` 任何时候调用都安全，调用后管理器会忽略该请求的后续通知
//
// 终态通知通过 `UploadManager::on_chunk_*` 系列方法回送

use crate::uploader::{UploadChunk, UploadFile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// 请求句柄，由管理器分配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// 探测服务端是否已有该分片
    Test,
    /// 上传分片数据
    Upload,
}

/// 分片请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    /// 请求句柄
    pub id: RequestId,
    /// 请求类型
    pub kind: RequestKind,
    /// 所属文件
    pub file: crate::uploader::FileId,
    /// 分片索引
    pub chunk_index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 本地文件路径（无路径时传输层自行决定请求体）
    pub path: Option<PathBuf>,
    /// 完整请求地址（已拼接查询参数）
    pub url: String,
    /// 请求参数（自定义参数在前，分片标准参数在后）
    pub params: Vec<(String, String)>,
}

/// 传输层回送的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 字节进度
    Progress {
        request: RequestId,
        loaded: u64,
        total: u64,
    },
    /// 请求成功
    Success { request: RequestId, body: String },
    /// 请求失败（网络错误时 status 为 0）
    Failure {
        request: RequestId,
        status: u16,
        body: String,
    },
}

/// 分片传输
pub trait Transport: Send {
    /// 发起请求
    fn start(&mut self, request: ChunkRequest);

    /// 中止请求（尽力而为）
    fn abort(&mut self, id: RequestId);
}

/// 静态值或按 (文件, 分片) 计算的值，在发起请求时解析
pub enum Resolvable<T> {
    Static(T),
    Computed(Arc<dyn Fn(&UploadFile, &UploadChunk) -> T + Send + Sync>),
}

impl<T: Clone> Resolvable<T> {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&UploadFile, &UploadChunk) -> T + Send + Sync + 'static,
    {
        Resolvable::Computed(Arc::new(f))
    }

    pub fn resolve(&self, file: &UploadFile, chunk: &UploadChunk) -> T {
        match self {
            Resolvable::Static(value) => value.clone(),
            Resolvable::Computed(f) => f(file, chunk),
        }
    }
}

impl<T: Clone> Clone for Resolvable<T> {
    fn clone(&self) -> Self {
        match self {
            Resolvable::Static(value) => Resolvable::Static(value.clone()),
            Resolvable::Computed(f) => Resolvable::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Resolvable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolvable::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Resolvable::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// 上传目标地址
pub type Target = Resolvable<String>;

/// 自定义查询参数
pub type Query = Resolvable<Vec<(String, String)>>;

/// 分片标准参数
pub fn chunk_params(
    file: &UploadFile,
    chunk: &UploadChunk,
    chunk_size: u64,
) -> Vec<(String, String)> {
    vec![
        ("chunkNumber".to_string(), (chunk.index + 1).to_string()),
        ("chunkSize".to_string(), chunk_size.to_string()),
        ("currentChunkSize".to_string(), chunk.size().to_string()),
        ("totalSize".to_string(), file.size().to_string()),
        ("identifier".to_string(), file.unique_identifier().to_string()),
        ("filename".to_string(), file.name().to_string()),
        ("relativePath".to_string(), file.relative_path().to_string()),
        ("totalChunks".to_string(), file.chunks().len().to_string()),
    ]
}

/// 拼接请求地址
///
/// 目标地址已带 `?` 时以 `&` 连接
pub fn build_url(target: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return target.to_string();
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{}{}{}", target, separator, query)
}
