// 生命周期钩子
//
// initialize / finalize / preprocess 都是"发起 + 外部确认"的两段式：
// 钩子被调用时只负责启动工作，完成后由外部调用
// `UploadManager::initialize_finished` / `finalize_finished` / `preprocess_finished`

use crate::uploader::{UploadChunk, UploadFile};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 钩子执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookOutcome {
    Ok,
    Failed(String),
}

impl HookOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        HookOutcome::Failed(reason.into())
    }
}

/// 文件级钩子（初始化 / 收尾）
pub type LifecycleHook = Box<dyn FnMut(&UploadFile) + Send>;

/// 分片预处理钩子
pub type PreprocessHook = Box<dyn FnMut(&UploadChunk) + Send>;

/// 钩子集合，未配置的阶段直接放行
#[derive(Default)]
pub struct UploadHooks {
    pub initialize: Option<LifecycleHook>,
    pub finalize: Option<LifecycleHook>,
    pub preprocess: Option<PreprocessHook>,
}

impl UploadHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initialize<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&UploadFile) + Send + 'static,
    {
        self.initialize = Some(Box::new(hook));
        self
    }

    pub fn with_finalize<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&UploadFile) + Send + 'static,
    {
        self.finalize = Some(Box::new(hook));
        self
    }

    pub fn with_preprocess<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&UploadChunk) + Send + 'static,
    {
        self.preprocess = Some(Box::new(hook));
        self
    }

    pub fn has_initialize(&self) -> bool {
        self.initialize.is_some()
    }

    pub fn has_finalize(&self) -> bool {
        self.finalize.is_some()
    }

    pub fn has_preprocess(&self) -> bool {
        self.preprocess.is_some()
    }
}

impl fmt::Debug for UploadHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadHooks")
            .field("initialize", &self.has_initialize())
            .field("finalize", &self.has_finalize())
            .field("preprocess", &self.has_preprocess())
            .finish()
    }
}
