// 配置管理模块

use crate::error::{UploadError, UploadResult};
use crate::events::DEFAULT_THROTTLE_INTERVAL_MS;
use crate::uploader::{
    DEFAULT_CHUNK_SIZE, DEFAULT_SIMULTANEOUS_UPLOADS, DEFAULT_SPEED_SMOOTHING_FACTOR,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// HTTP 传输配置
    #[serde(default)]
    pub http: HttpConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传目标地址
    #[serde(default = "default_target")]
    pub target: String,
    /// 附加到每个请求的查询参数
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 全局同时上传分片数（上传中 + 预处理中）
    #[serde(default = "default_simultaneous_uploads")]
    pub simultaneous_uploads: usize,
    /// 上传前是否先探测服务端已有分片
    #[serde(default)]
    pub test_chunks: bool,
    /// 分片瞬时失败的最大重试次数
    #[serde(default)]
    pub max_chunk_retries: u32,
    /// 分片重试间隔（毫秒），0 表示立即重试
    #[serde(default)]
    pub chunk_retry_interval_ms: u64,
    /// 不重试、直接判定文件失败的状态码
    #[serde(default = "default_permanent_errors")]
    pub permanent_errors: Vec<u16>,
    /// 视为成功的状态码
    #[serde(default = "default_success_statuses")]
    pub success_statuses: Vec<u16>,
    /// 速度平滑系数 α，范围 [0, 1]
    #[serde(default = "default_speed_smoothing_factor")]
    pub speed_smoothing_factor: f64,
    /// 进度事件最小间隔（毫秒）
    #[serde(default = "default_progress_callbacks_interval_ms")]
    pub progress_callbacks_interval_ms: u64,
    /// 是否允许重复添加相同标识的文件
    #[serde(default)]
    pub allow_duplicate_uploads: bool,
}

fn default_target() -> String {
    "/".to_string()
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_simultaneous_uploads() -> usize {
    DEFAULT_SIMULTANEOUS_UPLOADS
}

fn default_permanent_errors() -> Vec<u16> {
    vec![404, 413, 415, 500, 501]
}

fn default_success_statuses() -> Vec<u16> {
    vec![200, 201, 202]
}

fn default_speed_smoothing_factor() -> f64 {
    DEFAULT_SPEED_SMOOTHING_FACTOR
}

fn default_progress_callbacks_interval_ms() -> u64 {
    DEFAULT_THROTTLE_INTERVAL_MS
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            query: BTreeMap::new(),
            chunk_size: default_chunk_size(),
            simultaneous_uploads: default_simultaneous_uploads(),
            test_chunks: false,
            max_chunk_retries: 0,
            chunk_retry_interval_ms: 0,
            permanent_errors: default_permanent_errors(),
            success_statuses: default_success_statuses(),
            speed_smoothing_factor: default_speed_smoothing_factor(),
            progress_callbacks_interval_ms: default_progress_callbacks_interval_ms(),
            allow_duplicate_uploads: false,
        }
    }
}

impl UploadConfig {
    /// 校验配置
    pub fn validate(&self) -> UploadResult<()> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidChunkSize(self.chunk_size));
        }
        if self.simultaneous_uploads == 0 {
            return Err(UploadError::InvalidConfig(
                "simultaneous_uploads 必须大于 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speed_smoothing_factor) {
            return Err(UploadError::InvalidConfig(format!(
                "speed_smoothing_factor 必须在 [0, 1] 范围内: {}",
                self.speed_smoothing_factor
            )));
        }
        Ok(())
    }

    pub fn chunk_retry_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_interval_ms)
    }

    pub fn progress_callbacks_interval(&self) -> Duration {
        Duration::from_millis(self.progress_callbacks_interval_ms)
    }

    pub fn is_permanent_error(&self, status: u16) -> bool {
        self.permanent_errors.contains(&status)
    }

    pub fn is_success_status(&self, status: u16) -> bool {
        self.success_statuses.contains(&status)
    }

    /// 静态查询参数（按键排序）
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// HTTP 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 附加请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 上报进度的请求体分块大小（字节）
    #[serde(default = "default_progress_block_size")]
    pub progress_block_size: usize,
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("chunked-upload/{}", env!("CARGO_PKG_VERSION"))
}

fn default_progress_block_size() -> usize {
    64 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            headers: BTreeMap::new(),
            progress_block_size: default_progress_block_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload
            .validate()
            .context("保存配置失败：上传配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
