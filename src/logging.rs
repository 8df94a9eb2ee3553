//! 日志初始化
//!
//! 控制台始终输出；开启文件日志时按天滚动写入 `log_dir`，
//! 目录中只保留最近 `retention_days` 个日志文件

use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名：chunked-upload.YYYY-MM-DD.log
const LOG_FILE_PREFIX: &str = "chunked-upload";
const LOG_FILE_SUFFIX: &str = "log";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志系统守卫
/// 必须保持存活，否则文件日志的写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 创建按天滚动的日志文件写入器，超出保留数量的旧文件由写入器自动删除
fn file_appender(log_dir: &Path, retention_days: u32) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention_days.max(1) as usize)
        .build(log_dir)
        .with_context(|| format!("创建日志文件失败: {:?}", log_dir))
}

/// 初始化日志系统
///
/// 日志级别优先取 `RUST_LOG`，否则使用配置中的级别。
/// 文件日志创建失败时回退到仅控制台输出
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()));

    let appender = if config.enabled {
        match file_appender(&config.log_dir, config.retention_days) {
            Ok(appender) => Some(appender),
            Err(e) => {
                eprintln!("{:#}，回退到仅控制台输出", e);
                None
            }
        }
    } else {
        None
    };

    let (file_layer, file_guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if file_guard.is_some() {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留 {} 天, 级别={}",
            config.log_dir, config.retention_days, config.level
        );
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_file_appender_writes_daily_file() {
        let dir = TempDir::new().unwrap();
        let mut appender = file_appender(dir.path(), 7).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("chunked-upload."));
        assert!(names[0].ends_with(".log"));
    }

    #[test]
    fn test_file_appender_rejects_file_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();

        assert!(file_appender(&blocker, 7).is_err());
    }
}
