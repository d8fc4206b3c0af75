//! 统一日志系统初始化模块
//!
//! 控制台输出 + 按天滚动的文件日志，过滤规则与各二进制共享

use crate::rtcommon::config::LoggingConfig;
use crate::rtcommon::{AppError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// 业务日志过滤器：第三方库只保留 warn 以上
pub fn business_filter(log_level: &str) -> String {
    format!("{},hyper=warn,reqwest=warn,rusqlite=warn,r2d2=warn", log_level)
}

/// 初始化日志系统
///
/// 返回的 guard 必须由 main 持有到进程结束，否则文件日志可能丢失尾部内容。
/// RUST_LOG 环境变量优先于配置文件中的级别。
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let filter_str = business_filter(&log_level);

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_filter(EnvFilter::new(&filter_str));

    let console_layer = if config.enable_console_output {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(EnvFilter::new(&filter_str)),
        )
    } else {
        None
    };

    Registry::default()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("日志系统初始化失败: {}", e)))?;

    tracing::info!(log_level = %log_level, log_dir = %config.log_dir, "日志系统初始化完成");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_quiets_dependencies() {
        let filter = business_filter("debug");
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
