//! 汇率服务配置模块
//!
//! 配置在进程启动时构造一次，通过 Arc 注入到数据源、合成器和调度器中。

use crate::rtcommon::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 系统配置常量
pub mod constants {
    /// 币安单次请求返回的最大K线数
    pub const BINANCE_KLINE_PAGE_LIMIT: usize = 1000;

    /// 默认参考稳定币
    pub const DEFAULT_REFERENCE_STABLE: &str = "USDT";

    /// 单点合成时向前后各扩展的窗口（毫秒）
    pub const POINT_WINDOW_MS: i64 = 60 * 60 * 1000;

    /// 日标量回退的最大天数差
    pub const DEFAULT_DAY_TOLERANCE: i64 = 7;

    /// 日内序列匹配的最大时间差（秒）
    pub const DEFAULT_INTRADAY_TOLERANCE_SECS: i64 = 3600;

    /// HTTP 层允许的最大回看天数
    pub const DEFAULT_MAX_LOOKBACK_DAYS: u32 = 365;
}

use constants::*;

/// 汇率服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub crypto_source: CryptoSourceConfig,
    pub fiat_source: FiatSourceConfig,
    pub synthesis: SynthesisConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,
    /// 连接池大小
    pub pool_size: u32,
    /// SQLite 忙等待超时（毫秒）
    pub busy_timeout_ms: u64,
}

/// 加密货币行情源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoSourceConfig {
    pub api_url: String,
    /// 单次HTTP请求的总超时（秒）
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// 最大尝试次数（含首次）
    pub max_attempts: usize,
    /// 首次重试前的等待（毫秒），之后每次翻倍
    pub retry_base_delay_ms: u64,
    /// 每页K线数量上限
    pub page_limit: usize,
    /// 可选代理，例如 socks5://127.0.0.1:1080
    pub proxy_url: Option<String>,
}

/// 法币汇率源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiatSourceConfig {
    pub api_url: String,
    pub timeout_secs: u64,
    pub max_attempts: usize,
    pub retry_base_delay_ms: u64,
    /// 汇率表的本币
    pub local_currency: String,
    /// 与参考稳定币对应的法币（USDT -> USD）
    pub reference_code: String,
}

/// 合成引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub reference_stable: String,
    /// 按日回退时的最大并发请求数
    pub fallback_concurrency: usize,
    pub day_tolerance: i64,
    pub intraday_tolerance_secs: i64,
    pub max_lookback_days: u32,
}

/// 定时刷新配置（时间均为 UTC）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub fiat_hour: u32,
    pub fiat_minute: u32,
    pub crypto_hour: u32,
    pub crypto_minute: u32,
    pub crypto_period_minutes: u64,
    /// 需要定时刷新的加密货币（不含稳定币后缀）
    pub crypto_symbols: Vec<String>,
    /// 定时合成的目标法币
    pub crypto_fiat: String,
    /// stop() 等待后台任务退出的最长时间（秒）
    pub stop_timeout_secs: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_dir: String,
    pub file_prefix: String,
    pub enable_console_output: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/rates.db".to_string(),
            pool_size: 10,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for CryptoSourceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.binance.com".to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            page_limit: BINANCE_KLINE_PAGE_LIMIT,
            proxy_url: None,
        }
    }
}

impl Default for FiatSourceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://www.cbr-xml-daily.ru".to_string(),
            timeout_secs: 15,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            local_currency: "RUB".to_string(),
            reference_code: "USD".to_string(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            reference_stable: DEFAULT_REFERENCE_STABLE.to_string(),
            fallback_concurrency: 8,
            day_tolerance: DEFAULT_DAY_TOLERANCE,
            intraday_tolerance_secs: DEFAULT_INTRADAY_TOLERANCE_SECS,
            max_lookback_days: DEFAULT_MAX_LOOKBACK_DAYS,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fiat_hour: 9,
            fiat_minute: 0,
            crypto_hour: 0,
            crypto_minute: 0,
            crypto_period_minutes: 15,
            crypto_symbols: vec!["BTC".to_string(), "ETH".to_string(), "TON".to_string()],
            crypto_fiat: "RUB".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "logs".to_string(),
            file_prefix: "rate_server.log".to_string(),
            enable_console_output: true,
        }
    }
}

impl CryptoSourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SchedulerConfig {
    pub fn crypto_period(&self) -> Duration {
        Duration::from_secs(self.crypto_period_minutes * 60)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError("数据库连接池大小必须大于0".to_string()));
        }

        for (name, attempts) in [
            ("crypto_source", self.crypto_source.max_attempts),
            ("fiat_source", self.fiat_source.max_attempts),
        ] {
            if attempts == 0 {
                return Err(AppError::ConfigError(format!("{} 的最大尝试次数必须大于0", name)));
            }
        }

        if !(10..=30).contains(&self.crypto_source.timeout_secs) {
            return Err(AppError::ConfigError(
                "crypto_source.timeout_secs 必须在 10 到 30 秒之间".to_string(),
            ));
        }

        if self.crypto_source.page_limit == 0 || self.crypto_source.page_limit > BINANCE_KLINE_PAGE_LIMIT {
            return Err(AppError::ConfigError(format!(
                "每页K线数量必须在 1 到 {} 之间",
                BINANCE_KLINE_PAGE_LIMIT
            )));
        }

        if self.synthesis.reference_stable.is_empty() {
            return Err(AppError::ConfigError("参考稳定币不能为空".to_string()));
        }

        if self.synthesis.fallback_concurrency == 0 {
            return Err(AppError::ConfigError("回退并发数必须大于0".to_string()));
        }

        if self.synthesis.day_tolerance < 0 || self.synthesis.intraday_tolerance_secs < 0 {
            return Err(AppError::ConfigError("匹配容差不能为负数".to_string()));
        }

        let s = &self.scheduler;
        if s.fiat_hour > 23 || s.crypto_hour > 23 || s.fiat_minute > 59 || s.crypto_minute > 59 {
            return Err(AppError::ConfigError("调度时间必须是合法的 UTC 时:分".to_string()));
        }

        if s.crypto_period_minutes == 0 {
            return Err(AppError::ConfigError("加密货币刷新周期必须大于0".to_string()));
        }

        Ok(())
    }
}
