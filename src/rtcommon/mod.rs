// 共享模块：错误、模型、配置、存储、日志、重试
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod models;
pub mod retry;

// 重新导出常用类型，方便使用
pub use config::AppConfig;
pub use db::{Database, RateCache};
pub use error::{AppError, Result};
pub use models::{CryptoCandle, FiatRate, FiatTable, Interval, RateSeries, SynthesizedRate};
pub use retry::{retry_with_backoff, RetryPolicy};
