use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// 上游在重试耗尽后仍不可用
    #[error("Source unavailable: {source_name} failed after {attempts} attempts: {last_error}")]
    SourceUnavailable {
        source_name: String,
        attempts: usize,
        last_error: String,
    },

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Currency not found: {0}")]
    CurrencyNotFound(String),

    /// 法币腿和回退数据都为空
    #[error("No fallback data: {0}")]
    NoFallbackData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Time parsing error: {0}")]
    TimeParseError(#[from] chrono::ParseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Scheduler error: {0}")]
    SchedulerError(String),
}

impl AppError {
    /// 获取错误类型的简洁摘要，用于日志中的 error.summary 字段
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 行情获取
            AppError::SourceUnavailable { .. } => "rate_source_unavailable",
            AppError::ApiError(_) => "rate_data_acquisition_failed",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::JsonError(_) => "rate_data_parsing_failed",

            // 语义错误
            AppError::SymbolNotFound(_) => "crypto_symbol_unknown",
            AppError::CurrencyNotFound(_) => "fiat_currency_unknown",
            AppError::NotFound(_) => "rate_row_missing",
            AppError::NoFallbackData(_) => "rate_fallback_exhausted",
            AppError::ValidationError(_) => "rate_query_invalid",

            // 存储
            AppError::DatabaseError(_) => "rate_data_persistence_failed",
            AppError::SqliteError(_) => "rate_storage_operation_failed",

            // 系统
            AppError::IoError(_) => "rate_file_operation_failed",
            AppError::TimeParseError(_) => "rate_timestamp_invalid",
            AppError::ConfigError(_) => "rate_service_configuration_invalid",
            AppError::SchedulerError(_) => "refresh_scheduler_failed",
        }
    }

    /// 检查错误是否为可重试类型
    ///
    /// 只有网络层面的瞬时错误才会重试，语义错误（未知交易对、未知币种）立即失败
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::HttpError(e) => {
                // 4xx 中只有限流值得重试
                match e.status() {
                    Some(status) => status.is_server_error() || status.as_u16() == 429,
                    None => true,
                }
            }
            AppError::ApiError(_) => true,
            AppError::IoError(_) => true,

            // 数据库繁忙由连接上的 busy_timeout 等待处理
            AppError::DatabaseError(_)
            | AppError::SourceUnavailable { .. }
            | AppError::SymbolNotFound(_)
            | AppError::CurrencyNotFound(_)
            | AppError::NotFound(_)
            | AppError::NoFallbackData(_)
            | AppError::ValidationError(_)
            | AppError::JsonError(_)
            | AppError::TimeParseError(_)
            | AppError::ConfigError(_)
            | AppError::SqliteError(_)
            | AppError::SchedulerError(_) => false,
        }
    }

    /// HTTP 层使用的状态码映射
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::SymbolNotFound(_) | AppError::CurrencyNotFound(_) | AppError::NotFound(_) => 404,
            AppError::ValidationError(_) => 400,
            _ => 500,
        }
    }

    /// 面向用户的错误信息；500 类错误不暴露内部细节（连接串、凭据等）
    pub fn public_message(&self) -> String {
        match self.http_status() {
            500 => "internal error while computing rates".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
