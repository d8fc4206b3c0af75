// 导出模块
pub mod rtcommon;
pub mod rtdata;

// Re-export error types
pub use rtcommon::error::{AppError, Result};
