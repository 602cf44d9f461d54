// 导出模块
pub mod cdlcommon;
pub mod cdldata;

// Re-export error types
pub use cdlcommon::error::{AppError, Result};
