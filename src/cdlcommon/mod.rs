// 导出共享模块
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod snapshot;

// 重新导出常用类型，方便使用
pub use config::{AssetDirectory, AssetEntry, FeedType, ListenerConfig};
pub use db::Database;
pub use error::{AppError, Result};
pub use models::{CandleRow, CurrentCandle, TickRecord};
pub use snapshot::SnapshotWriter;
