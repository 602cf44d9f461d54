// 导出行情与聚合模块
pub mod engine;
pub mod streamer;

pub use engine::{CandleEngine, CandleState};
pub use streamer::{Backoff, FeedStreamer};
