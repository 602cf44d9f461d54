// 共享数据模型 - Tick记录与蜡烛行
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;

use crate::cdlcommon::Result;

/// 行情源推送的单条Tick记录
///
/// 只保留聚合所需字段；原始JSON行留作广播转发，不做持久化。
#[derive(Debug, Clone)]
pub struct TickRecord {
    /// 行情源符号（如 "BTC-USD"）
    pub symbol: String,
    /// 价格（优先ask，其次last/price）
    pub price: f64,
    /// 时间戳（毫秒）
    pub timestamp_ms: i64,
    /// 原始JSON行，用于原始Tick广播
    pub raw: String,
}

/// 解析一条换行分隔帧中的JSON记录
///
/// 不带 `t` 时间戳字段的记录是控制/确认帧，返回 Ok(None) 直接忽略；
/// 缺符号或缺价格的记录同样按非Tick处理。只有JSON本身损坏才返回错误。
pub fn parse_tick_line(line: &str) -> Result<Option<TickRecord>> {
    let json: serde_json::Value = serde_json::from_str(line)?;

    let timestamp_ms = match json.get("t").and_then(|v| v.as_i64()) {
        Some(t) => t,
        None => return Ok(None),
    };

    let symbol = match json.get("s").and_then(|v| v.as_str()) {
        Some(s) => s.to_string(),
        None => return Ok(None),
    };

    let price = match extract_price(&json) {
        Some(p) => p,
        None => return Ok(None),
    };

    Ok(Some(TickRecord {
        symbol,
        price,
        timestamp_ms,
        raw: line.to_string(),
    }))
}

/// 从Tick记录中取价格：优先 `a`（ask），其次 `p`；数字与数字字符串都接受
fn extract_price(json: &serde_json::Value) -> Option<f64> {
    for field in ["a", "p"] {
        match json.get(field) {
            Some(v) if v.is_number() => return v.as_f64(),
            Some(v) => {
                if let Some(p) = v.as_str().and_then(|s| s.parse::<f64>().ok()) {
                    return Some(p);
                }
            }
            None => {}
        }
    }
    None
}

/// 已完结蜡烛行 - 落库到candles表的不可变快照
///
/// 身份键是 (asset_key, interval, start_at)，重复落库按upsert覆盖。
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRow {
    pub asset_key: String,
    pub interval: &'static str,
    /// 桶起始时间（epoch秒，按周期对齐）
    pub start_at: i64,
    /// 桶归属的交易日（"YYYY-MM-DD"）
    pub session_date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// 桶内Tick计数（作为成交量的代理指标）
    pub volume: u64,
}

impl CandleRow {
    /// start_at的UTC "YYYY-MM-DD HH:MM:SS" 表示，对应数据库timestamp列
    pub fn start_at_utc(&self) -> String {
        format_utc_datetime(self.start_at)
    }
}

/// 当前蜡烛快照文档 - 供UI低延迟读取的落盘JSON
#[derive(Debug, Clone, Serialize)]
pub struct CurrentCandle {
    pub asset_key: String,
    pub interval: &'static str,
    /// 桶起始（ISO-8601 UTC）
    pub start_at: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// 本文档最后更新时刻（ISO-8601 UTC）
    pub last_update: String,
}

/// 将epoch秒格式化为UTC "YYYY-MM-DD HH:MM:SS"
pub fn format_utc_datetime(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// 将epoch秒格式化为UTC "YYYY-MM-DD"
pub fn format_utc_date(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// 将epoch秒格式化为ISO-8601 UTC字符串
pub fn format_utc_iso8601(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// 按资产配置的小数位四舍五入价格
pub fn round_price(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
