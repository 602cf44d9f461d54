//! 蜡烛聚合服务配置模块

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use url::Url;

use crate::cdlcommon::{AppError, Result};

/// 系统配置常量
pub mod constants {
    /// 支持的蜡烛周期及其秒数
    pub const INTERVALS: &[(&str, i64)] = &[
        ("15s", 15),
        ("1m", 60),
        ("5m", 300),
        ("15m", 900),
        ("30m", 1800),
        ("1h", 3600),
    ];

    /// 当前蜡烛JSON的最小输出间隔（毫秒）
    pub const DEFAULT_JSON_THROTTLE_MS: u64 = 1000;

    /// 单次upsert的最大行数
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

    /// 过期桶的宽限时间（秒）
    pub const DEFAULT_GRACE_SECONDS: i64 = 2;

    /// 重连退避下限（秒）
    pub const BACKOFF_FLOOR_SECS: u64 = 1;

    /// 重连退避上限（秒）
    pub const BACKOFF_CEILING_SECS: u64 = 30;

    /// 看门狗检查间隔（秒）
    pub const WATCHDOG_CHECK_INTERVAL_SECS: u64 = 5;

    /// 无Tick静默阈值（秒），超过则强制重连
    pub const WATCHDOG_SILENCE_SECS: u64 = 25;
}

use constants::*;

/// 查指定周期标签的秒数
pub fn interval_seconds(label: &str) -> Option<i64> {
    INTERVALS
        .iter()
        .find(|(l, _)| *l == label)
        .map(|(_, secs)| *secs)
}

/// 行情源类型 - 不同类型走各自的订阅端点，由独立进程监听
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedType {
    Crypto,
    Forex,
    Us,
}

impl FeedType {
    /// 行情源端点路径
    pub fn endpoint(&self) -> &'static str {
        match self {
            FeedType::Crypto => "crypto",
            FeedType::Forex => "forex",
            FeedType::Us => "us",
        }
    }
}

impl std::fmt::Display for FeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.endpoint())
    }
}

impl FromStr for FeedType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crypto" => Ok(FeedType::Crypto),
            "forex" => Ok(FeedType::Forex),
            "us" => Ok(FeedType::Us),
            other => Err(AppError::ConfigError(format!(
                "未知的行情类型: {other}（可选: crypto, forex, us）"
            ))),
        }
    }
}

/// 单个资产的静态配置
#[derive(Debug, Clone, Deserialize)]
pub struct AssetEntry {
    /// 行情源使用的符号（如 "BTC-USD"）
    pub data_symbol: String,
    /// 资产类型
    #[serde(rename = "type")]
    pub feed_type: FeedType,
    /// 交易时区（IANA名）
    pub timezone: String,
    /// 交易日开盘时间（"HH:MM:SS" 当地时间）
    pub open_time: String,
    /// 价格小数位
    pub decimals: u32,
}

impl AssetEntry {
    /// 解析配置的时区
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| AppError::ConfigError(format!("无效的时区: {}", self.timezone)))
    }

    /// 解析配置的开盘时间
    pub fn session_open(&self) -> Result<NaiveTime> {
        Ok(NaiveTime::parse_from_str(&self.open_time, "%H:%M:%S")?)
    }
}

/// 资产目录 - 配置装载后的运行时形态
///
/// 反查表在启动时一次性构建，Tick热路径上的符号解析是O(1)查表。
#[derive(Debug, Clone)]
pub struct AssetDirectory {
    /// 资产键 -> 资产配置
    entries: HashMap<String, AssetEntry>,
    /// 行情符号 -> 资产键
    symbol_to_key: HashMap<String, String>,
}

impl AssetDirectory {
    /// 从配置条目构建目录，同时校验行情符号与资产键一一对应
    pub fn from_entries(entries: HashMap<String, AssetEntry>) -> Result<Self> {
        let mut symbol_to_key = HashMap::with_capacity(entries.len());
        for (key, entry) in &entries {
            if let Some(prev) = symbol_to_key.insert(entry.data_symbol.clone(), key.clone()) {
                return Err(AppError::ConfigError(format!(
                    "行情符号 {} 被 {} 与 {} 同时使用，映射必须一一对应",
                    entry.data_symbol, prev, key
                )));
            }
        }
        Ok(Self {
            entries,
            symbol_to_key,
        })
    }

    /// 反查：行情符号 -> 资产键；未配置的符号返回None
    pub fn resolve_symbol(&self, data_symbol: &str) -> Option<&str> {
        self.symbol_to_key.get(data_symbol).map(|s| s.as_str())
    }

    /// 按资产键取配置
    pub fn get(&self, asset_key: &str) -> Option<&AssetEntry> {
        self.entries.get(asset_key)
    }

    /// 指定行情类型的订阅符号列表
    pub fn symbols_for(&self, feed_type: FeedType) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.feed_type == feed_type)
            .map(|e| e.data_symbol.clone())
            .collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 蜡烛聚合服务配置
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// 行情源连接配置
    pub feed: FeedConfig,

    /// 聚合引擎配置
    #[serde(default)]
    pub engine: EngineConfig,

    /// 数据库配置
    #[serde(default)]
    pub database: DatabaseConfig,

    /// 快照输出配置
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// 资产目录：资产键 -> 资产配置
    pub assets: HashMap<String, AssetEntry>,
}

/// 行情源连接配置
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// WebSocket基础URL，端点路径与token在连接时拼接
    pub websocket_base_url: String,

    /// API token；留空时从环境变量 EODHD_API_TOKEN 读取
    #[serde(default)]
    pub api_token: String,
}

impl FeedConfig {
    /// 取生效的API token
    pub fn resolved_token(&self) -> Result<String> {
        if !self.api_token.is_empty() {
            return Ok(self.api_token.clone());
        }
        std::env::var("EODHD_API_TOKEN").map_err(|_| {
            AppError::ConfigError(
                "未配置API token（feed.api_token 或环境变量 EODHD_API_TOKEN）".to_string(),
            )
        })
    }

    /// 拼出指定行情类型的完整连接URL
    pub fn url_for(&self, feed_type: FeedType) -> Result<Url> {
        let url = format!(
            "{}/{}?api_token={}",
            self.websocket_base_url.trim_end_matches('/'),
            feed_type.endpoint(),
            self.resolved_token()?
        );
        Ok(Url::parse(&url)?)
    }
}

/// 聚合引擎配置
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// 当前蜡烛JSON的最小输出间隔（毫秒）
    #[serde(default = "default_json_throttle_ms")]
    pub json_throttle_ms: u64,

    /// 单次upsert的最大行数
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// 过期桶的宽限时间（秒）
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            json_throttle_ms: DEFAULT_JSON_THROTTLE_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            grace_seconds: DEFAULT_GRACE_SECONDS,
        }
    }
}

fn default_json_throttle_ms() -> u64 {
    DEFAULT_JSON_THROTTLE_MS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_grace_seconds() -> i64 {
    DEFAULT_GRACE_SECONDS
}

/// 数据库配置
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库文件路径
    pub database_path: String,

    /// 连接池大小
    pub pool_size: u32,

    /// 是否启用WAL模式
    pub enable_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/candles.db".to_string(),
            pool_size: 8,
            enable_wal: true,
        }
    }
}

/// 快照输出配置
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// 快照文档的根目录
    pub data_dir: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

impl ListenerConfig {
    /// 从文件加载配置
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::ConfigError(format!("解析配置文件失败: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// 构建运行时资产目录
    pub fn asset_directory(&self) -> Result<AssetDirectory> {
        AssetDirectory::from_entries(self.assets.clone())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        // 验证资产目录
        if self.assets.is_empty() {
            return Err(AppError::ConfigError("资产目录不能为空".to_string()));
        }

        for (key, entry) in &self.assets {
            if entry.data_symbol.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "资产 {key} 缺少行情符号"
                )));
            }
            entry.tz()?;
            entry.session_open().map_err(|_| {
                AppError::ConfigError(format!(
                    "资产 {key} 的开盘时间无效: {}（应为HH:MM:SS）",
                    entry.open_time
                ))
            })?;
            if entry.decimals > 12 {
                return Err(AppError::ConfigError(format!(
                    "资产 {key} 的小数位超出范围: {}",
                    entry.decimals
                )));
            }
        }

        // 行情符号映射必须一一对应
        self.asset_directory()?;

        // 验证行情源配置
        if self.feed.websocket_base_url.is_empty() {
            return Err(AppError::ConfigError(
                "行情源WebSocket URL不能为空".to_string(),
            ));
        }

        // 验证引擎配置
        if self.engine.json_throttle_ms == 0 {
            return Err(AppError::ConfigError(
                "快照输出间隔必须大于0".to_string(),
            ));
        }

        if self.engine.max_batch_size == 0 {
            return Err(AppError::ConfigError(
                "批量写入大小必须大于0".to_string(),
            ));
        }

        if self.engine.grace_seconds < 0 {
            return Err(AppError::ConfigError(
                "过期桶宽限时间不能为负".to_string(),
            ));
        }

        // 验证数据库配置
        if self.database.pool_size == 0 {
            return Err(AppError::ConfigError(
                "数据库连接池大小必须大于0".to_string(),
            ));
        }

        Ok(())
    }
}
