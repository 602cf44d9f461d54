// 文件: src/cdlcommon/snapshot.rs
// 快照模块 - 以临时文件+原子rename输出供其他进程读取的JSON文档
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::cdlcommon::config::AssetEntry;
use crate::cdlcommon::models::{round_price, CurrentCandle};
use crate::cdlcommon::Result;

/// 快照写入器
///
/// 所有文档先写 `<path>.tmp` 再rename到位，读取方不会看到半截文件；
/// 纯覆盖语义，这一层不保留历史。
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    data_dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// 写当前蜡烛文档: candles_current/<资产键>/<周期>.json
    pub fn write_current_candle(&self, candle: &CurrentCandle) -> Result<PathBuf> {
        let path = self
            .data_dir
            .join("candles_current")
            .join(&candle.asset_key)
            .join(format!("{}.json", candle.interval));
        self.write_atomic(&path, &serde_json::to_vec(candle)?)?;
        Ok(path)
    }

    /// 写最新价文档: last_prices/<符号>.json
    pub fn write_last_price(&self, data_symbol: &str, price: f64, decimals: u32) -> Result<PathBuf> {
        let payload = json!({
            "price": round_price(price, decimals),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let path = self
            .data_dir
            .join("last_prices")
            .join(format!("{}.json", file_key(data_symbol)));
        self.write_atomic(&path, &serde_json::to_vec(&payload)?)?;
        Ok(path)
    }

    /// 按交易日捕获开盘价: open_prices/<符号>_<日期>.json
    ///
    /// 当地时间到达开盘时间后的第一笔价格写入；当日文件已存在则不覆盖。
    pub fn capture_session_open(&self, entry: &AssetEntry, price: f64) -> Result<Option<PathBuf>> {
        let tz = entry.tz()?;
        let open_time = entry.session_open()?;
        let now_local = Utc::now().with_timezone(&tz);

        if now_local.time() < open_time {
            return Ok(None);
        }

        let path = self.data_dir.join("open_prices").join(format!(
            "{}_{}.json",
            file_key(&entry.data_symbol),
            now_local.format("%Y-%m-%d")
        ));
        if path.exists() {
            return Ok(None);
        }

        let payload = json!({ "open": round_price(price, entry.decimals) });
        self.write_atomic(&path, &serde_json::to_vec(&payload)?)?;
        Ok(Some(path))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// 行情符号到文件名键：'-' 替换为 '_'
fn file_key(data_symbol: &str) -> String {
    data_symbol.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_key_replaces_dashes() {
        assert_eq!(file_key("BTC-USD"), "BTC_USD");
        assert_eq!(file_key("EURUSD"), "EURUSD");
    }
}
