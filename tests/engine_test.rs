#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;

    use candle_server::cdlcommon::config::{AssetDirectory, AssetEntry, EngineConfig, FeedType};
    use candle_server::cdlcommon::models::CandleRow;
    use candle_server::cdlcommon::SnapshotWriter;
    use candle_server::cdldata::CandleEngine;

    // 构建测试资产目录：一个UTC加密资产 + 一个纽约时段的外汇资产
    fn test_assets() -> AssetDirectory {
        let mut entries = HashMap::new();
        entries.insert(
            "BTCUSD".to_string(),
            AssetEntry {
                data_symbol: "BTC-USD".to_string(),
                feed_type: FeedType::Crypto,
                timezone: "UTC".to_string(),
                open_time: "00:00:00".to_string(),
                decimals: 2,
            },
        );
        entries.insert(
            "EURUSD".to_string(),
            AssetEntry {
                data_symbol: "EURUSD".to_string(),
                feed_type: FeedType::Forex,
                timezone: "America/New_York".to_string(),
                open_time: "17:00:00".to_string(),
                decimals: 5,
            },
        );
        AssetDirectory::from_entries(entries).unwrap()
    }

    fn test_engine(name: &str) -> (CandleEngine, mpsc::Receiver<Vec<CandleRow>>) {
        let (tx, rx) = mpsc::channel(16);
        let snapshots = SnapshotWriter::new(format!("./target/test_snapshots/{name}"));
        let engine = CandleEngine::new(test_assets(), EngineConfig::default(), snapshots, tx);
        (engine, rx)
    }

    // 取出通道里当前积压的全部完结行
    fn drain_rows(rx: &mut mpsc::Receiver<Vec<CandleRow>>) -> Vec<CandleRow> {
        let mut rows = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            rows.extend(batch);
        }
        rows
    }

    #[test]
    fn in_bucket_invariants_hold() {
        let (mut engine, _rx) = test_engine("invariants");

        for (ts, price) in [(1000, 100.0), (2000, 95.0), (3000, 105.0), (4000, 102.0)] {
            engine.ingest_tick("BTC-USD", price, ts);
        }

        let candle = engine.open_candle("BTCUSD", "1m").expect("1m蜡烛应已打开");
        assert_eq!(candle.start, 0);
        assert_eq!(candle.open, 100.0, "开盘价只在建桶时设置一次");
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 95.0);
        assert_eq!(candle.close, 102.0, "收盘价跟随最后一笔Tick");
        assert_eq!(candle.volume, 4, "成交量应等于桶内Tick数");

        assert!(candle.low <= candle.open.min(candle.close));
        assert!(candle.high >= candle.open.max(candle.close));
    }

    #[test]
    fn rollover_finalizes_old_bucket_exactly_once() {
        // 规格场景: t=0价100, t=10价105, t=61价103, 60秒周期
        let (mut engine, mut rx) = test_engine("rollover");

        engine.ingest_tick("BTC-USD", 100.0, 0);
        engine.ingest_tick("BTC-USD", 105.0, 10_000);
        engine.ingest_tick("BTC-USD", 103.0, 61_000);

        // t=61的Tick让15s与1m两个周期各完结一个旧桶
        assert_eq!(engine.pending_rows(), 2);
        engine.tick_second_at(61);

        let rows = drain_rows(&mut rx);
        let minute_rows: Vec<&CandleRow> =
            rows.iter().filter(|r| r.interval == "1m").collect();
        assert_eq!(minute_rows.len(), 1, "旧的1m桶应恰好完结一次");

        let row = minute_rows[0];
        assert_eq!(row.start_at, 0);
        assert_eq!(row.open, 100.0);
        assert_eq!(row.high, 105.0);
        assert_eq!(row.low, 100.0);
        assert_eq!(row.close, 105.0);
        assert_eq!(row.volume, 2);

        // 在聚的1m蜡烛只剩[60,120)这一个
        let live = engine.open_candle("BTCUSD", "1m").expect("新桶应已打开");
        assert_eq!(live.start, 60);
        assert_eq!(live.open, 103.0);
        assert_eq!(live.high, 103.0);
        assert_eq!(live.low, 103.0);
        assert_eq!(live.close, 103.0);
        assert_eq!(live.volume, 1);
    }

    #[test]
    fn late_tick_is_dropped() {
        let (mut engine, _rx) = test_engine("late_tick");

        engine.ingest_tick("BTC-USD", 103.0, 61_000);
        // 这笔Tick所属的1m桶[0,60)相对在聚桶[60,120)已经是过去，必须丢弃
        engine.ingest_tick("BTC-USD", 999.0, 5_000);

        let live = engine.open_candle("BTCUSD", "1m").expect("1m蜡烛应存在");
        assert_eq!(live.start, 60, "迟到Tick不能把桶回拨");
        assert_eq!(live.volume, 1);
        assert_eq!(live.high, 103.0, "迟到Tick的价格不能污染新桶");
        assert_eq!(engine.pending_rows(), 0, "迟到Tick不应产生完结行");
    }

    #[test]
    fn stale_sweep_closes_bucket_without_new_ticks() {
        let (mut engine, mut rx) = test_engine("stale_sweep");

        engine.ingest_tick("BTC-USD", 100.0, 500);

        // 15s桶[0,15)在t=18时已超出2秒宽限，1m桶还没有
        engine.tick_second_at(18);
        assert!(
            engine.open_candle("BTCUSD", "15s").is_none(),
            "过期的15s桶应被强制完结"
        );
        assert!(
            engine.open_candle("BTCUSD", "1m").is_some(),
            "未过期的1m桶应保持打开"
        );
        assert_eq!(engine.pending_rows(), 1);

        // 下一秒的批量冲刷把完结行交给落库队列
        engine.tick_second_at(19);
        let rows = drain_rows(&mut rx);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].interval, "15s");
        assert_eq!(rows[0].start_at, 0);
        assert_eq!(rows[0].volume, 1, "零新Tick也要把已有数据完结");
    }

    #[test]
    fn unknown_symbol_is_ignored() {
        let (mut engine, _rx) = test_engine("unknown_symbol");

        engine.ingest_tick("ZZZ-USD", 1.0, 1000);

        assert!(engine.open_candle("BTCUSD", "1m").is_none());
        assert!(engine.open_candle("EURUSD", "1m").is_none());
        assert_eq!(engine.pending_rows(), 0, "未配置符号不应产生任何状态");
    }

    #[test]
    fn finalized_prices_are_rounded_to_asset_decimals() {
        let (mut engine, mut rx) = test_engine("rounding");

        engine.ingest_tick("BTC-USD", 100.123456, 0);
        engine.ingest_tick("BTC-USD", 101.987654, 61_000);
        engine.tick_second_at(61);

        let rows = drain_rows(&mut rx);
        let row = rows
            .iter()
            .find(|r| r.interval == "1m")
            .expect("应有完结的1m行");
        assert_eq!(row.open, 100.12, "BTCUSD配置为2位小数");
        assert_eq!(row.close, 100.12);
    }

    #[test]
    fn session_date_rolls_back_before_forex_open() {
        // 2025-01-06 18:00:00 UTC = 纽约13:00，早于17:00开盘 → 交易日归前一天
        let (mut engine, mut rx) = test_engine("session_before_open");

        engine.ingest_tick("EURUSD", 1.0850, 1_736_186_400_000);
        engine.ingest_tick("EURUSD", 1.0851, 1_736_186_460_000);
        engine.tick_second_at(1_736_186_460);

        let rows = drain_rows(&mut rx);
        let row = rows
            .iter()
            .find(|r| r.interval == "1m")
            .expect("应有完结的1m行");
        assert_eq!(row.session_date, "2025-01-05");
    }

    #[test]
    fn session_date_stays_after_forex_open() {
        // 2025-01-06 23:00:00 UTC = 纽约18:00，已过17:00开盘 → 当天交易日
        let (mut engine, mut rx) = test_engine("session_after_open");

        engine.ingest_tick("EURUSD", 1.0850, 1_736_204_400_000);
        engine.ingest_tick("EURUSD", 1.0851, 1_736_204_460_000);
        engine.tick_second_at(1_736_204_460);

        let rows = drain_rows(&mut rx);
        let row = rows
            .iter()
            .find(|r| r.interval == "1m")
            .expect("应有完结的1m行");
        assert_eq!(row.session_date, "2025-01-06");
    }

    #[test]
    fn session_date_for_utc_midnight_assets() {
        let (mut engine, mut rx) = test_engine("session_utc");

        engine.ingest_tick("BTC-USD", 64000.0, 1_736_186_400_000);
        engine.ingest_tick("BTC-USD", 64001.0, 1_736_186_460_000);
        engine.tick_second_at(1_736_186_460);

        let rows = drain_rows(&mut rx);
        let row = rows
            .iter()
            .find(|r| r.interval == "1m")
            .expect("应有完结的1m行");
        assert_eq!(row.session_date, "2025-01-06", "UTC零点开盘的资产取桶自身日期");
    }

    #[test]
    fn tick_second_emits_current_candle_snapshot() {
        let dir = "./target/test_snapshots/emit_current";
        let _ = std::fs::remove_dir_all(dir);

        let (mut engine, _rx) = test_engine("emit_current");
        engine.ingest_tick("BTC-USD", 64000.0, 1000);
        engine.tick_second_at(1);

        let path = format!("{dir}/candles_current/BTCUSD/1m.json");
        let content = std::fs::read_to_string(&path).expect("当前蜡烛快照应已落盘");
        let doc: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(doc["asset_key"], "BTCUSD");
        assert_eq!(doc["interval"], "1m");
        assert_eq!(doc["open"], 64000.0);
        assert_eq!(doc["volume"], 1);
        assert_eq!(doc["start_at"], "1970-01-01T00:00:00Z");
    }
}
