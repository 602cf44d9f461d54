#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use candle_server::cdlcommon::config::{AssetEntry, FeedType};
    use candle_server::cdlcommon::models::CurrentCandle;
    use candle_server::cdlcommon::SnapshotWriter;

    fn fresh_writer(name: &str) -> SnapshotWriter {
        let dir = format!("./target/test_snapshot_writer/{name}");
        let _ = fs::remove_dir_all(&dir);
        SnapshotWriter::new(dir)
    }

    #[test]
    fn current_candle_document_is_atomic_and_complete() {
        let writer = fresh_writer("current");

        let doc = CurrentCandle {
            asset_key: "BTCUSD".to_string(),
            interval: "1m",
            start_at: "2025-01-06T18:00:00Z".to_string(),
            open: 64000.0,
            high: 64100.0,
            low: 63950.0,
            close: 64050.0,
            volume: 42,
            last_update: "2025-01-06T18:00:59Z".to_string(),
        };
        let path = writer.write_current_candle(&doc).unwrap();

        assert!(path.ends_with(Path::new("candles_current/BTCUSD/1m.json")));
        assert!(
            !path.with_extension("json.tmp").exists(),
            "rename后不应残留临时文件"
        );

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["asset_key"], "BTCUSD");
        assert_eq!(json["interval"], "1m");
        assert_eq!(json["start_at"], "2025-01-06T18:00:00Z");
        assert_eq!(json["high"], 64100.0);
        assert_eq!(json["volume"], 42);
        assert_eq!(json["last_update"], "2025-01-06T18:00:59Z");
    }

    #[test]
    fn overwrite_keeps_single_document() {
        let writer = fresh_writer("overwrite");

        let mut doc = CurrentCandle {
            asset_key: "BTCUSD".to_string(),
            interval: "1m",
            start_at: "2025-01-06T18:00:00Z".to_string(),
            open: 64000.0,
            high: 64000.0,
            low: 64000.0,
            close: 64000.0,
            volume: 1,
            last_update: "2025-01-06T18:00:01Z".to_string(),
        };
        writer.write_current_candle(&doc).unwrap();

        doc.close = 64500.0;
        doc.volume = 2;
        let path = writer.write_current_candle(&doc).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["close"], 64500.0, "覆盖语义，文档只保留最新状态");
        assert_eq!(json["volume"], 2);
    }

    #[test]
    fn last_price_rounds_and_renames_symbol() {
        let writer = fresh_writer("last_price");

        let path = writer.write_last_price("BTC-USD", 64123.456, 2).unwrap();
        assert!(path.ends_with(Path::new("last_prices/BTC_USD.json")));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["price"], 64123.46);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn session_open_is_captured_once_per_day() {
        let writer = fresh_writer("session_open");

        // UTC零点开盘的资产，任意时刻都已过开盘时间
        let entry = AssetEntry {
            data_symbol: "BTC-USD".to_string(),
            feed_type: FeedType::Crypto,
            timezone: "UTC".to_string(),
            open_time: "00:00:00".to_string(),
            decimals: 2,
        };

        let first = writer.capture_session_open(&entry, 64000.128).unwrap();
        let path = first.expect("开盘后的第一笔价格应被捕获");

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["open"], 64000.13);

        let second = writer.capture_session_open(&entry, 65000.0).unwrap();
        assert!(second.is_none(), "同一交易日不应重复捕获开盘价");
    }
}
