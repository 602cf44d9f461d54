// 文件: src/cdldata/engine.rs
// 聚合引擎 - 蜡烛状态表的唯一属主，消费Tick流并按全部周期聚合
use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::cdlcommon::config::{constants::INTERVALS, interval_seconds, AssetDirectory, EngineConfig};
use crate::cdlcommon::models::{
    format_utc_date, format_utc_iso8601, round_price, CandleRow, CurrentCandle, TickRecord,
};
use crate::cdlcommon::snapshot::SnapshotWriter;
use crate::cdlcommon::{AppError, Result};

/// 单个 (资产, 周期) 的在聚蜡烛累加器
#[derive(Debug, Clone, PartialEq)]
pub struct CandleState {
    /// 桶起始（epoch秒，周期对齐）；生命周期内只会整体替换，不会回拨
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// 桶内Tick计数
    pub volume: u64,
}

impl CandleState {
    fn new(start: i64, price: f64) -> Self {
        Self {
            start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1,
        }
    }

    fn apply(&mut self, price: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += 1;
    }
}

/// 聚合引擎
///
/// 状态表单属主：ingest_tick与tick_second在同一任务内被调用，互不竞争；
/// 完结行经通道交给落库队列，引擎自身不做任何阻塞I/O。
pub struct CandleEngine {
    assets: AssetDirectory,
    config: EngineConfig,
    snapshots: SnapshotWriter,
    sink: mpsc::Sender<Vec<CandleRow>>,
    /// 资产键 -> 周期 -> 在聚蜡烛
    state: HashMap<String, HashMap<&'static str, CandleState>>,
    /// 资产键 -> 周期 -> 上次快照输出时刻
    last_json_at: HashMap<String, HashMap<&'static str, Instant>>,
    /// 待落库的已完结蜡烛
    batch: Vec<CandleRow>,
}

impl CandleEngine {
    /// 创建聚合引擎
    pub fn new(
        assets: AssetDirectory,
        config: EngineConfig,
        snapshots: SnapshotWriter,
        sink: mpsc::Sender<Vec<CandleRow>>,
    ) -> Self {
        Self {
            assets,
            config,
            snapshots,
            sink,
            state: HashMap::new(),
            last_json_at: HashMap::new(),
            batch: Vec::new(),
        }
    }

    /// 引擎主循环：select Tick通道与1秒定时器，通道关闭时尽力冲刷后退出
    pub async fn run(mut self, mut ticks: mpsc::Receiver<TickRecord>) {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("聚合引擎已启动");
        loop {
            tokio::select! {
                maybe_tick = ticks.recv() => {
                    match maybe_tick {
                        Some(tick) => self.ingest_tick(&tick.symbol, tick.price, tick.timestamp_ms),
                        None => break, // 上游已退出
                    }
                }
                _ = timer.tick() => self.tick_second(),
            }
        }

        // 停机：把在途批次尽力交给落库队列
        self.flush_batch();
        info!("聚合引擎已停止");
    }

    /// 摄入一笔Tick：解析符号归属后对每个周期独立累加
    ///
    /// 热路径：无I/O、无锁；未配置的符号静默丢弃（订阅面可能比配置面宽）。
    pub fn ingest_tick(&mut self, data_symbol: &str, price: f64, timestamp_ms: i64) {
        let asset_key = match self.assets.resolve_symbol(data_symbol) {
            Some(key) => key.to_string(),
            None => return,
        };

        let ts_sec = timestamp_ms / 1000;
        for &(interval, secs) in INTERVALS {
            let bucket_start = ts_sec / secs * secs;
            self.accumulate(&asset_key, interval, bucket_start, price);
        }
    }

    /// 把一笔价格并入指定桶
    fn accumulate(&mut self, asset_key: &str, interval: &'static str, bucket_start: i64, price: f64) {
        let current_start = self
            .state
            .get(asset_key)
            .and_then(|m| m.get(interval))
            .map(|c| c.start);

        match current_start {
            None => {
                // 该键的第一笔Tick
                self.state
                    .entry(asset_key.to_string())
                    .or_default()
                    .insert(interval, CandleState::new(bucket_start, price));
            }
            Some(start) if start == bucket_start => {
                if let Some(cur) = self.state.get_mut(asset_key).and_then(|m| m.get_mut(interval)) {
                    cur.apply(price);
                }
            }
            Some(start) if start < bucket_start => {
                // 桶推进：先移出并完结旧桶，新桶随后才可见，
                // 同一键任一时刻至多一个累加器
                if let Some(old) = self.state.get_mut(asset_key).and_then(|m| m.remove(interval)) {
                    self.queue_finalize(asset_key, interval, &old);
                }
                self.state
                    .entry(asset_key.to_string())
                    .or_default()
                    .insert(interval, CandleState::new(bucket_start, price));
            }
            Some(start) => {
                // 迟到Tick：所属的桶已经完结，丢弃而不是回写新桶
                trace!(
                    asset_key,
                    interval,
                    tick_bucket = bucket_start,
                    live_bucket = start,
                    "丢弃迟到Tick"
                );
            }
        }
    }

    /// 每秒一次的计时入口：三项维护各自容错，任一失败不影响其余两项
    pub fn tick_second(&mut self) {
        self.tick_second_at(Utc::now().timestamp());
    }

    /// 以显式时钟执行每秒维护（过期判定依赖传入的当前时间）
    pub fn tick_second_at(&mut self, now_sec: i64) {
        self.emit_snapshots();
        self.flush_batch();
        self.sweep_stale(now_sec);
    }

    /// 限频输出当前蜡烛快照
    fn emit_snapshots(&mut self) {
        let throttle = Duration::from_millis(self.config.json_throttle_ms);
        let now_iso = format_utc_iso8601(Utc::now().timestamp());
        let mut emitted: Vec<(String, &'static str)> = Vec::new();

        for (asset_key, by_interval) in &self.state {
            for (&interval, candle) in by_interval {
                let due = self
                    .last_json_at
                    .get(asset_key)
                    .and_then(|m| m.get(interval))
                    .map(|t| t.elapsed() >= throttle)
                    .unwrap_or(true);
                if !due {
                    continue;
                }

                let doc = CurrentCandle {
                    asset_key: asset_key.clone(),
                    interval,
                    start_at: format_utc_iso8601(candle.start),
                    open: candle.open,
                    high: candle.high,
                    low: candle.low,
                    close: candle.close,
                    volume: candle.volume,
                    last_update: now_iso.clone(),
                };

                match self.snapshots.write_current_candle(&doc) {
                    // 写失败不记时刻，下一秒重试
                    Ok(_) => emitted.push((asset_key.clone(), interval)),
                    Err(e) => warn!(asset_key = %asset_key, interval, error = %e, "写当前蜡烛快照失败"),
                }
            }
        }

        let now = Instant::now();
        for (asset_key, interval) in emitted {
            self.last_json_at
                .entry(asset_key)
                .or_default()
                .insert(interval, now);
        }
    }

    /// 把积压的完结行交给落库队列；队列不可用时记录错误并丢弃该批
    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        let rows = batch.len();
        if let Err(e) = self.sink.try_send(batch) {
            // 丢弃而不是积压，避免内存无界增长
            error!(rows, error = %e, "提交蜡烛批次失败，该批已丢弃");
        }
    }

    /// 强制完结已越过桶末且超出宽限期仍无新Tick的蜡烛
    ///
    /// 只完结并移除状态，不为无Tick的时段合成新桶；下一笔真实Tick
    /// 会按自己的时间开新桶。
    fn sweep_stale(&mut self, now_sec: i64) {
        let grace = self.config.grace_seconds;
        let mut stale: Vec<(String, &'static str)> = Vec::new();

        for (asset_key, by_interval) in &self.state {
            for (&interval, candle) in by_interval {
                if let Some(secs) = interval_seconds(interval) {
                    if now_sec > candle.start + secs + grace {
                        stale.push((asset_key.clone(), interval));
                    }
                }
            }
        }

        for (asset_key, interval) in stale {
            if let Some(old) = self.state.get_mut(&asset_key).and_then(|m| m.remove(interval)) {
                debug!(
                    asset_key = %asset_key,
                    interval,
                    bucket_start = old.start,
                    "宽限期内无新Tick，强制完结"
                );
                self.queue_finalize(&asset_key, interval, &old);
            }
        }
    }

    /// 把已完结蜡烛转为持久化行并入队；达到批量上限时立即交给落库队列
    fn queue_finalize(&mut self, asset_key: &str, interval: &'static str, candle: &CandleState) {
        let decimals = self.assets.get(asset_key).map(|e| e.decimals).unwrap_or(6);
        let session_date = match self.session_date(asset_key, candle.start) {
            Ok(date) => date,
            Err(e) => {
                // 时区配置异常不阻断完结，退回UTC日期
                warn!(asset_key, error = %e, "计算交易日失败，按UTC日期落库");
                format_utc_date(candle.start)
            }
        };

        self.batch.push(CandleRow {
            asset_key: asset_key.to_string(),
            interval,
            start_at: candle.start,
            session_date,
            open: round_price(candle.open, decimals),
            high: round_price(candle.high, decimals),
            low: round_price(candle.low, decimals),
            close: round_price(candle.close, decimals),
            volume: candle.volume,
        });

        // 极端行情下防止批次无限增长
        if self.batch.len() >= self.config.max_batch_size {
            self.flush_batch();
        }
    }

    /// 桶归属的交易日：桶起始换算到资产时区后，早于开盘时间则归前一日
    fn session_date(&self, asset_key: &str, bucket_start: i64) -> Result<String> {
        let entry = match self.assets.get(asset_key) {
            Some(e) => e,
            None => return Ok(format_utc_date(bucket_start)),
        };

        let tz = entry.tz()?;
        let open_time = entry.session_open()?;
        let local = Utc
            .timestamp_opt(bucket_start, 0)
            .single()
            .ok_or_else(|| AppError::DataError(format!("非法的桶起始时间: {}", bucket_start)))?
            .with_timezone(&tz);

        let date = if local.time() < open_time {
            local
                .date_naive()
                .pred_opt()
                .unwrap_or_else(|| local.date_naive())
        } else {
            local.date_naive()
        };
        Ok(date.format("%Y-%m-%d").to_string())
    }

    /// 只读访问在聚蜡烛（排查与测试用）
    pub fn open_candle(&self, asset_key: &str, interval: &str) -> Option<&CandleState> {
        self.state.get(asset_key).and_then(|m| m.get(interval))
    }

    /// 当前待落库的完结行数
    pub fn pending_rows(&self) -> usize {
        self.batch.len()
    }
}
