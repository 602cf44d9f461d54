// 文件: src/cdldata/streamer.rs
// 行情连接管理 - 受监督的连接/订阅/接收循环，带静默看门狗与指数退避重连
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, trace, warn};
use url::Url;

use crate::cdlcommon::config::constants::{
    BACKOFF_CEILING_SECS, BACKOFF_FLOOR_SECS, WATCHDOG_CHECK_INTERVAL_SECS, WATCHDOG_SILENCE_SECS,
};
use crate::cdlcommon::config::AssetDirectory;
use crate::cdlcommon::models::{parse_tick_line, TickRecord};
use crate::cdlcommon::snapshot::SnapshotWriter;
use crate::cdlcommon::{AppError, Result};

/// 指数退避：1秒起步，每次连续失败翻倍，封顶30秒，连接订阅成功后回到下限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: u64,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_FLOOR_SECS,
        }
    }

    /// 本次应等待的秒数，同时推进到下一档
    pub fn next_delay(&mut self) -> u64 {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_CEILING_SECS);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_FLOOR_SECS;
    }

    pub fn current(&self) -> u64 {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// 看门狗静默判定：距最后一条消息超过阈值即认为连接已假死
pub fn silence_exceeded(since_last_tick: Duration) -> bool {
    since_last_tick > Duration::from_secs(WATCHDOG_SILENCE_SECS)
}

/// 构造订阅消息
pub fn subscribe_message(symbols: &str) -> String {
    json!({
        "action": "subscribe",
        "symbols": symbols,
    })
    .to_string()
}

/// 接收循环的退出原因
#[derive(Debug, PartialEq, Eq)]
enum StreamExit {
    /// 对端关闭或流结束
    ConnectionClosed,
    /// 看门狗判定连接假死
    WatchdogTimeout,
    /// 引擎通道关闭，整个流程该收尾了
    EngineGone,
}

/// 行情连接管理器
///
/// 持有到行情源的流式连接，解码Tick后推给聚合引擎；连接与解析的一切
/// 错误都折算成一次重连，绝不向上冒泡。
pub struct FeedStreamer {
    url: Url,
    /// 逗号分隔的订阅符号列表
    subscribe_list: String,
    assets: AssetDirectory,
    snapshots: SnapshotWriter,
    engine_tx: mpsc::Sender<TickRecord>,
    raw_tx: broadcast::Sender<String>,
}

impl FeedStreamer {
    pub fn new(
        url: Url,
        subscribe_list: String,
        assets: AssetDirectory,
        snapshots: SnapshotWriter,
        engine_tx: mpsc::Sender<TickRecord>,
        raw_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            url,
            subscribe_list,
            assets,
            snapshots,
            engine_tx,
            raw_tx,
        }
    }

    /// 受监督的连接循环
    ///
    /// 看门狗触发立即重连不计退避；其余断开与错误按当前退避延迟后重连。
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();

        loop {
            match self.connect_and_stream(&mut backoff).await {
                Ok(StreamExit::WatchdogTimeout) => {
                    warn!(
                        "静默看门狗触发（超过{}秒无消息），立即重连",
                        WATCHDOG_SILENCE_SECS
                    );
                }
                Ok(StreamExit::EngineGone) => {
                    info!("引擎通道已关闭，行情连接退出");
                    return;
                }
                Ok(StreamExit::ConnectionClosed) => {
                    let delay = backoff.next_delay();
                    warn!(delay_secs = delay, "行情连接断开，计划重连");
                    sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(error = %e, delay_secs = delay, "行情连接失败，计划重连");
                    sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    /// 建立连接、发送订阅并进入接收循环
    async fn connect_and_stream(&mut self, backoff: &mut Backoff) -> Result<StreamExit> {
        info!(endpoint = %self.url.path(), "连接行情源…");

        let (ws_stream, _) = connect_async(self.url.clone())
            .await
            .map_err(|e| AppError::WebSocketError(format!("WebSocket连接失败: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(subscribe_message(&self.subscribe_list)))
            .await
            .map_err(|e| AppError::WebSocketError(format!("发送订阅消息失败: {}", e)))?;

        info!(symbols = %self.subscribe_list, "已连接并发送订阅");
        backoff.reset();

        let mut last_seen = Instant::now();
        let mut watchdog =
            tokio::time::interval(Duration::from_secs(WATCHDOG_CHECK_INTERVAL_SECS));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            if !self.handle_frame(&text).await {
                                return Ok(StreamExit::EngineGone);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return Err(AppError::WebSocketError(format!(
                                    "发送Pong失败: {}",
                                    e
                                )));
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "收到关闭帧");
                            return Ok(StreamExit::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            // 二进制/Pong等，与Tick无关
                        }
                        Some(Err(e)) => {
                            return Err(AppError::WebSocketError(format!("WebSocket错误: {}", e)));
                        }
                        None => return Ok(StreamExit::ConnectionClosed),
                    }
                }
                _ = watchdog.tick() => {
                    if silence_exceeded(last_seen.elapsed()) {
                        return Ok(StreamExit::WatchdogTimeout);
                    }
                }
            }
        }
    }

    /// 处理一个文本帧：可能包含多条换行分隔的JSON记录
    ///
    /// 返回false表示引擎通道已关闭。单条记录解析失败只跳过该条。
    async fn handle_frame(&mut self, payload: &str) -> bool {
        for line in payload.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let tick = match parse_tick_line(line) {
                Ok(Some(tick)) => tick,
                Ok(None) => {
                    trace!(line, "忽略非Tick帧");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, line, "跳过无法解析的记录");
                    continue;
                }
            };

            // 原始Tick广播；没有订阅者时send失败属正常情况
            let _ = self.raw_tx.send(tick.raw.clone());

            self.update_price_snapshots(&tick);

            if self.engine_tx.send(tick).await.is_err() {
                return false;
            }
        }
        true
    }

    /// 最新价与开盘价快照；失败只告警，不影响摄入路径
    fn update_price_snapshots(&self, tick: &TickRecord) {
        let entry = match self
            .assets
            .resolve_symbol(&tick.symbol)
            .and_then(|key| self.assets.get(key))
        {
            Some(entry) => entry,
            None => return,
        };

        if let Err(e) = self
            .snapshots
            .write_last_price(&tick.symbol, tick.price, entry.decimals)
        {
            warn!(symbol = %tick.symbol, error = %e, "写最新价快照失败");
        }

        match self.snapshots.capture_session_open(entry, tick.price) {
            Ok(Some(path)) => {
                info!(symbol = %tick.symbol, path = %path.display(), "已捕获开盘价");
            }
            Ok(None) => {}
            Err(e) => warn!(symbol = %tick.symbol, error = %e, "捕获开盘价失败"),
        }
    }
}
