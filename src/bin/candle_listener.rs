// 蜡烛监听服务主程序 - 连接行情源，按类型订阅并把Tick实时聚合为多周期蜡烛
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::EnvFilter;

use candle_server::cdlcommon::config::ListenerConfig;
use candle_server::cdlcommon::db::{spawn_write_queue, Database};
use candle_server::cdlcommon::{AppError, FeedType, Result, SnapshotWriter};
use candle_server::cdldata::{CandleEngine, FeedStreamer};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/CandleServerConfig.toml";

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "candle_listener")]
#[command(about = "Stream real-time ticks for one feed type and aggregate OHLCV candles")]
struct Cli {
    /// 行情类型（crypto / forex / us）
    #[arg(long)]
    feed_type: FeedType,

    /// 配置文件路径
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_app(cli).await
}

/// 应用程序的核心业务逻辑
async fn run_app(cli: Cli) -> Result<()> {
    let config = ListenerConfig::from_file(&cli.config)?;
    let assets = config.asset_directory()?;

    let symbols = assets.symbols_for(cli.feed_type);
    if symbols.is_empty() {
        // 唯一的致命配置错误：该行情类型没有任何已配置资产
        return Err(AppError::ConfigError(format!(
            "行情类型 {} 没有配置任何资产",
            cli.feed_type
        )));
    }
    info!(
        feed_type = %cli.feed_type,
        symbol_count = symbols.len(),
        "已装载配置，共 {} 个资产",
        assets.len()
    );

    let db = Database::new(
        Path::new(&config.database.database_path),
        config.database.pool_size,
        config.database.enable_wal,
        config.engine.max_batch_size,
    )?;
    let (sink, write_queue) = spawn_write_queue(db);

    let snapshots = SnapshotWriter::new(&config.snapshot.data_dir);
    let (tick_tx, tick_rx) = mpsc::channel(4096);
    // 原始Tick广播通道，供仪表盘等下游消费者订阅
    let (raw_tx, _) = broadcast::channel(1024);

    let engine = CandleEngine::new(
        assets.clone(),
        config.engine.clone(),
        snapshots.clone(),
        sink,
    );
    let engine_task = tokio::spawn(engine.run(tick_rx));

    let url = config.feed.url_for(cli.feed_type)?;
    let streamer = FeedStreamer::new(
        url,
        symbols.join(","),
        assets,
        snapshots,
        tick_tx,
        raw_tx,
    );
    let streamer_task = tokio::spawn(streamer.run());

    info!(feed_type = %cli.feed_type, "蜡烛监听服务已启动，Ctrl-C退出");
    tokio::signal::ctrl_c().await?;
    info!("收到退出信号，开始停机");

    // 停掉行情连接；引擎排空通道并把剩余批次交给落库队列后退出
    streamer_task.abort();
    let _ = engine_task.await;
    let _ = write_queue.await;

    info!("停机完成");
    Ok(())
}

/// 初始化tracing日志
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
