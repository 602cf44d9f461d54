// 蜡烛清理工具 - 删除超过保留期的历史蜡烛，配合外部调度器每日运行
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use candle_server::cdlcommon::config::ListenerConfig;
use candle_server::cdlcommon::db::Database;
use candle_server::cdlcommon::Result;

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/CandleServerConfig.toml";

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "candle_prune")]
#[command(about = "Delete candles older than N days (default 30)")]
struct Cli {
    /// 保留天数
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// 配置文件路径
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = ListenerConfig::from_file(&cli.config)?;

    let db = Database::new(
        Path::new(&config.database.database_path),
        config.database.pool_size,
        config.database.enable_wal,
        config.engine.max_batch_size,
    )?;

    let cutoff = (Utc::now() - chrono::Duration::days(cli.days))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string();
    let deleted = db.prune_candles(&cutoff)?;

    info!(deleted, days = cli.days, cutoff = %cutoff, "清理完成");
    Ok(())
}
