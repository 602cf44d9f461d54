// 文件: src/cdlcommon/db.rs
// 数据库模块 - candles表的持久化与异步写入队列
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use once_cell::sync::Lazy;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info};

use crate::cdlcommon::config::constants::INTERVALS;
use crate::cdlcommon::error::{AppError, Result};
use crate::cdlcommon::models::CandleRow;

// 全局写入计数，定期输出一次统计而不是逐批刷屏
static DB_WRITE_STATS: Lazy<(AtomicUsize, Mutex<Instant>)> =
    Lazy::new(|| (AtomicUsize::new(0), Mutex::new(Instant::now())));

/// 写入统计的输出间隔（秒）
const DB_LOG_INTERVAL: u64 = 10;

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 数据库中读出的蜡烛行（含时间戳列）
#[derive(Debug, Clone)]
pub struct StoredCandle {
    pub asset_key: String,
    pub interval: String,
    pub start_at: String,
    pub session_date: Option<String>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// SQLite数据库封装
///
/// candles表以 (asset_key, interval, start_at) 唯一，是蜡烛数据的唯一长期属主。
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    max_batch_size: usize,
}

impl Database {
    /// 打开（或创建）数据库并初始化schema
    pub fn new(path: &Path, pool_size: u32, enable_wal: bool, max_batch_size: usize) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("创建连接池失败: {}", e)))?;

        let db = Self {
            pool,
            max_batch_size,
        };
        db.init_schema(enable_wal)?;
        Ok(db)
    }

    fn init_schema(&self, enable_wal: bool) -> Result<()> {
        let conn = self.conn()?;

        if enable_wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }

        // interval列限定为固定周期标签集合
        let labels = INTERVALS
            .iter()
            .map(|(label, _)| format!("'{}'", label))
            .collect::<Vec<_>>()
            .join(",");

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_key TEXT NOT NULL,
                interval TEXT NOT NULL CHECK (interval IN ({labels})),
                start_at TEXT NOT NULL,
                session_date TEXT,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (asset_key, interval, start_at)
            );
            CREATE INDEX IF NOT EXISTS candles_session_idx
                ON candles (asset_key, session_date, interval);"
        ))?;

        Ok(())
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    /// 幂等upsert一批已完结蜡烛
    ///
    /// 相同 (asset_key, interval, start_at) 覆盖可变列，created_at保持首次写入值；
    /// 超过max_batch_size的批次按块分事务写入，限制单事务体积。
    pub fn upsert_candles(&self, rows: &[CandleRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut count = 0usize;

        for chunk in rows.chunks(self.max_batch_size) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO candles (
                        asset_key, interval, start_at, session_date,
                        open, high, low, close, volume, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                    ON CONFLICT (asset_key, interval, start_at) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        volume = excluded.volume,
                        session_date = excluded.session_date,
                        updated_at = excluded.updated_at",
                )?;

                for row in chunk {
                    stmt.execute(params![
                        row.asset_key,
                        row.interval,
                        row.start_at_utc(),
                        row.session_date,
                        row.open,
                        row.high,
                        row.low,
                        row.close,
                        row.volume as i64,
                        now,
                    ])?;
                    count += 1;
                }
            }
            tx.commit()?;
        }

        track_write_stats(count);
        Ok(count)
    }

    /// 删除start_at早于截止时间的蜡烛，返回删除行数
    pub fn prune_candles(&self, cutoff_utc: &str) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM candles WHERE start_at < ?1",
            params![cutoff_utc],
        )?;
        Ok(deleted)
    }

    /// 读取一根蜡烛（排查与测试用）
    pub fn get_candle(
        &self,
        asset_key: &str,
        interval: &str,
        start_at_utc: &str,
    ) -> Result<Option<StoredCandle>> {
        let conn = self.conn()?;
        let candle = conn
            .query_row(
                "SELECT asset_key, interval, start_at, session_date,
                        open, high, low, close, volume, created_at, updated_at
                 FROM candles
                 WHERE asset_key = ?1 AND interval = ?2 AND start_at = ?3",
                params![asset_key, interval, start_at_utc],
                |row| {
                    Ok(StoredCandle {
                        asset_key: row.get(0)?,
                        interval: row.get(1)?,
                        start_at: row.get(2)?,
                        session_date: row.get(3)?,
                        open: row.get(4)?,
                        high: row.get(5)?,
                        low: row.get(6)?,
                        close: row.get(7)?,
                        volume: row.get(8)?,
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(candle)
    }

    /// 表内蜡烛总数
    pub fn count_candles(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// 启动蜡烛写入队列
///
/// 引擎把完结批次发进通道，专职任务在阻塞线程上落库；写入失败只记录错误并
/// 丢弃该批（受限的数据丢失窗口），不做无限重试。返回发送端与任务句柄，
/// 发送端全部释放后任务排空队列并退出。
pub fn spawn_write_queue(db: Database) -> (mpsc::Sender<Vec<CandleRow>>, task::JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<Vec<CandleRow>>(64);

    let handle = tokio::spawn(async move {
        info!(target: "db", "蜡烛写入队列已启动");

        while let Some(batch) = receiver.recv().await {
            let rows = batch.len();
            let db = db.clone();
            let result = task::spawn_blocking(move || db.upsert_candles(&batch)).await;

            match result {
                Ok(Ok(count)) => {
                    debug!(target: "db", "批次落库完成: {} 行", count);
                }
                Ok(Err(e)) => {
                    error!(target: "db", "批次upsert失败，丢弃 {} 行: {}", rows, e);
                }
                Err(e) => {
                    error!(target: "db", "写入任务panic，丢弃 {} 行: {:?}", rows, e);
                }
            }
        }

        info!(target: "db", "蜡烛写入队列已停止");
    });

    (sender, handle)
}

fn track_write_stats(rows: usize) {
    let (counter, last_log) = (&DB_WRITE_STATS.0, &DB_WRITE_STATS.1);
    counter.fetch_add(rows, Ordering::Relaxed);

    let mut last = match last_log.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if last.elapsed().as_secs() >= DB_LOG_INTERVAL {
        let total = counter.swap(0, Ordering::Relaxed);
        if total > 0 {
            info!(target: "db", "近{}秒内upsert蜡烛 {} 行", DB_LOG_INTERVAL, total);
        }
        *last = Instant::now();
    }
}
