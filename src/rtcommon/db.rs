use crate::rtcommon::config::DatabaseConfig;
use crate::rtcommon::error::{AppError, Result};
use crate::rtcommon::models::{CryptoCandle, FiatRate, RateSeries};
use async_trait::async_trait;
use chrono::NaiveDate;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::task;
use tracing::{debug, error, info, instrument, warn};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

const DATE_FORMAT: &str = "%Y-%m-%d";

// date, code, name, nominal, value, previous
type FiatRow = (String, String, String, i64, f64, f64);

/// 汇率缓存契约
///
/// 所有写入都是按唯一键的 upsert，重复写入同一批数据不会产生重复行，
/// 只会覆盖数值字段。实现必须允许调度器与请求并发调用。
#[async_trait]
pub trait RateCache: Send + Sync {
    /// 按 (date, code) upsert 法币汇率，返回处理的行数
    async fn upsert_fiat_rates(&self, rows: &[FiatRate]) -> Result<usize>;

    /// 按 (symbol, series, timestamp) upsert K线/合成汇率，返回处理的行数
    async fn upsert_crypto_rates(&self, series: RateSeries, rows: &[CryptoCandle]) -> Result<usize>;

    async fn query_fiat_by_date(&self, date: NaiveDate) -> Result<Vec<FiatRate>>;

    /// 不存在时返回 `NotFound`
    async fn query_fiat_by_code_and_date(&self, code: &str, date: NaiveDate) -> Result<FiatRate>;

    /// 闭区间 [start_ms, end_ms]，按时间升序，只返回同一序列的行
    async fn query_crypto_by_range(
        &self,
        symbol: &str,
        series: RateSeries,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<CryptoCandle>>;

    async fn list_available_symbols(&self) -> Result<Vec<String>>;

    async fn list_available_dates(&self) -> Result<Vec<NaiveDate>>;

    /// 记录请求日期由哪一天的表替代
    async fn record_fiat_substitution(&self, requested: NaiveDate, actual: NaiveDate) -> Result<()>;

    async fn query_fiat_substitution(&self, requested: NaiveDate) -> Result<Option<NaiveDate>>;
}

/// SQLite 实现
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create a database connection pool with WAL mode
    #[instrument(skip(db_path, config), fields(db_path = %db_path.as_ref().display()), err)]
    pub fn with_config<P: AsRef<Path>>(db_path: P, config: &DatabaseConfig) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", "Using SQLite database at {}", db_path.display());

        let busy_timeout_ms = config.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = {busy_timeout_ms};
                "
            ))
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_db()?;
        Ok(db)
    }

    /// 内存数据库，只有一个连接（多个连接会各自看到不同的内存库）
    pub fn in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_db()?;
        Ok(db)
    }

    /// Initialize database tables
    fn init_db(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        // 旧表没有 series 列，缓存数据可以丢弃重建
        let legacy_layout: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'crypto_rates')
                AND NOT EXISTS(SELECT 1 FROM pragma_table_info('crypto_rates') WHERE name = 'series')",
            [],
            |row| row.get(0),
        )?;
        if legacy_layout {
            warn!(target: "db", decision = "drop_legacy_crypto_cache", "crypto_rates 缺少 series 列，重建表");
            conn.execute_batch("DROP TABLE crypto_rates;")?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fiat_rates (
                date TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                nominal INTEGER NOT NULL,
                value REAL NOT NULL,
                previous REAL NOT NULL,
                PRIMARY KEY (date, code)
            );
            CREATE TABLE IF NOT EXISTS fiat_substitutions (
                requested_date TEXT PRIMARY KEY,
                actual_date TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS crypto_rates (
                symbol TEXT NOT NULL,
                series TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, series, timestamp)
            );",
        )?;

        debug!(target: "db", decision = "init_db_complete", "数据库表初始化完成");
        Ok(())
    }

    /// 在阻塞线程中执行数据库操作，保留调用方的 span 上下文
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let parent_span = tracing::Span::current();

        task::spawn_blocking(move || {
            parent_span.in_scope(|| {
                let mut conn = pool
                    .get()
                    .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;
                op(&mut conn)
            })
        })
        .await
        .map_err(|join_error| AppError::DatabaseError(format!("数据库任务 panic: {:?}", join_error)))?
    }

    fn parse_date(raw: &str) -> Result<NaiveDate> {
        Ok(NaiveDate::parse_from_str(raw, DATE_FORMAT)?)
    }

    fn fiat_from_raw(raw: FiatRow) -> Result<FiatRate> {
        let (date, code, name, nominal, value, previous) = raw;
        Ok(FiatRate {
            date: Self::parse_date(&date)?,
            code,
            name,
            nominal,
            value,
            previous,
        })
    }
}

#[async_trait]
impl RateCache for Database {
    #[instrument(target = "db", skip_all, fields(row_count = rows.len()), err)]
    async fn upsert_fiat_rates(&self, rows: &[FiatRate]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = rows.to_vec();

        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO fiat_rates (date, code, name, nominal, value, previous)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(date, code) DO UPDATE SET
                        name = excluded.name,
                        nominal = excluded.nominal,
                        value = excluded.value,
                        previous = excluded.previous",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.date.format(DATE_FORMAT).to_string(),
                        row.code.to_uppercase(),
                        row.name,
                        row.nominal,
                        row.value,
                        row.previous,
                    ])?;
                }
            }
            tx.commit().map_err(|e| {
                error!(target: "db", "提交法币汇率事务失败: {}", e);
                AppError::DatabaseError(format!("提交事务失败: {}", e))
            })?;

            debug!(target: "db", decision = "fiat_upsert_complete", row_count = rows.len(), "法币汇率写入完成");
            Ok(rows.len())
        })
        .await
    }

    #[instrument(target = "db", skip_all, fields(series = %series, row_count = rows.len()), err)]
    async fn upsert_crypto_rates(&self, series: RateSeries, rows: &[CryptoCandle]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = rows.to_vec();
        let series = series.as_str();

        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO crypto_rates (symbol, series, timestamp, open, high, low, close, volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(symbol, series, timestamp) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        volume = excluded.volume",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.symbol,
                        series,
                        row.timestamp,
                        row.open,
                        row.high,
                        row.low,
                        row.close,
                        row.volume,
                    ])?;
                }
            }
            tx.commit().map_err(|e| {
                error!(target: "db", "提交K线事务失败: {}", e);
                AppError::DatabaseError(format!("提交事务失败: {}", e))
            })?;

            debug!(target: "db", decision = "crypto_upsert_complete", row_count = rows.len(), "K线写入完成");
            Ok(rows.len())
        })
        .await
    }

    async fn query_fiat_by_date(&self, date: NaiveDate) -> Result<Vec<FiatRate>> {
        let key = date.format(DATE_FORMAT).to_string();

        let raw = self
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT date, code, name, nominal, value, previous
                     FROM fiat_rates WHERE date = ?1 ORDER BY code",
                )?;
                let rows = stmt.query_map([key], |row| -> rusqlite::Result<FiatRow> {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                })?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok(result)
            })
            .await?;

        raw.into_iter().map(Self::fiat_from_raw).collect()
    }

    async fn query_fiat_by_code_and_date(&self, code: &str, date: NaiveDate) -> Result<FiatRate> {
        let key = date.format(DATE_FORMAT).to_string();
        let code = code.to_uppercase();
        let code_for_query = code.clone();

        let raw = self
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT date, code, name, nominal, value, previous
                         FROM fiat_rates WHERE date = ?1 AND code = ?2",
                        params![key, code_for_query],
                        |row| -> rusqlite::Result<FiatRow> {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        match raw {
            Some(raw) => Self::fiat_from_raw(raw),
            None => Err(AppError::NotFound(format!("fiat rate {} on {}", code, date))),
        }
    }

    async fn query_crypto_by_range(
        &self,
        symbol: &str,
        series: RateSeries,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<CryptoCandle>> {
        let symbol = symbol.to_string();
        let series = series.as_str();

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, timestamp, open, high, low, close, volume
                 FROM crypto_rates
                 WHERE symbol = ?1 AND series = ?2 AND timestamp >= ?3 AND timestamp <= ?4
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![symbol, series, start_ms, end_ms], |row| {
                Ok(CryptoCandle {
                    symbol: row.get(0)?,
                    timestamp: row.get(1)?,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                })
            })?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
        .await
    }

    async fn list_available_symbols(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT symbol FROM crypto_rates ORDER BY symbol")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(result)
        })
        .await
    }

    async fn list_available_dates(&self) -> Result<Vec<NaiveDate>> {
        let raw = self
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT date FROM fiat_rates ORDER BY date")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok(result)
            })
            .await?;

        raw.iter().map(|d| Self::parse_date(d)).collect()
    }

    async fn record_fiat_substitution(&self, requested: NaiveDate, actual: NaiveDate) -> Result<()> {
        let requested_key = requested.format(DATE_FORMAT).to_string();
        let actual_key = actual.format(DATE_FORMAT).to_string();

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO fiat_substitutions (requested_date, actual_date) VALUES (?1, ?2)
                 ON CONFLICT(requested_date) DO UPDATE SET actual_date = excluded.actual_date",
                params![requested_key, actual_key],
            )?;
            debug!(target: "db", decision = "substitution_recorded", %requested, %actual, "记录法币汇率替代");
            Ok(())
        })
        .await
    }

    async fn query_fiat_substitution(&self, requested: NaiveDate) -> Result<Option<NaiveDate>> {
        let key = requested.format(DATE_FORMAT).to_string();

        let raw = self
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT actual_date FROM fiat_substitutions WHERE requested_date = ?1",
                        [key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        raw.as_deref().map(Self::parse_date).transpose()
    }
}
