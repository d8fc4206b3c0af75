// 汇率查询工具 - 经由缓存合成汇率并以 JSON 输出
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rate_server::rtcommon::logging_setup::init_logging;
use rate_server::rtcommon::models::{FiatRate, Interval};
use rate_server::rtcommon::{AppConfig, Database, RateCache};
use rate_server::rtdata::{BinanceCryptoSource, CbrFiatSource, QueryParams, QueryWindow, RateSynthesizer};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query synthesized crypto to fiat rates.", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/rate_server.toml")]
    config: String,

    #[command(subcommand)]
    command: QueryCommand,
}

#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// Rate at a single instant (defaults to now).
    At {
        #[arg(long, default_value = "BTC")]
        crypto: String,
        #[arg(long, default_value = "RUB")]
        fiat: String,
        /// Unix timestamp in milliseconds.
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Rate series over a lookback window or a date range.
    Range {
        #[arg(long, default_value = "BTC")]
        crypto: String,
        #[arg(long, default_value = "RUB")]
        fiat: String,
        #[arg(long)]
        days: Option<u32>,
        /// YYYY-MM-DD
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// YYYY-MM-DD
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Override the interval picked from the window length (e.g. 1h, 1d).
        #[arg(long)]
        interval: Option<Interval>,
    },
    /// Fiat table for a day (defaults to the latest one).
    Fiat {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Only print this currency code.
        #[arg(long)]
        code: Option<String>,
    },
    /// List symbols and fiat dates present in the cache.
    Cached,
}

#[derive(Serialize)]
struct CachedSummary {
    symbols: Vec<String>,
    fiat_dates: Vec<NaiveDate>,
}

#[derive(Serialize)]
struct FiatDayReport {
    date: NaiveDate,
    /// 请求日期没有归档时，表示被替代的请求日期
    substituted_from: Option<NaiveDate>,
    rates: Vec<FiatRate>,
}

#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    error: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if Path::new(&args.config).exists() {
        AppConfig::from_file(&args.config).with_context(|| format!("加载配置失败: {}", args.config))?
    } else {
        AppConfig::default()
    };
    config.validate().context("配置校验失败")?;

    let mut logging = config.logging.clone();
    // 标准输出只留给 JSON 结果
    logging.enable_console_output = false;
    let log_guard = init_logging(&logging)?;

    if let Err(e) = run_query(&config, args.command).await {
        let body = ErrorBody {
            status: e.http_status(),
            error: e.public_message(),
        };
        tracing::error!(error.summary = e.get_error_type_summary(), error.details = %e, "查询失败");
        println!("{}", serde_json::to_string_pretty(&body)?);
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_query(config: &AppConfig, command: QueryCommand) -> rate_server::Result<()> {
    if let Some(parent) = Path::new(&config.database.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::with_config(&config.database.database_path, &config.database)?;
    let synthesizer = RateSynthesizer::new(
        Arc::new(BinanceCryptoSource::new(&config.crypto_source)?),
        Arc::new(CbrFiatSource::new(&config.fiat_source)?),
        config,
    );

    match command {
        QueryCommand::At { crypto, fiat, timestamp } => {
            let ts = timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
            let rate = synthesizer.synthesize_at(&crypto, &fiat, ts).await?;
            print_json(&rate)
        }
        QueryCommand::Range {
            crypto,
            fiat,
            days,
            start_date,
            end_date,
            interval,
        } => {
            let params = QueryParams { days, start_date, end_date };
            let window = QueryWindow::resolve(&params, Utc::now(), config.synthesis.max_lookback_days)?;
            let interval = interval.unwrap_or(window.interval);
            let rates = synthesizer
                .cached_range(&db, &crypto, &fiat, interval, window.start_ms, window.end_ms)
                .await?;
            print_json(&rates)
        }
        QueryCommand::Fiat { date, code: Some(code) } => {
            let rate = synthesizer.cached_fiat_rate(&db, &code, date).await?;
            print_json(&rate)
        }
        QueryCommand::Fiat { date, code: None } => {
            let table = synthesizer.cached_fiat_day(&db, date).await?;
            let report = FiatDayReport {
                date: table.date,
                substituted_from: table.substituted_from,
                rates: table.to_rows(),
            };
            print_json(&report)
        }
        QueryCommand::Cached => {
            let summary = CachedSummary {
                symbols: db.list_available_symbols().await?,
                fiat_dates: db.list_available_dates().await?,
            };
            print_json(&summary)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> rate_server::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
