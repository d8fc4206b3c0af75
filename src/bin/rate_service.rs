// 汇率服务主程序 - 定时刷新法币与加密货币汇率
use anyhow::{Context, Result};
use clap::Parser;
use rate_server::rtcommon::logging_setup::init_logging;
use rate_server::rtcommon::{AppConfig, Database, RateCache};
use rate_server::rtdata::{
    BinanceCryptoSource, CbrFiatSource, CryptoRateSource, CryptoRefreshJob, FiatRateSource, FiatSnapshotJob,
    RateSynthesizer, RefreshSchedule, RefreshScheduler,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/rate_server.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Crypto to fiat rate refresh service.", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Skip the warm-up refresh on startup.
    #[arg(long, default_value_t = false)]
    no_warmup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = Path::new(&args.config).exists();
    let config = if config_found {
        AppConfig::from_file(&args.config).with_context(|| format!("加载配置失败: {}", args.config))?
    } else {
        AppConfig::default()
    };
    config.validate().context("配置校验失败")?;

    // 持有 guard，直到 main 函数结束，确保文件被正确写入
    let _log_guard = init_logging(&config.logging)?;
    if !config_found {
        warn!(path = %args.config, "配置文件不存在，使用默认配置");
    }

    let result = run_app(config, !args.no_warmup).await;
    if let Err(e) = &result {
        error!(error.details = %e, "服务异常退出");
    }
    result
}

async fn run_app(config: AppConfig, warmup: bool) -> Result<()> {
    info!(db_path = %config.database.database_path, "汇率服务启动");

    if let Some(parent) = Path::new(&config.database.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::with_config(&config.database.database_path, &config.database)?;
    let cache: Arc<dyn RateCache> = Arc::new(db);

    let crypto: Arc<dyn CryptoRateSource> = Arc::new(BinanceCryptoSource::new(&config.crypto_source)?);
    let fiat: Arc<dyn FiatRateSource> = Arc::new(CbrFiatSource::new(&config.fiat_source)?);
    let synthesizer = Arc::new(RateSynthesizer::new(crypto, fiat.clone(), &config));

    let scheduler_config = &config.scheduler;
    let fiat_scheduler = RefreshScheduler::new(
        Arc::new(FiatSnapshotJob::new(fiat, cache.clone())),
        RefreshSchedule::daily(scheduler_config.fiat_hour, scheduler_config.fiat_minute),
        scheduler_config.stop_timeout(),
    );
    let crypto_scheduler = RefreshScheduler::new(
        Arc::new(CryptoRefreshJob::new(
            synthesizer,
            cache,
            scheduler_config.crypto_symbols.clone(),
            scheduler_config.crypto_fiat.clone(),
            config.synthesis.reference_stable.clone(),
        )),
        RefreshSchedule::every(
            scheduler_config.crypto_hour,
            scheduler_config.crypto_minute,
            scheduler_config.crypto_period(),
        ),
        scheduler_config.stop_timeout(),
    );

    if warmup {
        for (name, scheduler) in [("fiat", &fiat_scheduler), ("crypto", &crypto_scheduler)] {
            match scheduler.run_immediately().await {
                Ok(count) => info!(job = name, row_count = count, "预热完成"),
                Err(e) => warn!(
                    job = name,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "预热失败，继续启动"
                ),
            }
        }
    }

    fiat_scheduler.start()?;
    crypto_scheduler.start()?;
    info!("调度器已全部启动，按 Ctrl-C 退出");

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在停止");

    crypto_scheduler.stop().await?;
    fiat_scheduler.stop().await?;
    info!("汇率服务已退出");
    Ok(())
}
