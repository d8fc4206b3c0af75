use crate::rtcommon::models::{CryptoCandle, RateSeries};
use crate::rtcommon::{AppError, RateCache, Result};
use crate::rtdata::fiat_source::FiatRateSource;
use crate::rtdata::scheduler::RefreshJob;
use crate::rtdata::synthesizer::RateSynthesizer;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

/// 每日法币汇率快照：最新一期整表写入缓存
pub struct FiatSnapshotJob {
    fiat: Arc<dyn FiatRateSource>,
    cache: Arc<dyn RateCache>,
}

impl FiatSnapshotJob {
    pub fn new(fiat: Arc<dyn FiatRateSource>, cache: Arc<dyn RateCache>) -> Self {
        Self { fiat, cache }
    }
}

#[async_trait]
impl RefreshJob for FiatSnapshotJob {
    fn name(&self) -> &str {
        "fiat_snapshot"
    }

    async fn run(&self) -> Result<usize> {
        let table = self.fiat.fetch_day(None).await?;
        let rows = table.to_rows();
        let written = self.cache.upsert_fiat_rates(&rows).await?;
        info!(target: "db", date = %table.date, written, "法币汇率快照已写入");
        Ok(written)
    }
}

/// 加密货币短周期刷新
///
/// 对每个配置的币种写入两行：交易对的24小时行情快照，以及合成的 "<CRYPTO>/<FIAT>" 当前汇率。
/// 两者都写入 `Spot` 序列，不进入按周期缓存的K线序列。
pub struct CryptoRefreshJob {
    synthesizer: Arc<RateSynthesizer>,
    cache: Arc<dyn RateCache>,
    symbols: Vec<String>,
    fiat_code: String,
    reference_stable: String,
}

impl CryptoRefreshJob {
    pub fn new(
        synthesizer: Arc<RateSynthesizer>,
        cache: Arc<dyn RateCache>,
        symbols: Vec<String>,
        fiat_code: impl Into<String>,
        reference_stable: impl Into<String>,
    ) -> Self {
        Self {
            synthesizer,
            cache,
            symbols,
            fiat_code: fiat_code.into(),
            reference_stable: reference_stable.into(),
        }
    }

    async fn refresh_symbol(&self, symbol: &str) -> Result<Vec<CryptoCandle>> {
        let pair = format!("{}{}", symbol.to_uppercase(), self.reference_stable.to_uppercase());
        let ticker = self.synthesizer.crypto_source().current_price(&pair).await?;
        let synthesized = self.synthesizer.current_rate(symbol, &self.fiat_code).await?;
        Ok(vec![ticker, synthesized])
    }
}

#[async_trait]
impl RefreshJob for CryptoRefreshJob {
    fn name(&self) -> &str {
        "crypto_refresh"
    }

    async fn run(&self) -> Result<usize> {
        let results = join_all(self.symbols.iter().map(|symbol| async move {
            (symbol, self.refresh_symbol(symbol).await)
        }))
        .await;

        let mut rows = Vec::new();
        let mut last_error: Option<AppError> = None;
        for (symbol, result) in results {
            match result {
                Ok(mut fresh) => rows.append(&mut fresh),
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "币种刷新失败，跳过"
                    );
                    last_error = Some(e);
                }
            }
        }

        if rows.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
            return Ok(0);
        }

        let written = self.cache.upsert_crypto_rates(RateSeries::Spot, &rows).await?;
        info!(target: "db", written, symbol_count = self.symbols.len(), "加密货币汇率已刷新");
        Ok(written)
    }
}
