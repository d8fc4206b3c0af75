//! 汇率合成：CRYPTO -> 稳定币 -> 法币
//!
//! 主路径把加密腿 (如 BTCUSDT) 与法币腿 (如 USDTRUB) 的K线逐项相乘。
//! 法币腿不可用时，退回到法币源的每日汇率作为标量。

use crate::rtcommon::config::constants::POINT_WINDOW_MS;
use crate::rtcommon::config::{AppConfig, FiatSourceConfig, SynthesisConfig};
use crate::rtcommon::models::{
    day_of_ms, format_ms, synthetic_symbol, FiatRate, FiatTable, Interval, RateSeries, SynthesizedRate,
};
use crate::rtcommon::{AppError, RateCache, Result};
use crate::rtdata::alignment::{align_by_day, align_by_timestamp, cache_covers, days_between, nearest};
use crate::rtdata::crypto_source::CryptoRateSource;
use crate::rtdata::fiat_source::FiatRateSource;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct RateSynthesizer {
    crypto: Arc<dyn CryptoRateSource>,
    fiat: Arc<dyn FiatRateSource>,
    synthesis: SynthesisConfig,
    /// 法币源的计价货币（表中不出现）
    local_currency: String,
    /// 法币源中与稳定币等价的货币
    reference_code: String,
}

impl RateSynthesizer {
    pub fn new(crypto: Arc<dyn CryptoRateSource>, fiat: Arc<dyn FiatRateSource>, config: &AppConfig) -> Self {
        Self::with_settings(crypto, fiat, config.synthesis.clone(), &config.fiat_source)
    }

    pub fn with_settings(
        crypto: Arc<dyn CryptoRateSource>,
        fiat: Arc<dyn FiatRateSource>,
        synthesis: SynthesisConfig,
        fiat_config: &FiatSourceConfig,
    ) -> Self {
        Self {
            crypto,
            fiat,
            synthesis,
            local_currency: fiat_config.local_currency.to_uppercase(),
            reference_code: fiat_config.reference_code.to_uppercase(),
        }
    }

    pub fn crypto_source(&self) -> &Arc<dyn CryptoRateSource> {
        &self.crypto
    }

    fn legs(&self, crypto_symbol: &str, fiat_code: &str) -> (String, String) {
        let stable = self.synthesis.reference_stable.to_uppercase();
        (
            format!("{}{}", crypto_symbol.to_uppercase(), stable),
            format!("{}{}", stable, fiat_code.to_uppercase()),
        )
    }

    /// 某天 1 单位稳定币折合多少目标法币，返回 (数据实际日期, 标量)
    async fn reference_scalar(&self, fiat_code: &str, date: NaiveDate) -> Result<(NaiveDate, f64)> {
        let fiat_code = fiat_code.to_uppercase();
        if fiat_code == self.reference_code {
            return Ok((date, 1.0));
        }

        let table = self.fiat.fetch_day(Some(date)).await?;
        let reference = Self::table_rate(&table, &self.reference_code)?;
        if fiat_code == self.local_currency {
            return Ok((table.date, reference.unit_value()));
        }

        // 交叉汇率：reference/local ÷ fiat/local，两者取自同一张表
        let target_unit = Self::table_rate(&table, &fiat_code)?.unit_value();
        if target_unit <= 0.0 {
            return Err(AppError::NoFallbackData(format!("{} has non-positive rate on {}", fiat_code, table.date)));
        }
        Ok((table.date, reference.unit_value() / target_unit))
    }

    fn table_rate<'a>(table: &'a FiatTable, code: &str) -> Result<&'a FiatRate> {
        table
            .get(code)
            .ok_or_else(|| AppError::CurrencyNotFound(format!("{} on {}", code, table.date)))
    }

    /// 合成某一时刻的汇率
    #[instrument(skip(self), err)]
    pub async fn synthesize_at(&self, crypto_symbol: &str, fiat_code: &str, timestamp_ms: i64) -> Result<SynthesizedRate> {
        let symbol = synthetic_symbol(crypto_symbol, fiat_code);
        let (crypto_pair, fiat_pair) = self.legs(crypto_symbol, fiat_code);
        let start = timestamp_ms - POINT_WINDOW_MS;
        let end = timestamp_ms + POINT_WINDOW_MS;

        let (crypto_leg, fiat_leg) = tokio::join!(
            self.crypto.fetch_candles(&crypto_pair, Interval::OneHour, start, end),
            self.crypto.fetch_candles(&fiat_pair, Interval::OneHour, start, end),
        );

        let crypto_leg = crypto_leg?;
        let crypto_candle = nearest(&crypto_leg, timestamp_ms).ok_or_else(|| {
            AppError::NotFound(format!("no {} candles near {}", crypto_pair, format_ms(timestamp_ms)))
        })?;

        match fiat_leg {
            Ok(candles) if !candles.is_empty() => {
                if let Some(fiat_candle) = nearest(&candles, timestamp_ms) {
                    debug!(decision = "direct_multiply", %symbol, "使用法币腿K线合成");
                    return Ok(crypto_candle.multiply(fiat_candle, &symbol));
                }
            }
            Ok(_) => {
                debug!(decision = "fiat_leg_empty", %fiat_pair, "法币腿无数据，使用日汇率");
            }
            Err(e) => {
                warn!(
                    decision = "fiat_leg_failed",
                    %fiat_pair,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "法币腿获取失败，使用日汇率"
                );
            }
        }

        let (_, scalar) = self.reference_scalar(fiat_code, day_of_ms(timestamp_ms)).await?;
        Ok(crypto_candle.scale(scalar, &symbol))
    }

    /// 合成 [start_ms, end_ms] 内的汇率序列，按时间升序
    #[instrument(skip(self), err)]
    pub async fn synthesize_range(
        &self,
        crypto_symbol: &str,
        fiat_code: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SynthesizedRate>> {
        if start_ms > end_ms {
            return Err(AppError::ValidationError(format!(
                "start {} is after end {}",
                format_ms(start_ms),
                format_ms(end_ms)
            )));
        }

        let symbol = synthetic_symbol(crypto_symbol, fiat_code);
        let (crypto_pair, fiat_pair) = self.legs(crypto_symbol, fiat_code);

        let (crypto_leg, fiat_leg) = tokio::join!(
            self.crypto.fetch_candles(&crypto_pair, interval, start_ms, end_ms),
            self.crypto.fetch_candles(&fiat_pair, interval, start_ms, end_ms),
        );

        let crypto_leg = crypto_leg?;
        if crypto_leg.is_empty() {
            debug!(decision = "crypto_leg_empty", %crypto_pair, "加密腿无数据");
            return Ok(Vec::new());
        }

        match fiat_leg {
            Ok(fiat_candles) if !fiat_candles.is_empty() => {
                let tolerance_ms = self.synthesis.intraday_tolerance_secs * 1000;
                let rates = align_by_timestamp(&crypto_leg, &fiat_candles, tolerance_ms, &symbol);
                info!(decision = "direct_multiply", %symbol, rate_count = rates.len(), "按时间戳合成完成");
                return Ok(rates);
            }
            Ok(_) => {
                debug!(decision = "fiat_leg_empty", %fiat_pair, "法币腿无数据，使用日汇率");
            }
            Err(e) => {
                warn!(
                    decision = "fiat_leg_failed",
                    %fiat_pair,
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "法币腿获取失败，使用日汇率"
                );
            }
        }

        let scalars = self.day_scalars(fiat_code, start_ms, end_ms).await;
        if scalars.is_empty() {
            return Err(AppError::NoFallbackData(format!(
                "{} between {} and {}",
                symbol,
                format_ms(start_ms),
                format_ms(end_ms)
            )));
        }

        let rates = align_by_day(&crypto_leg, &scalars, self.synthesis.day_tolerance, &symbol);
        info!(decision = "daily_fallback", %symbol, rate_count = rates.len(), fiat_days = scalars.len(), "按日汇率合成完成");
        Ok(rates)
    }

    /// 逐日获取标量，并发数受限；按数据实际日期入表
    async fn day_scalars(&self, fiat_code: &str, start_ms: i64, end_ms: i64) -> BTreeMap<NaiveDate, f64> {
        let concurrency = self.synthesis.fallback_concurrency.max(1);

        let results: Vec<(NaiveDate, Result<(NaiveDate, f64)>)> = stream::iter(days_between(start_ms, end_ms))
            .map(|day| async move { (day, self.reference_scalar(fiat_code, day).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut scalars = BTreeMap::new();
        for (day, result) in results {
            match result {
                Ok((actual, scalar)) => {
                    scalars.entry(actual).or_insert(scalar);
                }
                Err(e) => {
                    debug!(
                        decision = "fiat_day_missing",
                        day = %day,
                        error.summary = e.get_error_type_summary(),
                        "当天没有可用的法币汇率"
                    );
                }
            }
        }
        scalars
    }

    /// 先查缓存，覆盖不足时重新合成并写回
    ///
    /// 缓存按 (symbol, 周期) 分序列，不同周期的查询互不影响。写缓存失败会直接返回错误。
    pub async fn cached_range(
        &self,
        cache: &dyn RateCache,
        crypto_symbol: &str,
        fiat_code: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SynthesizedRate>> {
        let symbol = synthetic_symbol(crypto_symbol, fiat_code);
        let series = RateSeries::Candle(interval);
        let cached = cache.query_crypto_by_range(&symbol, series, start_ms, end_ms).await?;
        if cache_covers(&cached, start_ms, end_ms, interval.to_milliseconds()) {
            debug!(target: "db", decision = "cache_hit", %symbol, %series, row_count = cached.len(), "缓存命中");
            return Ok(cached);
        }

        let rates = self.synthesize_range(crypto_symbol, fiat_code, interval, start_ms, end_ms).await?;
        if !rates.is_empty() {
            let written = cache.upsert_crypto_rates(series, &rates).await?;
            debug!(target: "db", decision = "cache_fill", %symbol, %series, written, "合成结果已写入缓存");
        }
        Ok(rates)
    }

    /// 某天的法币汇率表，缓存优先；None 表示最新一期并总是回源
    ///
    /// 被替代的表保留 `substituted_from`。请求日期早于替代表日期时记录替代关系，
    /// 之后同一日期直接由缓存返回。
    pub async fn cached_fiat_day(&self, cache: &dyn RateCache, date: Option<NaiveDate>) -> Result<FiatTable> {
        if let Some(day) = date {
            let cached = cache.query_fiat_by_date(day).await?;
            if !cached.is_empty() {
                debug!(target: "db", decision = "cache_hit", date = %day, row_count = cached.len(), "法币汇率缓存命中");
                return Ok(FiatTable::from_rows(day, cached));
            }

            if let Some(actual) = cache.query_fiat_substitution(day).await? {
                let rows = cache.query_fiat_by_date(actual).await?;
                if !rows.is_empty() {
                    debug!(target: "db", decision = "substitution_hit", date = %day, %actual, "替代汇率缓存命中");
                    let mut table = FiatTable::from_rows(actual, rows);
                    table.substituted_from = Some(day);
                    return Ok(table);
                }
            }
        }

        let table = self.fiat.fetch_day(date).await?;
        cache.upsert_fiat_rates(&table.to_rows()).await?;
        if let Some(requested) = table.substituted_from {
            // 未来日期的归档之后可能出现，只记录过去日期
            if requested < table.date {
                cache.record_fiat_substitution(requested, table.date).await?;
            } else {
                debug!(target: "db", decision = "substitution_not_recorded", %requested, actual = %table.date, "归档可能稍后发布");
            }
        }
        Ok(table)
    }

    /// 某天某币种的法币汇率，缓存优先
    ///
    /// 只有缓存缺行时才回源，其他缓存错误直接返回。
    pub async fn cached_fiat_rate(&self, cache: &dyn RateCache, code: &str, date: Option<NaiveDate>) -> Result<FiatRate> {
        if let Some(day) = date {
            match cache.query_fiat_by_code_and_date(code, day).await {
                Ok(rate) => return Ok(rate),
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let table = self.cached_fiat_day(cache, date).await?;
        Self::table_rate(&table, &code.to_uppercase()).cloned()
    }

    /// 当前时刻的合成汇率
    pub async fn current_rate(&self, crypto_symbol: &str, fiat_code: &str) -> Result<SynthesizedRate> {
        self.synthesize_at(crypto_symbol, fiat_code, chrono::Utc::now().timestamp_millis()).await
    }
}

