//! 两条腿的时间对齐
//!
//! 只做纯计算，不访问网络和缓存。

use crate::rtcommon::models::{CryptoCandle, SynthesizedRate, DAY_MS};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// 与 target 时间差最小的K线，时间差相同时取靠前的一根
pub fn nearest(candles: &[CryptoCandle], target_ms: i64) -> Option<&CryptoCandle> {
    candles.iter().min_by_key(|c| (c.timestamp - target_ms).abs())
}

/// 按时间戳对齐加密腿与法币腿
///
/// 先精确匹配时间戳，否则取容差内最近的法币K线；两者都没有的加密K线被丢弃。
pub fn align_by_timestamp(
    crypto_leg: &[CryptoCandle],
    fiat_leg: &[CryptoCandle],
    tolerance_ms: i64,
    symbol: &str,
) -> Vec<SynthesizedRate> {
    let mut exact: HashMap<i64, &CryptoCandle> = HashMap::with_capacity(fiat_leg.len());
    for candle in fiat_leg {
        exact.entry(candle.timestamp).or_insert(candle);
    }

    let mut dropped = 0usize;
    let rates: Vec<SynthesizedRate> = crypto_leg
        .iter()
        .filter_map(|crypto| {
            let matched = exact.get(&crypto.timestamp).copied().or_else(|| {
                nearest(fiat_leg, crypto.timestamp).filter(|f| (f.timestamp - crypto.timestamp).abs() <= tolerance_ms)
            });
            match matched {
                Some(fiat) => Some(crypto.multiply(fiat, symbol)),
                None => {
                    dropped += 1;
                    None
                }
            }
        })
        .collect();

    if dropped > 0 {
        debug!(decision = "dropped_unaligned", symbol, dropped, kept = rates.len(), "部分K线无法对齐，已丢弃");
    }
    rates
}

/// 日期容差内最近的标量，距离相同时取较早的日期
pub fn scalar_for_day(scalars: &BTreeMap<NaiveDate, f64>, day: NaiveDate, tolerance_days: i64) -> Option<f64> {
    if let Some(scalar) = scalars.get(&day) {
        return Some(*scalar);
    }
    scalars
        .iter()
        .min_by_key(|(d, _)| (**d - day).num_days().abs())
        .filter(|(d, _)| (**d - day).num_days().abs() <= tolerance_days)
        .map(|(_, s)| *s)
}

/// 用每日标量缩放加密腿，容差外的K线被丢弃
pub fn align_by_day(
    crypto_leg: &[CryptoCandle],
    scalars: &BTreeMap<NaiveDate, f64>,
    tolerance_days: i64,
    symbol: &str,
) -> Vec<SynthesizedRate> {
    let mut dropped = 0usize;
    let rates: Vec<SynthesizedRate> = crypto_leg
        .iter()
        .filter_map(|crypto| match scalar_for_day(scalars, crypto.day(), tolerance_days) {
            Some(scalar) => Some(crypto.scale(scalar, symbol)),
            None => {
                dropped += 1;
                None
            }
        })
        .collect();

    if dropped > 0 {
        debug!(decision = "dropped_no_fiat_day", symbol, dropped, kept = rates.len(), "部分K线附近没有法币数据，已丢弃");
    }
    rates
}

/// 缓存中的行是否足以覆盖 [start_ms, end_ms]
///
/// 首尾各在一个周期以内，相邻行间隔不小于周期，行数至少达到理论值的一半。
pub fn cache_covers(rows: &[CryptoCandle], start_ms: i64, end_ms: i64, interval_ms: i64) -> bool {
    let (first, last) = match (rows.first(), rows.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return false,
    };
    if first.timestamp - start_ms > interval_ms || end_ms - last.timestamp > interval_ms {
        return false;
    }
    if rows.windows(2).any(|w| w[1].timestamp - w[0].timestamp < interval_ms) {
        return false;
    }
    let expected = ((end_ms - start_ms) / interval_ms.max(1)).max(1) as usize;
    rows.len() * 2 >= expected
}

/// [start_ms, end_ms] 覆盖的所有 UTC 日期
pub fn days_between(start_ms: i64, end_ms: i64) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut cursor = start_ms - start_ms.rem_euclid(DAY_MS);
    while cursor <= end_ms {
        days.push(crate::rtcommon::models::day_of_ms(cursor));
        cursor += DAY_MS;
    }
    days
}
