use crate::rtcommon::{AppError, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// 某一天某一币种的法币汇率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiatRate {
    pub date: NaiveDate,
    pub code: String,
    pub name: String,
    /// 报价单位数（例如 JPY 按 100 单位报价）
    pub nominal: i64,
    /// nominal 单位对应的本币价值
    pub value: f64,
    /// 前一日的 value
    pub previous: f64,
}

impl FiatRate {
    /// 单位外币对应的本币价值
    pub fn unit_value(&self) -> f64 {
        if self.nominal == 0 {
            self.value
        } else {
            self.value / self.nominal as f64
        }
    }
}

/// 一天的法币汇率表
#[derive(Debug, Clone, PartialEq)]
pub struct FiatTable {
    /// 数据实际所属日期
    pub date: NaiveDate,
    /// 请求的归档日期不可用、被最新数据替代时，记录原请求日期
    pub substituted_from: Option<NaiveDate>,
    pub rates: HashMap<String, FiatRate>,
}

impl FiatTable {
    /// 由缓存行重建，缓存中只保存真实发布日期的数据
    pub fn from_rows(date: NaiveDate, rows: Vec<FiatRate>) -> Self {
        let rates = rows.into_iter().map(|r| (r.code.to_uppercase(), r)).collect();
        Self {
            date,
            substituted_from: None,
            rates,
        }
    }

    pub fn get(&self, code: &str) -> Option<&FiatRate> {
        self.rates.get(&code.to_uppercase())
    }

    pub fn is_substituted(&self) -> bool {
        self.substituted_from.is_some()
    }

    /// 按币种排序后的行，便于写入缓存
    pub fn to_rows(&self) -> Vec<FiatRate> {
        let mut rows: Vec<FiatRate> = self.rates.values().cloned().collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        rows
    }
}

/// OHLCV K线，也用于表示合成后的汇率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoCandle {
    pub symbol: String,
    /// K线开盘时间（毫秒）
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 合成汇率，symbol 形如 "BTC/RUB"
pub type SynthesizedRate = CryptoCandle;

impl CryptoCandle {
    /// low ≤ open,close ≤ high
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }

    /// 与另一条K线逐项相乘，成交量保留自身
    pub fn multiply(&self, factor: &CryptoCandle, symbol: &str) -> SynthesizedRate {
        CryptoCandle {
            symbol: symbol.to_string(),
            timestamp: self.timestamp,
            open: self.open * factor.open,
            high: self.high * factor.high,
            low: self.low * factor.low,
            close: self.close * factor.close,
            volume: self.volume,
        }
    }

    /// 乘以一个标量，成交量保留自身
    pub fn scale(&self, scalar: f64, symbol: &str) -> SynthesizedRate {
        CryptoCandle {
            symbol: symbol.to_string(),
            timestamp: self.timestamp,
            open: self.open * scalar,
            high: self.high * scalar,
            low: self.low * scalar,
            close: self.close * scalar,
            volume: self.volume,
        }
    }

    pub fn day(&self) -> NaiveDate {
        day_of_ms(self.timestamp)
    }
}

/// 合成汇率的 symbol，例如 ("btc", "rub") -> "BTC/RUB"
pub fn synthetic_symbol(crypto: &str, fiat: &str) -> String {
    format!("{}/{}", crypto.to_uppercase(), fiat.to_uppercase())
}

/// 毫秒时间戳所属的 UTC 日期
pub fn day_of_ms(timestamp_ms: i64) -> NaiveDate {
    match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt.date_naive(),
        None => NaiveDate::default(),
    }
}

/// UTC 日期零点的毫秒时间戳
pub fn day_start_ms(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

pub fn format_ms(timestamp_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => timestamp_ms.to_string(),
    }
}

/// 币安支持的K线周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Interval {
    pub const ALL: [Interval; 9] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::FourHours,
        Interval::OneDay,
        Interval::OneWeek,
        Interval::OneMonth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
            Interval::OneWeek => "1w",
            Interval::OneMonth => "1M",
        }
    }

    /// 周期毫秒数，月线按 30 天估算，仅用于分页与覆盖判断
    pub fn to_milliseconds(&self) -> i64 {
        match self {
            Interval::OneMinute => MINUTE_MS,
            Interval::FiveMinutes => 5 * MINUTE_MS,
            Interval::FifteenMinutes => 15 * MINUTE_MS,
            Interval::ThirtyMinutes => 30 * MINUTE_MS,
            Interval::OneHour => HOUR_MS,
            Interval::FourHours => 4 * HOUR_MS,
            Interval::OneDay => DAY_MS,
            Interval::OneWeek => 7 * DAY_MS,
            Interval::OneMonth => 30 * DAY_MS,
        }
    }

    /// 根据回看天数选择K线周期，在数据量与分辨率之间折中
    pub fn for_lookback_days(days: u32) -> Interval {
        match days {
            0..=1 => Interval::OneMinute,
            2..=7 => Interval::FifteenMinutes,
            8..=30 => Interval::OneHour,
            31..=90 => Interval::FourHours,
            _ => Interval::OneDay,
        }
    }
}

/// 缓存中一行汇率所属的序列
///
/// 同一 symbol 的不同周期 K线与实时快照互不覆盖，覆盖判断只看同一序列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateSeries {
    Candle(Interval),
    /// ticker 快照与当前合成汇率
    Spot,
}

impl RateSeries {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateSeries::Candle(interval) => interval.as_str(),
            RateSeries::Spot => "spot",
        }
    }
}

impl fmt::Display for RateSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        // "1M" 与 "1m" 区分大小写
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| AppError::ValidationError(format!("unsupported interval: {}", s)))
    }
}
