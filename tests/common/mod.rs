//! 集成测试共用的内存行情源
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use rate_server::rtcommon::models::{CryptoCandle, FiatRate, FiatTable, Interval};
use rate_server::rtcommon::{AppError, Result};
use rate_server::rtdata::{CryptoRateSource, FiatRateSource};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// 2024-01-10 00:00:00 UTC
pub const T0: i64 = 1_704_844_800_000;

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

pub fn candle(symbol: &str, timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> CryptoCandle {
    CryptoCandle {
        symbol: symbol.to_string(),
        timestamp,
        open,
        high,
        low,
        close,
        volume,
    }
}

pub fn flat(symbol: &str, timestamp: i64, price: f64) -> CryptoCandle {
    candle(symbol, timestamp, price, price, price, price, 1.0)
}

#[derive(Default)]
pub struct MockCryptoSource {
    series: Mutex<HashMap<String, Vec<CryptoCandle>>>,
    /// 这些交易对按未知交易对处理
    unknown: Mutex<HashSet<String>>,
    /// 这些交易对在任意窗口中间返回一根固定价格的K线
    constant: Mutex<HashMap<String, f64>>,
    /// 这些交易对按请求周期在窗口内逐根生成固定价格的K线
    grid: Mutex<HashMap<String, f64>>,
    pub candle_calls: AtomicUsize,
    pub ticker_calls: AtomicUsize,
}

impl MockCryptoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(self, pair: &str, candles: Vec<CryptoCandle>) -> Self {
        self.series.lock().unwrap().insert(pair.to_string(), candles);
        self
    }

    pub fn with_unknown(self, pair: &str) -> Self {
        self.unknown.lock().unwrap().insert(pair.to_string());
        self
    }

    pub fn with_constant(self, pair: &str, price: f64) -> Self {
        self.constant.lock().unwrap().insert(pair.to_string(), price);
        self
    }

    pub fn with_grid(self, pair: &str, price: f64) -> Self {
        self.grid.lock().unwrap().insert(pair.to_string(), price);
        self
    }

    pub fn candle_calls(&self) -> usize {
        self.candle_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CryptoRateSource for MockCryptoSource {
    async fn fetch_candles(&self, pair: &str, interval: Interval, start_ms: i64, end_ms: i64) -> Result<Vec<CryptoCandle>> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        if start_ms > end_ms {
            return Err(AppError::ValidationError("start after end".to_string()));
        }
        if self.unknown.lock().unwrap().contains(pair) {
            return Err(AppError::SymbolNotFound(pair.to_string()));
        }
        if let Some(price) = self.constant.lock().unwrap().get(pair) {
            return Ok(vec![flat(pair, start_ms + (end_ms - start_ms) / 2, *price)]);
        }
        if let Some(price) = self.grid.lock().unwrap().get(pair) {
            let step = interval.to_milliseconds();
            let first = (start_ms + step - 1).div_euclid(step) * step;
            return Ok((0..)
                .map(|i| first + i * step)
                .take_while(|ts| *ts <= end_ms)
                .map(|ts| flat(pair, ts, *price))
                .collect());
        }

        let series = self.series.lock().unwrap();
        Ok(series
            .get(pair)
            .map(|candles| {
                candles
                    .iter()
                    .filter(|c| c.timestamp >= start_ms && c.timestamp <= end_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn current_price(&self, pair: &str) -> Result<CryptoCandle> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        match self.constant.lock().unwrap().get(pair) {
            Some(price) => Ok(flat(pair, chrono::Utc::now().timestamp_millis(), *price)),
            None => Err(AppError::SymbolNotFound(pair.to_string())),
        }
    }
}

#[derive(Default)]
pub struct MockFiatSource {
    tables: Mutex<HashMap<NaiveDate, FiatTable>>,
    /// 缺失的归档日期返回最新一期并标记替代，否则返回 NotFound
    substitute_missing: bool,
    pub day_calls: AtomicUsize,
}

impl MockFiatSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 给某天加一条汇率（nominal 为 1）
    pub fn with_rate(self, date: NaiveDate, code: &str, value: f64) -> Self {
        {
            let mut tables = self.tables.lock().unwrap();
            let table = tables.entry(date).or_insert_with(|| FiatTable {
                date,
                substituted_from: None,
                rates: HashMap::new(),
            });
            table.rates.insert(
                code.to_string(),
                FiatRate {
                    date,
                    code: code.to_string(),
                    name: code.to_string(),
                    nominal: 1,
                    value,
                    previous: value,
                },
            );
        }
        self
    }

    pub fn substituting_missing_days(mut self) -> Self {
        self.substitute_missing = true;
        self
    }

    pub fn day_calls(&self) -> usize {
        self.day_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FiatRateSource for MockFiatSource {
    async fn fetch_day(&self, date: Option<NaiveDate>) -> Result<FiatTable> {
        self.day_calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().unwrap();
        let latest = || tables.keys().max().and_then(|d| tables.get(d)).cloned();
        let table = match date {
            Some(d) => match tables.get(&d) {
                Some(table) => Some(table.clone()),
                None if self.substitute_missing => latest().map(|mut table| {
                    table.substituted_from = Some(d);
                    table
                }),
                None => None,
            },
            None => latest(),
        };
        table.ok_or_else(|| AppError::NotFound(format!("fiat table {:?}", date)))
    }
}
