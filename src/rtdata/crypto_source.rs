use crate::rtcommon::config::CryptoSourceConfig;
use crate::rtcommon::models::{format_ms, CryptoCandle, Interval};
use crate::rtcommon::{retry_with_backoff, AppError, Result, RetryPolicy};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// 加密货币行情源
#[async_trait]
pub trait CryptoRateSource: Send + Sync {
    /// 获取 [start_ms, end_ms] 内的K线，按时间升序
    async fn fetch_candles(&self, pair: &str, interval: Interval, start_ms: i64, end_ms: i64) -> Result<Vec<CryptoCandle>>;

    /// 基于24小时行情快照的当前价格，timestamp 为当前时间
    async fn current_price(&self, pair: &str) -> Result<CryptoCandle>;
}

/// 24小时行情快照
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    open_price: String,
    high_price: String,
    low_price: String,
    last_price: String,
    volume: String,
}

/// 币安现货API客户端
#[derive(Clone, Debug)]
pub struct BinanceCryptoSource {
    api_url: String,
    client: Client,
    retry: RetryPolicy,
    page_limit: usize,
}

impl BinanceCryptoSource {
    pub fn new(config: &CryptoSourceConfig) -> Result<Self> {
        let client_builder = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

        let client = match &config.proxy_url {
            Some(proxy_url) => match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => client_builder
                    .proxy(proxy)
                    .build()
                    .map_err(|e| AppError::ConfigError(format!("创建带代理的HTTP客户端失败: {}", e)))?,
                Err(e) => {
                    warn!(target: "api", "设置代理失败，将尝试直接连接: {} - {}", proxy_url, e);
                    client_builder
                        .build()
                        .map_err(|e| AppError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?
                }
            },
            None => client_builder
                .build()
                .map_err(|e| AppError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?,
        };

        info!(target: "api", "初始化币安API客户端，端点: {}", config.api_url);

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::new(config.max_attempts, Duration::from_millis(config.retry_base_delay_ms)),
            page_limit: config.page_limit,
        })
    }

    /// 请求单页K线（不重试）
    async fn fetch_page(&self, pair: &str, interval: Interval, start_ms: i64, end_ms: i64) -> Result<Vec<CryptoCandle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.api_url, pair, interval, start_ms, end_ms, self.page_limit
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            error!(target: "api", "{}/{}: K线请求失败: URL={}, 错误: {}", pair, interval, url, e);
            AppError::from(e)
        })?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &text, pair));
        }

        let raw_klines: Vec<Vec<Value>> = serde_json::from_str(&text).map_err(|e| {
            let preview: String = text.chars().take(200).collect();
            error!(target: "api", "{}/{}: 解析K线JSON失败: {}, 响应前200个字符: {}", pair, interval, e, preview);
            AppError::JsonError(e)
        })?;

        let candles: Vec<CryptoCandle> = raw_klines.iter().filter_map(|raw| parse_kline_row(pair, raw)).collect();
        if candles.len() != raw_klines.len() {
            warn!(
                target: "api",
                symbol = %pair,
                parsed_count = candles.len(),
                raw_count = raw_klines.len(),
                "部分K线数据解析失败"
            );
        }

        Ok(candles)
    }

    async fn fetch_ticker(&self, pair: &str) -> Result<Ticker24h> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.api_url, pair);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &text, pair));
        }

        Ok(serde_json::from_str::<Ticker24h>(&text)?)
    }
}

#[async_trait]
impl CryptoRateSource for BinanceCryptoSource {
    #[instrument(target = "api", skip(self), err)]
    async fn fetch_candles(&self, pair: &str, interval: Interval, start_ms: i64, end_ms: i64) -> Result<Vec<CryptoCandle>> {
        if start_ms > end_ms {
            return Err(AppError::ValidationError(format!(
                "start {} is after end {}",
                format_ms(start_ms),
                format_ms(end_ms)
            )));
        }
        let pair = pair.to_uppercase();

        let candles = collect_pages(start_ms, end_ms, self.page_limit, |cursor| {
            let pair = pair.as_str();
            async move {
                retry_with_backoff(&self.retry, "binance_klines", || self.fetch_page(pair, interval, cursor, end_ms)).await
            }
        })
        .await?;

        debug!(target: "api", decision = "klines_fetched", symbol = %pair, kline_count = candles.len(), "K线下载完成");
        Ok(candles)
    }

    #[instrument(target = "api", skip(self), err)]
    async fn current_price(&self, pair: &str) -> Result<CryptoCandle> {
        let pair = pair.to_uppercase();
        let ticker = retry_with_backoff(&self.retry, "binance_ticker", || self.fetch_ticker(&pair)).await?;
        ticker_to_candle(&ticker, Utc::now().timestamp_millis())
    }
}

/// 把非 2xx 响应归类为可重试或不可重试的错误
pub fn classify_status(status: StatusCode, body: &str, pair: &str) -> AppError {
    if status == StatusCode::BAD_REQUEST && (body.contains("-1121") || body.contains("Invalid symbol")) {
        return AppError::SymbolNotFound(pair.to_string());
    }

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return AppError::ApiError(format!("{} - {}", status, body));
    }

    AppError::ValidationError(format!("upstream rejected request for {}: {} - {}", pair, status, body))
}

/// 解析币安K线数组: [openTime, open, high, low, close, volume, closeTime, ...]
pub fn parse_kline_row(pair: &str, raw: &[Value]) -> Option<CryptoCandle> {
    if raw.len() < 6 {
        return None;
    }

    let number = |v: &Value| -> Option<f64> {
        match v {
            Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        }
    };

    Some(CryptoCandle {
        symbol: pair.to_string(),
        timestamp: raw[0].as_i64()?,
        open: number(&raw[1])?,
        high: number(&raw[2])?,
        low: number(&raw[3])?,
        close: number(&raw[4])?,
        volume: number(&raw[5])?,
    })
}

fn ticker_to_candle(ticker: &Ticker24h, now_ms: i64) -> Result<CryptoCandle> {
    let parse = |field: &str, raw: &str| -> Result<f64> {
        raw.parse::<f64>()
            .map_err(|_| AppError::ApiError(format!("ticker {} has invalid {}: {}", ticker.symbol, field, raw)))
    };

    Ok(CryptoCandle {
        symbol: ticker.symbol.clone(),
        timestamp: now_ms,
        open: parse("openPrice", &ticker.open_price)?,
        high: parse("highPrice", &ticker.high_price)?,
        low: parse("lowPrice", &ticker.low_price)?,
        close: parse("lastPrice", &ticker.last_price)?,
        volume: parse("volume", &ticker.volume)?,
    })
}

/// 分页拉取 [start_ms, end_ms]
///
/// 每页从上一页最后一根K线之后继续；某页不足 page_limit 或已到达 end_ms 时结束。
/// 结果按时间升序且时间戳唯一。
pub async fn collect_pages<F, Fut>(start_ms: i64, end_ms: i64, page_limit: usize, mut fetch_page: F) -> Result<Vec<CryptoCandle>>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<Vec<CryptoCandle>>>,
{
    let mut candles: Vec<CryptoCandle> = Vec::new();
    let mut cursor = start_ms;
    let mut pages = 0usize;

    loop {
        let mut page = fetch_page(cursor).await?;
        pages += 1;
        page.sort_by_key(|c| c.timestamp);

        let page_len = page.len();
        let last_ts = page.last().map(|c| c.timestamp);

        for candle in page {
            if candle.timestamp < start_ms || candle.timestamp > end_ms {
                continue;
            }
            if candles.last().map_or(true, |last| candle.timestamp > last.timestamp) {
                candles.push(candle);
            }
        }

        match last_ts {
            Some(ts) if page_len >= page_limit && ts < end_ms && ts >= cursor => {
                cursor = ts + 1;
            }
            _ => break,
        }
    }

    if pages > 1 {
        debug!(target: "api", decision = "paginated", pages, kline_count = candles.len(), "分页拉取完成");
    }

    Ok(candles)
}
