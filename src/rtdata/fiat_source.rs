use crate::rtcommon::config::FiatSourceConfig;
use crate::rtcommon::models::{FiatRate, FiatTable};
use crate::rtcommon::{retry_with_backoff, AppError, Result, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// 法币日汇率源
#[async_trait]
pub trait FiatRateSource: Send + Sync {
    /// 获取某天的汇率表，None 表示最新一期
    async fn fetch_day(&self, date: Option<NaiveDate>) -> Result<FiatTable>;

    /// 获取某天某币种的汇率
    async fn fetch_one(&self, code: &str, date: Option<NaiveDate>) -> Result<FiatRate> {
        let table = self.fetch_day(date).await?;
        table
            .get(code)
            .cloned()
            .ok_or_else(|| AppError::CurrencyNotFound(format!("{} on {}", code.to_uppercase(), table.date)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DailyResponse {
    /// 例如 "2024-01-10T11:30:00+03:00"
    date: String,
    valute: HashMap<String, DailyValute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DailyValute {
    char_code: String,
    nominal: i64,
    name: String,
    value: f64,
    previous: f64,
}

/// 央行每日汇率 JSON 接口
#[derive(Clone, Debug)]
pub struct CbrFiatSource {
    api_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl CbrFiatSource {
    pub fn new(config: &FiatSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::ConfigError(format!("创建HTTP客户端失败: {}", e)))?;

        info!(target: "api", "初始化法币汇率客户端，端点: {}", config.api_url);

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::new(config.max_attempts, Duration::from_millis(config.retry_base_delay_ms)),
        })
    }

    fn latest_url(&self) -> String {
        format!("{}/daily_json.js", self.api_url)
    }

    fn archive_url(&self, date: NaiveDate) -> String {
        format!("{}/archive/{}/daily_json.js", self.api_url, date.format("%Y/%m/%d"))
    }

    /// 单次请求；归档不存在时返回 Ok(None)
    async fn fetch_document(&self, url: &str) -> Result<Option<DailyResponse>> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{} - {}", status, body);
            return if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                Err(AppError::ApiError(message))
            } else {
                Err(AppError::ValidationError(message))
            };
        }

        let text = response.text().await?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Option<DailyResponse>> {
        retry_with_backoff(&self.retry, "cbr_daily", || self.fetch_document(url)).await
    }
}

#[async_trait]
impl FiatRateSource for CbrFiatSource {
    #[instrument(target = "api", skip(self), err)]
    async fn fetch_day(&self, date: Option<NaiveDate>) -> Result<FiatTable> {
        if let Some(requested) = date {
            if let Some(doc) = self.fetch_with_retry(&self.archive_url(requested)).await? {
                return table_from_response(doc, None);
            }

            // 非发布日（周末、节假日）归档不存在，退回最新一期
            let doc = self
                .fetch_with_retry(&self.latest_url())
                .await?
                .ok_or_else(|| AppError::NotFound("latest fiat table".to_string()))?;
            let table = table_from_response(doc, Some(requested))?;
            warn!(
                target: "api",
                decision = "archive_substituted",
                requested = %requested,
                actual = %table.date,
                "归档汇率不存在，使用最新一期代替"
            );
            return Ok(table);
        }

        let doc = self
            .fetch_with_retry(&self.latest_url())
            .await?
            .ok_or_else(|| AppError::NotFound("latest fiat table".to_string()))?;
        let table = table_from_response(doc, None)?;
        debug!(target: "api", date = %table.date, currency_count = table.rates.len(), "获取最新法币汇率");
        Ok(table)
    }
}

fn table_from_response(doc: DailyResponse, substituted_from: Option<NaiveDate>) -> Result<FiatTable> {
    // 取发布方所在时区的日期
    let date = DateTime::parse_from_rfc3339(&doc.date)?.date_naive();

    let rates = doc
        .valute
        .into_values()
        .map(|v| {
            let code = v.char_code.to_uppercase();
            let rate = FiatRate {
                date,
                code: code.clone(),
                name: v.name,
                nominal: v.nominal,
                value: v.value,
                previous: v.previous,
            };
            (code, rate)
        })
        .collect();

    Ok(FiatTable {
        date,
        substituted_from,
        rates,
    })
}
