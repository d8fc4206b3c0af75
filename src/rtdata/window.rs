use crate::rtcommon::models::{day_start_ms, Interval, DAY_MS};
use crate::rtcommon::{AppError, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// 外部查询参数：回看天数，或者起止日期
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub days: Option<u32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// 解析后的查询窗口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start_ms: i64,
    pub end_ms: i64,
    pub interval: Interval,
}

impl QueryWindow {
    /// days 优先；否则需要同时给出 start_date 与 end_date。
    /// 回看跨度超过 max_lookback_days 时从结束端截断。
    pub fn resolve(params: &QueryParams, now: DateTime<Utc>, max_lookback_days: u32) -> Result<Self> {
        let max_days = max_lookback_days.max(1);
        let now_ms = now.timestamp_millis();

        if let Some(days) = params.days {
            if days == 0 {
                return Err(AppError::ValidationError("days must be at least 1".to_string()));
            }
            let days = days.min(max_days);
            let start = now - Duration::days(i64::from(days));
            return Ok(Self {
                start_ms: start.timestamp_millis(),
                end_ms: now_ms,
                interval: Interval::for_lookback_days(days),
            });
        }

        match (params.start_date, params.end_date) {
            (Some(start_date), Some(end_date)) => {
                if start_date > end_date {
                    return Err(AppError::ValidationError(format!(
                        "start_date {} is after end_date {}",
                        start_date, end_date
                    )));
                }

                let span = (end_date - start_date).num_days() + 1;
                let (start_date, span) = if span > i64::from(max_days) {
                    (end_date - Duration::days(i64::from(max_days) - 1), i64::from(max_days))
                } else {
                    (start_date, span)
                };

                let start_ms = day_start_ms(start_date);
                if start_ms > now_ms {
                    return Err(AppError::ValidationError(format!("start_date {} is in the future", start_date)));
                }
                let end_ms = (day_start_ms(end_date) + DAY_MS - 1).min(now_ms);

                Ok(Self {
                    start_ms,
                    end_ms,
                    interval: Interval::for_lookback_days(span as u32),
                })
            }
            _ => Err(AppError::ValidationError(
                "either days or both start_date and end_date are required".to_string(),
            )),
        }
    }
}
