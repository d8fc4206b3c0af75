use crate::rtcommon::{AppError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::Instrument;

/// 指数退避重试策略：第 n 次重试前等待 base_delay * 2^(n-1)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 第 retry 次重试前的等待时间（retry 从 1 开始）
    pub fn delay_for(&self, retry: usize) -> Duration {
        let shift = retry.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(1u32 << shift)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// 执行 op，遇到可重试错误时按策略退避重试
///
/// 不可重试的错误（如未知交易对）原样立即返回；重试耗尽后返回
/// `SourceUnavailable`，其中带上最后一次的错误信息。
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, source_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retry_loop_span = tracing::info_span!(
        "source_retry_loop",
        source = %source_name,
        iterator_type = "retry_attempt",
        max_attempts = policy.max_attempts
    );

    async {
        let mut last_error: Option<AppError> = None;

        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                let wait = policy.delay_for(attempt - 1);
                tracing::debug!(decision = "retry_wait", attempt, wait_ms = wait.as_millis() as u64, "等待后重试");
                tokio::time::sleep(wait).await;
            }

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "{} 重试成功", source_name);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::debug!(decision = "no_retry", error.summary = e.get_error_type_summary(), "语义错误，不重试");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error.summary = e.get_error_type_summary(),
                        error.details = %e,
                        "{} 请求失败",
                        source_name
                    );
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        let final_error = AppError::SourceUnavailable {
            source_name: source_name.to_string(),
            attempts: policy.max_attempts,
            last_error,
        };
        tracing::error!(
            message = "重试最终失败",
            error.summary = final_error.get_error_type_summary(),
            error.details = %final_error
        );
        Err(final_error)
    }
    .instrument(retry_loop_span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_into_source_unavailable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let started = tokio::time::Instant::now();

        let calls_in_op = calls.clone();
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), "binance", move || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::ApiError("502 Bad Gateway".to_string()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s
        assert!(started.elapsed() >= Duration::from_secs(3));
        match result {
            Err(AppError::SourceUnavailable { attempts, last_error, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("502"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn semantic_error_fails_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_op = calls.clone();
        let result: Result<()> = retry_with_backoff(&RetryPolicy::default(), "binance", move || {
            let calls = calls_in_op.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::SymbolNotFound("FOOUSDT".to_string()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::SymbolNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_second_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_op = calls.clone();
        let result = retry_with_backoff(&RetryPolicy::default(), "cbr", move || {
            let calls = calls_in_op.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::ApiError("timeout".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
