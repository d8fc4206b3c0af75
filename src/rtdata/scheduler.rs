//! 定时刷新调度器
//!
//! 每个调度器在自己的 tokio 任务中运行：等待到配置的 UTC 时刻执行第一次，
//! 之后按固定周期重复。定时路径上的任务错误只记录日志。

use crate::rtcommon::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// 可被调度的刷新任务
#[async_trait]
pub trait RefreshJob: Send + Sync {
    fn name(&self) -> &str;

    /// 执行一次，返回写入的行数
    async fn run(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    WaitingFirstRun,
    Running,
}

/// 首次触发的 UTC 时刻与之后的重复周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    pub hour: u32,
    pub minute: u32,
    pub period: Duration,
}

impl RefreshSchedule {
    pub fn daily(hour: u32, minute: u32) -> Self {
        Self::every(hour, minute, Duration::from_secs(24 * 60 * 60))
    }

    pub fn every(hour: u32, minute: u32, period: Duration) -> Self {
        Self { hour, minute, period }
    }

    /// 距下一次触发的时间
    ///
    /// 以当天 hour:minute 为锚点，取锚点之后第一个不早于 now 的周期点；
    /// 周期为一天时即“今天已过则明天”。
    pub fn next_fire_delay(&self, now: DateTime<Utc>) -> Result<Duration> {
        let anchor = now
            .date_naive()
            .and_hms_opt(self.hour, self.minute, 0)
            .ok_or_else(|| AppError::SchedulerError(format!("invalid fire time {}:{}", self.hour, self.minute)))?
            .and_utc();

        if anchor >= now {
            return Ok((anchor - now).to_std().unwrap_or_default());
        }

        let period_ms = (self.period.as_millis() as i64).max(1);
        let elapsed_ms = (now - anchor).num_milliseconds();
        let steps = (elapsed_ms + period_ms - 1) / period_ms;
        let delay_ms = anchor.timestamp_millis() + steps * period_ms - now.timestamp_millis();
        Ok(Duration::from_millis(delay_ms.max(0) as u64))
    }
}

type TaskSlot = Option<(watch::Sender<bool>, JoinHandle<()>)>;

pub struct RefreshScheduler {
    job: Arc<dyn RefreshJob>,
    schedule: RefreshSchedule,
    stop_timeout: Duration,
    state: Arc<Mutex<SchedulerState>>,
    task: Mutex<TaskSlot>,
}

impl RefreshScheduler {
    pub fn new(job: Arc<dyn RefreshJob>, schedule: RefreshSchedule, stop_timeout: Duration) -> Self {
        Self {
            job,
            schedule,
            stop_timeout,
            state: Arc::new(Mutex::new(SchedulerState::Stopped)),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        read_state(&self.state)
    }

    /// 启动调度循环；已在运行时不做任何事
    pub fn start(&self) -> Result<()> {
        let mut slot = self
            .task
            .lock()
            .map_err(|_| AppError::SchedulerError("scheduler task lock poisoned".to_string()))?;

        if slot.is_some() {
            info!(job = self.job.name(), decision = "already_started", "调度器已在运行，忽略重复启动");
            return Ok(());
        }

        let delay = self.schedule.next_fire_delay(Utc::now())?;
        write_state(&self.state, SchedulerState::WaitingFirstRun);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let job = self.job.clone();
        let state = self.state.clone();
        let period = self.schedule.period;

        let loop_span = tracing::info_span!("refresh_loop", job = job.name(), iterator_type = "refresh_tick");
        let handle = tokio::spawn(run_loop(job, delay, period, state, shutdown_rx).instrument(loop_span));

        info!(
            job = self.job.name(),
            first_run_in_secs = delay.as_secs(),
            period_secs = period.as_secs(),
            "调度器已启动"
        );
        *slot = Some((shutdown_tx, handle));
        Ok(())
    }

    /// 通知循环退出并等待其结束；未运行时不做任何事
    pub async fn stop(&self) -> Result<()> {
        let taken = self
            .task
            .lock()
            .map_err(|_| AppError::SchedulerError("scheduler task lock poisoned".to_string()))?
            .take();

        let (shutdown_tx, mut handle) = match taken {
            Some(task) => task,
            None => {
                debug!(job = self.job.name(), decision = "not_running", "调度器未运行，忽略停止");
                return Ok(());
            }
        };

        info!(job = self.job.name(), "正在停止调度器");
        let _ = shutdown_tx.send(true);

        match time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(job = self.job.name(), error.details = %e, "调度任务异常退出");
            }
            Err(_) => {
                warn!(job = self.job.name(), timeout_secs = self.stop_timeout.as_secs(), "调度任务未在超时内退出，强制中止");
                handle.abort();
            }
        }

        write_state(&self.state, SchedulerState::Stopped);
        info!(job = self.job.name(), "调度器已停止");
        Ok(())
    }

    /// 立即执行一次任务，错误直接返回
    pub async fn run_immediately(&self) -> Result<usize> {
        let span = tracing::info_span!("refresh_job", job = self.job.name(), trigger = "manual");
        self.job.run().instrument(span).await
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        // 确保在销毁时通知循环退出
        if let Ok(mut slot) = self.task.lock() {
            if let Some((shutdown_tx, _)) = slot.take() {
                let _ = shutdown_tx.send(true);
            }
        }
    }
}

fn read_state(state: &Mutex<SchedulerState>) -> SchedulerState {
    match state.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn write_state(state: &Mutex<SchedulerState>, value: SchedulerState) {
    match state.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

async fn run_loop(
    job: Arc<dyn RefreshJob>,
    first_delay: Duration,
    period: Duration,
    state: Arc<Mutex<SchedulerState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = time::sleep(first_delay) => {}
        _ = shutdown.changed() => {
            debug!(decision = "stopped_before_first_run", "首次执行前收到停止信号");
            return;
        }
    }

    write_state(&state, SchedulerState::Running);
    if !run_guarded(job.as_ref(), &mut shutdown).await {
        return;
    }

    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !run_guarded(job.as_ref(), &mut shutdown).await {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("调度循环已退出");
}

/// 执行一次任务，停止信号可以打断执行中的任务；返回 false 表示应退出循环
async fn run_guarded(job: &dyn RefreshJob, shutdown: &mut watch::Receiver<bool>) -> bool {
    let started = Instant::now();
    let span = tracing::info_span!("refresh_job", job = job.name(), trigger = "timer");

    tokio::select! {
        result = job.run().instrument(span) => {
            match result {
                Ok(count) => info!(
                    job = job.name(),
                    row_count = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "刷新完成"
                ),
                Err(e) => error!(
                    job = job.name(),
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "刷新失败"
                ),
            }
            true
        }
        _ = shutdown.changed() => {
            warn!(job = job.name(), decision = "interrupted", "执行中收到停止信号");
            false
        }
    }
}
