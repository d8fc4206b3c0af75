// 数据模块：行情源、合成、调度
pub mod alignment;
pub mod crypto_source;
pub mod fiat_source;
pub mod jobs;
pub mod scheduler;
pub mod synthesizer;
pub mod window;

pub use crypto_source::{BinanceCryptoSource, CryptoRateSource};
pub use fiat_source::{CbrFiatSource, FiatRateSource};
pub use jobs::{CryptoRefreshJob, FiatSnapshotJob};
pub use scheduler::{RefreshJob, RefreshSchedule, RefreshScheduler, SchedulerState};
pub use synthesizer::RateSynthesizer;
pub use window::{QueryParams, QueryWindow};
