//! 汇率合成端到端测试：直接相乘、日汇率回退、容差丢弃

mod common;

use common::*;
use rate_server::rtcommon::config::FiatSourceConfig;
use rate_server::rtcommon::models::{Interval, DAY_MS, HOUR_MS};
use rate_server::rtcommon::{AppConfig, AppError};
use rate_server::rtdata::RateSynthesizer;
use std::sync::Arc;

fn synthesizer(crypto: MockCryptoSource, fiat: MockFiatSource) -> RateSynthesizer {
    RateSynthesizer::new(Arc::new(crypto), Arc::new(fiat), &AppConfig::default())
}

#[tokio::test]
async fn point_rate_multiplies_both_legs() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![candle("BTCUSDT", T0, 100.0, 110.0, 90.0, 105.0, 10.0)])
        .with_series("USDTRUB", vec![candle("USDTRUB", T0, 90.0, 92.0, 88.0, 91.0, 5000.0)]);
    let synth = synthesizer(crypto, MockFiatSource::new());

    let rate = synth.synthesize_at("BTC", "RUB", T0).await.unwrap();
    assert_eq!(rate.symbol, "BTC/RUB");
    assert_eq!(rate.timestamp, T0);
    assert_eq!(rate.open, 9000.0);
    assert_eq!(rate.high, 10120.0);
    assert_eq!(rate.low, 7920.0);
    assert_eq!(rate.close, 9555.0);
    assert_eq!(rate.volume, 10.0);
}

#[tokio::test]
async fn point_rate_falls_back_to_daily_table() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![candle("BTCUSDT", T0, 100.0, 110.0, 90.0, 105.0, 10.0)])
        .with_unknown("USDTRUB");
    let fiat = MockFiatSource::new().with_rate(day(10), "USD", 90.0);
    let synth = synthesizer(crypto, fiat);

    let rate = synth.synthesize_at("btc", "rub", T0 + 20 * 60_000).await.unwrap();
    assert_eq!(rate.symbol, "BTC/RUB");
    assert_eq!(rate.timestamp, T0);
    assert_eq!(rate.open, 9000.0);
    assert_eq!(rate.high, 9900.0);
    assert_eq!(rate.low, 8100.0);
    assert_eq!(rate.close, 9450.0);
    assert_eq!(rate.volume, 10.0);
}

#[tokio::test]
async fn point_rate_picks_nearest_candles() {
    let crypto = MockCryptoSource::new()
        .with_series(
            "BTCUSDT",
            vec![flat("BTCUSDT", T0 - HOUR_MS, 1.0), flat("BTCUSDT", T0, 2.0), flat("BTCUSDT", T0 + HOUR_MS, 3.0)],
        )
        .with_series("USDTRUB", vec![flat("USDTRUB", T0, 90.0), flat("USDTRUB", T0 + HOUR_MS, 100.0)]);
    let synth = synthesizer(crypto, MockFiatSource::new());

    let rate = synth.synthesize_at("BTC", "RUB", T0 + 40 * 60_000).await.unwrap();
    assert_eq!(rate.timestamp, T0 + HOUR_MS);
    assert_eq!(rate.close, 300.0);
}

#[tokio::test]
async fn cross_rate_for_non_local_fiat() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 100.0)])
        .with_unknown("USDTEUR");
    let fiat = MockFiatSource::new().with_rate(day(10), "USD", 90.0).with_rate(day(10), "EUR", 100.0);
    let synth = synthesizer(crypto, fiat);

    let rate = synth.synthesize_at("BTC", "EUR", T0).await.unwrap();
    assert!((rate.close - 90.0).abs() < 1e-9);
}

#[tokio::test]
async fn unknown_crypto_symbol_is_reported() {
    let crypto = MockCryptoSource::new().with_unknown("FOOUSDT");
    let synth = synthesizer(crypto, MockFiatSource::new());

    let err = synth.synthesize_at("FOO", "RUB", T0).await.unwrap_err();
    assert!(matches!(err, AppError::SymbolNotFound(ref pair) if pair == "FOOUSDT"));
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn range_drops_candles_outside_intraday_tolerance() {
    let crypto = MockCryptoSource::new()
        .with_series(
            "BTCUSDT",
            vec![
                flat("BTCUSDT", T0, 100.0),
                flat("BTCUSDT", T0 + HOUR_MS, 100.0),
                flat("BTCUSDT", T0 + 2 * HOUR_MS, 100.0),
                flat("BTCUSDT", T0 + 5 * HOUR_MS, 100.0),
            ],
        )
        .with_series(
            "USDTRUB",
            vec![
                flat("USDTRUB", T0, 90.0),
                // 与 1h 相差 59 分钟，仍在容差内
                flat("USDTRUB", T0 + HOUR_MS + 59 * 60_000, 91.0),
            ],
        );
    let synth = synthesizer(crypto, MockFiatSource::new());

    let rates = synth
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0, T0 + 6 * HOUR_MS)
        .await
        .unwrap();

    let timestamps: Vec<i64> = rates.iter().map(|r| r.timestamp).collect();
    assert_eq!(timestamps, vec![T0, T0 + HOUR_MS, T0 + 2 * HOUR_MS]);
    assert_eq!(rates[0].close, 9000.0);
    assert_eq!(rates[1].close, 9100.0);
    assert_eq!(rates[2].close, 9100.0);
}

#[tokio::test]
async fn range_fallback_uses_nearest_fiat_day_within_a_week() {
    let crypto = MockCryptoSource::new()
        .with_series(
            "BTCUSDT",
            vec![
                flat("BTCUSDT", T0, 2.0),
                flat("BTCUSDT", T0 + 3 * DAY_MS, 2.0),
                flat("BTCUSDT", T0 + 8 * DAY_MS, 2.0),
            ],
        )
        .with_unknown("USDTRUB");
    let fiat = MockFiatSource::new().with_rate(day(10), "USD", 90.0);
    let synth = synthesizer(crypto, fiat);

    let rates = synth
        .synthesize_range("BTC", "RUB", Interval::OneDay, T0, T0 + 8 * DAY_MS)
        .await
        .unwrap();

    assert_eq!(rates.len(), 2);
    assert_eq!(rates[0].timestamp, T0);
    assert_eq!(rates[1].timestamp, T0 + 3 * DAY_MS);
    assert!(rates.iter().all(|r| r.close == 180.0 && r.symbol == "BTC/RUB"));
}

#[tokio::test]
async fn range_fallback_queries_each_day_once() {
    let crypto = Arc::new(
        MockCryptoSource::new()
            .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 1.0)])
            .with_unknown("USDTRUB"),
    );
    let fiat = Arc::new(MockFiatSource::new().with_rate(day(10), "USD", 90.0));
    let mut config = AppConfig::default();
    config.synthesis.fallback_concurrency = 2;
    let synth = RateSynthesizer::new(crypto, fiat.clone(), &config);

    synth
        .synthesize_range("BTC", "RUB", Interval::OneDay, T0, T0 + 4 * DAY_MS)
        .await
        .unwrap();
    assert_eq!(fiat.day_calls(), 5);
}

#[tokio::test]
async fn range_without_any_fiat_data_fails() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 1.0)])
        .with_series("USDTRUB", Vec::new());
    let synth = synthesizer(crypto, MockFiatSource::new());

    let err = synth
        .synthesize_range("BTC", "RUB", Interval::OneDay, T0, T0 + DAY_MS)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoFallbackData(_)));
    assert_eq!(err.http_status(), 500);
}

#[tokio::test]
async fn empty_crypto_leg_yields_empty_series() {
    let fiat = MockFiatSource::new().with_rate(day(10), "USD", 90.0);
    let synth = synthesizer(MockCryptoSource::new(), fiat);

    let rates = synth
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0, T0 + DAY_MS)
        .await
        .unwrap();
    assert!(rates.is_empty());
}

#[tokio::test]
async fn inverted_range_is_rejected() {
    let synth = synthesizer(MockCryptoSource::new(), MockFiatSource::new());
    let err = synth
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0 + 1, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
}

#[tokio::test]
async fn reference_currency_needs_no_fiat_table() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 60000.0)])
        .with_unknown("USDTUSD");
    let fiat = Arc::new(MockFiatSource::new());
    let synth = RateSynthesizer::with_settings(
        Arc::new(crypto),
        fiat.clone(),
        AppConfig::default().synthesis,
        &FiatSourceConfig::default(),
    );

    let rate = synth.synthesize_at("BTC", "USD", T0).await.unwrap();
    assert_eq!(rate.close, 60000.0);
    assert_eq!(fiat.day_calls(), 0);
}

/// 各种形状的K线：阳线、阴线、十字星
fn shaped(pair: &str, hours: i64, base: f64) -> Vec<rate_server::rtcommon::CryptoCandle> {
    (0..hours)
        .map(|h| {
            let drift = (h % 3) as f64;
            match h % 3 {
                0 => candle(pair, T0 + h * HOUR_MS, base, base + 2.0, base - 1.0, base + 1.5, 3.0),
                1 => candle(pair, T0 + h * HOUR_MS, base + drift, base + drift + 0.5, base - 2.0, base - 1.0, 4.0),
                _ => candle(pair, T0 + h * HOUR_MS, base, base, base, base, 0.0),
            }
        })
        .collect()
}

#[tokio::test]
async fn range_output_is_well_formed_on_both_paths() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", shaped("BTCUSDT", 48, 100.0))
        .with_series("USDTRUB", shaped("USDTRUB", 48, 90.0));
    let direct = synthesizer(crypto, MockFiatSource::new())
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0, T0 + 47 * HOUR_MS)
        .await
        .unwrap();
    assert_eq!(direct.len(), 48);
    assert!(direct.iter().all(|r| r.is_well_formed()));

    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", shaped("BTCUSDT", 48, 100.0))
        .with_unknown("USDTRUB");
    let fiat = MockFiatSource::new().with_rate(day(10), "USD", 90.0).with_rate(day(11), "USD", 91.5);
    let fallback = synthesizer(crypto, fiat)
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0, T0 + 47 * HOUR_MS)
        .await
        .unwrap();
    assert_eq!(fallback.len(), 48);
    assert!(fallback.iter().all(|r| r.is_well_formed()));
}

#[tokio::test]
async fn range_keeps_fiat_candle_exactly_one_hour_away() {
    let at_limit = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 100.0)])
        .with_series("USDTRUB", vec![flat("USDTRUB", T0 + HOUR_MS, 90.0)]);
    let rates = synthesizer(at_limit, MockFiatSource::new())
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0, T0 + 2 * HOUR_MS)
        .await
        .unwrap();
    assert_eq!(rates.len(), 1);
    assert_eq!(rates[0].timestamp, T0);
    assert_eq!(rates[0].close, 9000.0);

    let past_limit = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 100.0)])
        .with_series("USDTRUB", vec![flat("USDTRUB", T0 + HOUR_MS + 1, 90.0)]);
    let rates = synthesizer(past_limit, MockFiatSource::new())
        .synthesize_range("BTC", "RUB", Interval::OneHour, T0, T0 + 2 * HOUR_MS)
        .await
        .unwrap();
    assert!(rates.is_empty());
}

#[tokio::test]
async fn cross_rate_range_reads_one_table_per_day() {
    let crypto = Arc::new(
        MockCryptoSource::new()
            .with_series("BTCUSDT", (0..5).map(|d| flat("BTCUSDT", T0 + d * DAY_MS, 100.0)).collect())
            .with_unknown("USDTEUR"),
    );
    let mut fiat = MockFiatSource::new();
    for d in 10..15 {
        fiat = fiat.with_rate(day(d), "USD", 90.0).with_rate(day(d), "EUR", 100.0);
    }
    let fiat = Arc::new(fiat);
    let synth = RateSynthesizer::new(crypto, fiat.clone(), &AppConfig::default());

    let rates = synth
        .synthesize_range("BTC", "EUR", Interval::OneDay, T0, T0 + 4 * DAY_MS)
        .await
        .unwrap();
    assert_eq!(rates.len(), 5);
    assert!(rates.iter().all(|r| (r.close - 90.0).abs() < 1e-9));
    assert_eq!(fiat.day_calls(), 5);
}

#[tokio::test]
async fn cross_rate_with_unknown_fiat_code_has_no_fallback() {
    let crypto = MockCryptoSource::new()
        .with_series("BTCUSDT", vec![flat("BTCUSDT", T0, 100.0)])
        .with_unknown("USDTXXX");
    let fiat = MockFiatSource::new().with_rate(day(10), "USD", 90.0);

    let err = synthesizer(crypto, fiat)
        .synthesize_range("BTC", "XXX", Interval::OneDay, T0, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoFallbackData(_)));
}
