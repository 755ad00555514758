// =============================================================================
// Market Snapshot Provider — on-demand bar/indicator/price bundle per symbol
// =============================================================================
//
// Snapshots are uncached: each call is authoritative for its timestamp, and a
// built snapshot is a value that is never mutated. Bar series come from the
// venue; all indicators are pure functions of the series (src/indicators).
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exchange::{Exchange, ExchangeError};
use crate::indicators::{atr, bollinger, ema, kdj, macd, obv, rsi, sma};

/// Short-term timeframe and window. 120 bars of 3m covers six hours, enough
/// for every indicator in the bundle plus the 4h price-change lookback.
const SHORT_INTERVAL: &str = "3m";
const SHORT_WINDOW: u32 = 120;

/// Long-term timeframe; 70 bars of 4h covers the EMA50 seed.
const LONG_INTERVAL: &str = "4h";
const LONG_WINDOW: u32 = 70;

/// Open-interest history points averaged into the snapshot (5m period).
const OI_HIST_POINTS: u32 = 12;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest short-term indicator readings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorTuple {
    pub ema20: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub rsi7: Option<f64>,
    pub boll_upper: Option<f64>,
    pub boll_middle: Option<f64>,
    pub boll_lower: Option<f64>,
    pub kdj_k: Option<f64>,
    pub kdj_d: Option<f64>,
    pub kdj_j: Option<f64>,
    pub sma5: Option<f64>,
    pub sma10: Option<f64>,
    pub sma20: Option<f64>,
    pub obv: Option<f64>,
    pub vol_ma5: Option<f64>,
    pub vol_ma10: Option<f64>,
}

/// One bar-indexed point of the short-term series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub open_time: i64,
    pub close: f64,
    pub volume: f64,
    pub ema20: Option<f64>,
    pub macd: Option<f64>,
    pub rsi7: Option<f64>,
    pub obv: Option<f64>,
}

/// Longer-term (4h) structural readings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LongTermBundle {
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub atr3: Option<f64>,
    pub atr14: Option<f64>,
    pub volume: Option<f64>,
    pub volume_ma: Option<f64>,
}

/// Latest open interest plus a short rolling average.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenInterestPair {
    pub latest: f64,
    pub average: f64,
}

/// Immutable per-symbol market snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_1h_pct: Option<f64>,
    pub price_change_4h_pct: Option<f64>,
    pub intraday: IndicatorTuple,
    pub intraday_series: Vec<SeriesPoint>,
    pub long_term: LongTermBundle,
    pub open_interest: Option<OpenInterestPair>,
    pub funding_rate: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Number of trailing bars rendered into the snapshot series.
const SERIES_TAIL: usize = 10;

/// Builds market snapshots through the exchange adapter.
#[derive(Clone)]
pub struct MarketDataProvider {
    exchange: Arc<dyn Exchange>,
}

impl MarketDataProvider {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self { exchange }
    }

    /// Build a fresh snapshot for `symbol`.
    ///
    /// Bar-series failures propagate (the caller owns retry policy); open
    /// interest and funding failures degrade to `None` — a missing auxiliary
    /// signal must not cost the whole snapshot.
    pub async fn snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let short_bars = self
            .exchange
            .get_klines(symbol, SHORT_INTERVAL, SHORT_WINDOW)
            .await?;
        if short_bars.is_empty() {
            return Err(ExchangeError::VenueReject(format!(
                "no {SHORT_INTERVAL} bars for {symbol}"
            )));
        }

        let long_bars = self
            .exchange
            .get_klines(symbol, LONG_INTERVAL, LONG_WINDOW)
            .await
            .unwrap_or_default();

        // Live ticker when available, otherwise mark price, otherwise last close.
        let current_price = match self.exchange.get_ticker_price(symbol).await {
            Ok(p) => p,
            Err(_) => match self.exchange.get_mark_price(symbol).await {
                Ok(p) => p,
                Err(_) => short_bars.last().map(|b| b.close).unwrap_or(0.0),
            },
        };

        let closes: Vec<f64> = short_bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = short_bars.iter().map(|b| b.volume).collect();

        let intraday = build_indicator_tuple(&short_bars, &closes, &volumes);
        let intraday_series = build_series(&short_bars, &closes);

        let price_change_1h_pct = pct_change_over(&closes, 20);
        let price_change_4h_pct = pct_change_over(&closes, 80);

        let long_term = build_long_term(&long_bars);

        let open_interest = match self.exchange.get_open_interest(symbol).await {
            Ok(latest) => {
                let average = match self
                    .exchange
                    .get_open_interest_hist(symbol, OI_HIST_POINTS)
                    .await
                {
                    Ok(hist) if !hist.is_empty() => {
                        hist.iter().sum::<f64>() / hist.len() as f64
                    }
                    _ => latest,
                };
                Some(OpenInterestPair { latest, average })
            }
            Err(e) => {
                debug!(symbol, error = %e, "open interest unavailable");
                None
            }
        };

        let funding_rate = self.exchange.get_funding_rate(symbol).await.ok();

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            current_price,
            price_change_1h_pct,
            price_change_4h_pct,
            intraday,
            intraday_series,
            long_term,
            open_interest,
            funding_rate,
            fetched_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Pure assembly helpers
// ---------------------------------------------------------------------------

fn build_indicator_tuple(bars: &[Bar], closes: &[f64], volumes: &[f64]) -> IndicatorTuple {
    let macd_reading = macd::current_macd(closes);
    let boll = bollinger::standard_bollinger(closes);
    let kdj_reading = kdj::current_kdj(bars);

    IndicatorTuple {
        ema20: ema::current_ema(closes, 20),
        macd: macd_reading.map(|m| m.macd),
        macd_signal: macd_reading.map(|m| m.signal),
        rsi7: rsi::current_rsi(closes, 7),
        boll_upper: boll.map(|b| b.upper),
        boll_middle: boll.map(|b| b.middle),
        boll_lower: boll.map(|b| b.lower),
        kdj_k: kdj_reading.map(|k| k.k),
        kdj_d: kdj_reading.map(|k| k.d),
        kdj_j: kdj_reading.map(|k| k.j),
        sma5: sma::current_sma(closes, 5),
        sma10: sma::current_sma(closes, 10),
        sma20: sma::current_sma(closes, 20),
        obv: obv::current_obv(bars),
        vol_ma5: sma::current_sma(volumes, 5),
        vol_ma10: sma::current_sma(volumes, 10),
    }
}

/// Bar-indexed tail of the short-term series, aligned so the last point
/// corresponds to the last bar.
fn build_series(bars: &[Bar], closes: &[f64]) -> Vec<SeriesPoint> {
    let ema20 = ema::calculate_ema(closes, 20);
    let macd_series = macd::calculate_macd(closes, 12, 26, 9);
    let rsi7 = rsi::calculate_rsi(closes, 7);
    let obv_series = obv::calculate_obv(bars);

    let tail = bars.len().min(SERIES_TAIL);
    let mut points = Vec::with_capacity(tail);

    for i in (bars.len() - tail)..bars.len() {
        let back = bars.len() - 1 - i;
        points.push(SeriesPoint {
            open_time: bars[i].open_time,
            close: bars[i].close,
            volume: bars[i].volume,
            ema20: tail_value(&ema20, back),
            macd: tail_value(&macd_series, back).map(|m| m.macd),
            rsi7: tail_value(&rsi7, back),
            obv: tail_value(&obv_series, back),
        });
    }

    points
}

/// Value `back` positions from the end of an end-aligned series.
fn tail_value<T: Copy>(series: &[T], back: usize) -> Option<T> {
    if back < series.len() {
        Some(series[series.len() - 1 - back])
    } else {
        None
    }
}

fn build_long_term(bars: &[Bar]) -> LongTermBundle {
    if bars.is_empty() {
        return LongTermBundle::default();
    }
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    LongTermBundle {
        ema20: ema::current_ema(&closes, 20),
        ema50: ema::current_ema(&closes, 50),
        atr3: atr::calculate_atr(bars, 3),
        atr14: atr::calculate_atr(bars, 14),
        volume: volumes.last().copied(),
        volume_ma: sma::current_sma(&volumes, 20),
    }
}

/// Percentage change of the last close versus `bars_back` bars earlier.
fn pct_change_over(closes: &[f64], bars_back: usize) -> Option<f64> {
    if closes.len() <= bars_back {
        return None;
    }
    let then = closes[closes.len() - 1 - bars_back];
    let now = *closes.last()?;
    if then <= 0.0 {
        return None;
    }
    Some((now - then) / then * 100.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, close: f64) -> Bar {
        Bar {
            open_time: i * 180_000,
            close_time: (i + 1) * 180_000 - 1,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn pct_change_needs_enough_bars() {
        let closes = vec![100.0; 10];
        assert!(pct_change_over(&closes, 20).is_none());
    }

    #[test]
    fn pct_change_basic() {
        let mut closes = vec![100.0; 21];
        closes[20] = 110.0;
        let change = pct_change_over(&closes, 20).unwrap();
        assert!((change - 10.0).abs() < 1e-9);
    }

    #[test]
    fn tuple_from_short_series_is_mostly_empty() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0)).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let t = build_indicator_tuple(&bars, &closes, &volumes);
        assert!(t.ema20.is_none());
        assert!(t.macd.is_none());
        assert!(t.sma5.is_some());
    }

    #[test]
    fn tuple_from_full_window_is_complete() {
        let bars: Vec<Bar> = (0..120)
            .map(|i| bar(i, 100.0 + (i as f64 * 0.1).sin()))
            .collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let t = build_indicator_tuple(&bars, &closes, &volumes);
        assert!(t.ema20.is_some());
        assert!(t.macd.is_some());
        assert!(t.rsi7.is_some());
        assert!(t.boll_middle.is_some());
        assert!(t.kdj_k.is_some());
        assert!(t.obv.is_some());
        assert!(t.vol_ma10.is_some());
    }

    #[test]
    fn series_tail_aligned_to_last_bar() {
        let bars: Vec<Bar> = (0..120).map(|i| bar(i, 100.0 + i as f64)).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let series = build_series(&bars, &closes);
        assert_eq!(series.len(), SERIES_TAIL);
        let last = series.last().unwrap();
        assert_eq!(last.open_time, bars.last().unwrap().open_time);
        assert!(last.ema20.is_some());
        assert!(last.rsi7.is_some());
    }

    #[test]
    fn long_term_bundle_empty_input() {
        let b = build_long_term(&[]);
        assert!(b.ema20.is_none());
        assert!(b.atr14.is_none());
    }

    #[test]
    fn long_term_bundle_full_window() {
        let bars: Vec<Bar> = (0..70).map(|i| bar(i, 100.0 + i as f64 * 0.5)).collect();
        let b = build_long_term(&bars);
        assert!(b.ema20.is_some());
        assert!(b.ema50.is_some());
        assert!(b.atr3.is_some());
        assert!(b.atr14.is_some());
        assert!(b.volume_ma.is_some());
    }
}
