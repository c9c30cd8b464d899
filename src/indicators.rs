//! Indicator helpers over closing prices, oldest first.

use rust_decimal::prelude::*;

use crate::trading_api::Candle;

pub fn closes(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .filter_map(|c| c.close.to_f64())
        .collect()
}

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the SMA of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    Some(
        values[period..]
            .iter()
            .fold(seed, |prev, value| value * k + prev * (1.0 - k)),
    )
}

/// Wilder's RSI. Needs `period + 1` values.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() <= period {
        return None;
    }

    let mut gain = 0.0;
    let mut loss = 0.0;
    for w in values[..=period].windows(2) {
        let change = w[1] - w[0];
        if change >= 0.0 {
            gain += change;
        } else {
            loss -= change;
        }
    }
    let mut avg_gain = gain / period as f64;
    let mut avg_loss = loss / period as f64;

    for w in values[period..].windows(2) {
        let change = w[1] - w[0];
        let (g, l) = if change >= 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + g) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + l) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

/// Bollinger bands over the last `period` values with `width` standard
/// deviations (population variance).
pub fn bollinger(values: &[f64], period: usize, width: f64) -> Option<Bands> {
    let middle = sma(values, period)?;
    let window = &values[values.len() - period..];
    let variance = window.iter().map(|v| (v - middle).powi(2)).sum::<f64>() / period as f64;
    let dev = variance.sqrt() * width;
    Some(Bands {
        lower: middle - dev,
        middle,
        upper: middle + dev,
    })
}

pub const FIBONACCI_RATIOS: [f64; 7] = [0.0, 0.236, 0.382, 0.5, 0.618, 0.786, 1.0];

/// Retracement levels from `high` down to `low`, highest first.
pub fn fibonacci_levels(high: f64, low: f64) -> Vec<f64> {
    let range = high - low;
    FIBONACCI_RATIOS.iter().map(|r| high - range * r).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cross {
    Above,
    Below,
}

/// Whether the fast SMA crossed the slow SMA on the last value.
pub fn sma_cross(values: &[f64], fast: usize, slow: usize) -> Option<Cross> {
    if values.len() < slow + 1 {
        return None;
    }
    let prev = &values[..values.len() - 1];
    let (pf, ps) = (sma(prev, fast)?, sma(prev, slow)?);
    let (cf, cs) = (sma(values, fast)?, sma(values, slow)?);
    if pf <= ps && cf > cs {
        Some(Cross::Above)
    } else if pf >= ps && cf < cs {
        Some(Cross::Below)
    } else {
        None
    }
}
