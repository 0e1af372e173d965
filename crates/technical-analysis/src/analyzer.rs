use market_core::{Bar, MarketError, Symbol};
use serde::{Deserialize, Serialize};

use crate::indicators::*;

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_WIDTH: f64 = 2.0;

/// Most recent value of each indicator; `None` when history is too short.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestIndicators {
    pub close: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_middle: Option<f64>,
    pub bollinger_lower: Option<f64>,
    pub ema_20: Option<f64>,
    pub ema_50: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub symbol: Symbol,
    pub bars: usize,
    pub latest: LatestIndicators,
}

fn last(values: &[f64]) -> Option<f64> {
    values.last().copied().filter(|v| v.is_finite())
}

/// Compute the latest RSI(14), MACD(12,26,9), Bollinger(20,2), EMA20 and
/// EMA50 from bars ordered oldest first.
pub fn analyze(symbol: Symbol, bars: &[Bar]) -> Result<TechnicalSnapshot, MarketError> {
    if bars.is_empty() {
        return Err(MarketError::InsufficientData(format!(
            "No price history for {}",
            symbol
        )));
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let macd = macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let bands = bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_WIDTH);

    Ok(TechnicalSnapshot {
        symbol,
        bars: bars.len(),
        latest: LatestIndicators {
            close: last(&closes),
            rsi: last(&rsi(&closes, RSI_PERIOD)),
            macd: last(&macd.macd_line),
            macd_signal: last(&macd.signal_line),
            macd_histogram: last(&macd.histogram),
            bollinger_upper: last(&bands.upper),
            bollinger_middle: last(&bands.middle),
            bollinger_lower: last(&bands.lower),
            ema_20: last(&ema(&closes, 20)),
            ema_50: last(&ema(&closes, 50)),
        },
    })
}
