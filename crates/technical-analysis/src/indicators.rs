//! Indicator series. Each output is aligned to the END of the input: the
//! last element always describes the most recent price.

/// Simple Moving Average, one value per full window.
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let mut sum: f64 = data[..period].iter().sum();
    let mut result = Vec::with_capacity(data.len() - period + 1);
    result.push(sum / period as f64);
    for i in period..data.len() {
        sum += data[i] - data[i - period];
        result.push(sum / period as f64);
    }
    result
}

/// Exponential Moving Average seeded with the SMA of the first window.
/// Output length is `data.len() - period + 1`.
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = data[..period].iter().sum::<f64>() / period as f64;
    let mut result = Vec::with_capacity(data.len() - period + 1);
    result.push(prev);

    for &price in &data[period..] {
        prev += (price - prev) * k;
        result.push(prev);
    }
    result
}

/// Wilder's Relative Strength Index. Output length is `data.len() - period`.
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() <= period {
        return vec![];
    }

    let changes: Vec<f64> = data.windows(2).map(|w| w[1] - w[0]).collect();
    let gain = |c: f64| c.max(0.0);
    let loss = |c: f64| (-c).max(0.0);

    let mut avg_gain = changes[..period].iter().copied().map(gain).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().copied().map(loss).sum::<f64>() / period as f64;

    let to_rsi = |g: f64, l: f64| {
        if l == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        }
    };

    let mut values = Vec::with_capacity(data.len() - period);
    values.push(to_rsi(avg_gain, avg_loss));

    let p = period as f64;
    for &c in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + gain(c)) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss(c)) / p;
        values.push(to_rsi(avg_gain, avg_loss));
    }
    values
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacdResult {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// MACD: fast EMA minus slow EMA, its signal EMA, and their difference.
pub fn macd(data: &[f64], fast_period: usize, slow_period: usize, signal_period: usize) -> MacdResult {
    if fast_period == 0 || signal_period == 0 || slow_period <= fast_period {
        return MacdResult::default();
    }

    let fast = ema(data, fast_period);
    let slow = ema(data, slow_period);
    if slow.is_empty() {
        return MacdResult::default();
    }

    let offset = slow_period - fast_period;
    let macd_line: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(i, s)| fast[i + offset] - s)
        .collect();

    let signal_line = ema(&macd_line, signal_period);
    let lag = macd_line.len() - signal_line.len();
    let histogram = signal_line
        .iter()
        .enumerate()
        .map(|(i, s)| macd_line[i + lag] - s)
        .collect();

    MacdResult {
        macd_line,
        signal_line,
        histogram,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Bollinger Bands around an SMA, using the sample standard deviation.
pub fn bollinger_bands(data: &[f64], period: usize, width: f64) -> BollingerBands {
    if period < 2 || data.len() < period {
        return BollingerBands::default();
    }

    let middle = sma(data, period);
    let (upper, lower) = data
        .windows(period)
        .zip(&middle)
        .map(|(window, &mean)| {
            let variance =
                window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
            let band = width * variance.sqrt();
            (mean + band, mean - band)
        })
        .unzip();

    BollingerBands {
        upper,
        middle,
        lower,
    }
}
