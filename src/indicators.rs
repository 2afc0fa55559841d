//! Column indicators used by the bundled strategies. Every function returns a
//! vector aligned with its input; rows inside the warm-up window are `NaN`.

pub fn calculate_sma(prices: &[f64], period: usize) -> Vec<f64> {
    let mut sma_values = vec![f64::NAN; prices.len()];
    if period == 0 || prices.len() < period {
        return sma_values;
    }

    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values[period - 1] = window_sum / period as f64;
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values[i] = window_sum / period as f64;
    }
    sma_values
}

/// EMA seeded with the SMA of the first `period` values.
pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    let mut ema_values = vec![f64::NAN; prices.len()];
    if period == 0 || prices.len() < period {
        return ema_values;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    ema_values[period - 1] = ema;
    for i in period..prices.len() {
        ema = (prices[i] - ema) * multiplier + ema;
        ema_values[i] = ema;
    }
    ema_values
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    let mut rsi_values = vec![f64::NAN; prices.len()];
    if period == 0 || prices.len() < period + 1 {
        return rsi_values;
    }

    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss -= delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }
    rsi_values
}

#[derive(Debug, Clone, Default)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Bands at `std_dev` population standard deviations around the SMA.
pub fn calculate_bollinger_bands(prices: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    let middle = calculate_sma(prices, period);
    let mut upper = vec![f64::NAN; prices.len()];
    let mut lower = vec![f64::NAN; prices.len()];
    if period == 0 || prices.len() < period {
        return BollingerBands {
            upper,
            middle,
            lower,
        };
    }

    for i in (period - 1)..prices.len() {
        let slice = &prices[i + 1 - period..=i];
        let mean = middle[i];
        let variance = slice.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / period as f64;
        let deviation = variance.sqrt() * std_dev;
        upper[i] = mean + deviation;
        lower[i] = mean - deviation;
    }

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// Wilder ATR.
pub fn calculate_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = highs.len().min(lows.len()).min(closes.len());
    let mut atr = vec![f64::NAN; n];
    if period == 0 || n < period + 1 {
        return atr;
    }

    let mut tr_sum = 0.0f64;
    for i in 1..n {
        let tr = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        if i <= period {
            tr_sum += tr;
            if i == period {
                atr[i] = tr_sum / period as f64;
            }
        } else {
            atr[i] = (atr[i - 1] * (period as f64 - 1.0) + tr) / period as f64;
        }
    }
    atr
}

/// True when `a` crosses above `b` at row `i`.
pub fn crossed_above(a: &[f64], b: &[f64], i: usize) -> bool {
    i > 0 && i < a.len() && i < b.len() && a[i - 1] <= b[i - 1] && a[i] > b[i]
}

pub fn crossed_below(a: &[f64], b: &[f64], i: usize) -> bool {
    i > 0 && i < a.len() && i < b.len() && a[i - 1] >= b[i - 1] && a[i] < b[i]
}
