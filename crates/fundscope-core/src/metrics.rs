//! Return, drawdown and volatility math over monthly percentage returns.

use crate::{Cagr, Returns};

/// Compounds monthly percentage returns into one cumulative percentage return.
pub fn compound_returns(monthly_pct: &[f64]) -> f64 {
    let growth = monthly_pct
        .iter()
        .fold(1.0_f64, |acc, r| acc * (1.0 + r / 100.0));
    (growth - 1.0) * 100.0
}

/// Annualizes a cumulative percentage return earned over `years`.
pub fn cagr_from_total(total_pct: f64, years: u32) -> f64 {
    if years == 0 {
        return total_pct;
    }
    ((total_pct / 100.0 + 1.0).powf(1.0 / f64::from(years)) - 1.0) * 100.0
}

/// Value path starting at 1.0, one point per month, in the order given.
pub fn cumulative_values(monthly_pct: &[f64]) -> Vec<f64> {
    let mut values = Vec::with_capacity(monthly_pct.len() + 1);
    let mut value = 1.0_f64;
    values.push(value);
    for r in monthly_pct {
        value *= 1.0 + r / 100.0;
        values.push(value);
    }
    values
}

/// Largest fractional fall from a running peak to any later point.
pub fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &value in values {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            worst = worst.max((peak - value) / peak);
        }
    }
    worst
}

/// Drawdown of chronologically ordered monthly returns.
pub fn max_drawdown_from_returns(chronological_pct: &[f64]) -> f64 {
    max_drawdown(&cumulative_values(chronological_pct))
}

pub fn population_std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// Trailing horizons compounded from the newest monthly returns. Horizons without a full
/// window of history stay `None`; `month_1` and `since_inception` are left to the caller.
pub fn trailing_returns(newest_first_pct: &[f64]) -> (Returns, Cagr) {
    let window = |months: usize| -> Option<f64> {
        (newest_first_pct.len() >= months).then(|| compound_returns(&newest_first_pct[..months]))
    };

    let returns = Returns {
        month_3: window(3),
        month_6: window(6),
        year_1: window(12),
        year_2: window(24),
        year_3: window(36),
        year_4: window(48),
        year_5: window(60),
        ..Returns::default()
    };
    let cagr = Cagr {
        year_2: returns.year_2.map(|r| cagr_from_total(r, 2)),
        year_3: returns.year_3.map(|r| cagr_from_total(r, 3)),
        year_4: returns.year_4.map(|r| cagr_from_total(r, 4)),
        year_5: returns.year_5.map(|r| cagr_from_total(r, 5)),
    };
    (returns, cagr)
}
