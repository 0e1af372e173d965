use crate::models::{Trade, TradeType};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

const RISK_FREE_ANNUAL: f64 = 0.02;
const TRADING_DAYS: f64 = 252.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_cost: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSummary {
    pub total_trades: usize,
    pub total_value: Decimal,
    pub win_rate: f64,
    pub total_pnl: Decimal,
    pub sharpe_ratio: f64,
    pub open_positions: Vec<OpenPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub volatility: f64,
    pub var_95: f64,
}

/// One sell matched against earlier buys.
#[derive(Debug, Clone)]
struct ClosedLot {
    pnl: Decimal,
    cost_basis: Decimal,
}

impl ClosedLot {
    fn return_fraction(&self) -> Option<f64> {
        if self.cost_basis.is_zero() {
            return None;
        }
        (self.pnl / self.cost_basis).to_f64()
    }
}

struct Ledger {
    closed: Vec<ClosedLot>,
    open: BTreeMap<String, VecDeque<(Decimal, Decimal)>>,
}

/// Replay trades in time order, matching sells against buys FIFO.
/// Sell quantity beyond the open position is ignored.
fn replay(trades: &[Trade]) -> Ledger {
    let mut open: BTreeMap<String, VecDeque<(Decimal, Decimal)>> = BTreeMap::new();
    let mut closed = Vec::new();

    for trade in trades {
        let qty = Decimal::from_f64(trade.quantity).unwrap_or_default();
        let price = Decimal::from_f64(trade.price).unwrap_or_default();
        let lots = open.entry(trade.symbol.clone()).or_default();

        match trade.trade_type {
            TradeType::Buy => lots.push_back((qty, price)),
            TradeType::Sell => {
                let mut remaining = qty;
                let mut cost = Decimal::ZERO;
                let mut matched = Decimal::ZERO;

                while remaining > Decimal::ZERO {
                    let Some(front) = lots.front_mut() else { break };
                    let take = remaining.min(front.0);
                    cost += take * front.1;
                    matched += take;
                    remaining -= take;
                    front.0 -= take;
                    if front.0.is_zero() {
                        lots.pop_front();
                    }
                }

                if remaining > Decimal::ZERO {
                    tracing::debug!(
                        trade_id = trade.id,
                        "Sell of {} exceeds open {} position by {}",
                        qty,
                        trade.symbol,
                        remaining
                    );
                }
                if !matched.is_zero() {
                    closed.push(ClosedLot {
                        pnl: matched * price - cost,
                        cost_basis: cost,
                    });
                }
            }
        }
    }

    Ledger { closed, open }
}

/// Portfolio summary over a user's trades, which must be in chronological order.
pub fn summarize(trades: &[Trade]) -> TradeSummary {
    let total_value: Decimal = trades
        .iter()
        .map(|t| {
            Decimal::from_f64(t.quantity).unwrap_or_default()
                * Decimal::from_f64(t.price).unwrap_or_default()
        })
        .sum();

    let ledger = replay(trades);
    let total_pnl: Decimal = ledger.closed.iter().map(|c| c.pnl).sum();
    let wins = ledger.closed.iter().filter(|c| c.pnl > Decimal::ZERO).count();
    let win_rate = if ledger.closed.is_empty() {
        0.0
    } else {
        wins as f64 / ledger.closed.len() as f64 * 100.0
    };

    let returns: Vec<f64> = ledger.closed.iter().filter_map(ClosedLot::return_fraction).collect();

    let open_positions = ledger
        .open
        .into_iter()
        .filter_map(|(symbol, lots)| {
            let quantity: Decimal = lots.iter().map(|(q, _)| *q).sum();
            if quantity.is_zero() {
                return None;
            }
            let cost: Decimal = lots.iter().map(|(q, p)| *q * *p).sum();
            Some(OpenPosition {
                symbol,
                quantity,
                average_cost: (cost / quantity).round_dp(4),
            })
        })
        .collect();

    TradeSummary {
        total_trades: trades.len(),
        total_value: total_value.round_dp(2),
        win_rate: round(win_rate, 2),
        total_pnl: total_pnl.round_dp(2),
        sharpe_ratio: round(sharpe_ratio(&returns).unwrap_or(0.0), 4),
        open_positions,
    }
}

/// Risk metrics over the returns of closed positions. Zero when there is
/// not enough history for a metric.
pub fn risk_metrics(trades: &[Trade]) -> RiskMetrics {
    let returns: Vec<f64> = replay(trades)
        .closed
        .iter()
        .filter_map(ClosedLot::return_fraction)
        .collect();

    let mut equity = Vec::with_capacity(returns.len() + 1);
    equity.push(1.0);
    for r in &returns {
        let last = equity[equity.len() - 1];
        equity.push(last * (1.0 + r));
    }

    RiskMetrics {
        max_drawdown: round(max_drawdown(&equity), 4),
        sharpe_ratio: round(sharpe_ratio(&returns).unwrap_or(0.0), 4),
        volatility: round(volatility(&returns).unwrap_or(0.0), 4),
        var_95: round(var_historical(&returns, 0.95).unwrap_or(0.0), 4),
    }
}

fn round(value: f64, dp: i32) -> f64 {
    let factor = 10f64.powi(dp);
    (value * factor).round() / factor
}

fn mean_and_sample_std(returns: &[f64]) -> Option<(f64, f64)> {
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, variance.sqrt()))
}

/// Annualized: (mean - rf_daily) / std * sqrt(252).
fn sharpe_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 3 {
        return None;
    }
    let (mean, std_dev) = mean_and_sample_std(returns)?;
    if std_dev < 1e-12 {
        return None;
    }
    Some((mean - RISK_FREE_ANNUAL / TRADING_DAYS) / std_dev * TRADING_DAYS.sqrt())
}

fn volatility(returns: &[f64]) -> Option<f64> {
    mean_and_sample_std(returns).map(|(_, std_dev)| std_dev * TRADING_DAYS.sqrt())
}

/// Largest peak-to-trough fall as a positive fraction.
fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;
    for &v in values {
        peak = peak.max(v);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - v) / peak);
        }
    }
    max_dd
}

/// Historical VaR, returned as a positive loss fraction.
fn var_historical(returns: &[f64], confidence: f64) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((1.0 - confidence) * sorted.len() as f64).floor() as usize;
    Some(-sorted[idx.min(sorted.len() - 1)])
}
