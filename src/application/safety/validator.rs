use crate::domain::safety::{SafetyLimits, SafetyRule};
use crate::domain::trading::{AccountSnapshot, Position, Signal, SignalAction, SignalIntent};
use rust_decimal::Decimal;

/// Returns series for the correlation check: the candidate symbol's log
/// returns plus one series per distinct open-position symbol. A series that
/// could not be computed (insufficient history) is simply absent and
/// contributes correlation 0.
pub struct CorrelationInputs<'a> {
    pub candidate: Option<&'a [f64]>,
    pub open_symbols: &'a [(String, Vec<f64>)],
}

impl CorrelationInputs<'_> {
    pub fn empty() -> CorrelationInputs<'static> {
        CorrelationInputs {
            candidate: None,
            open_symbols: &[],
        }
    }
}

/// Everything the pre-trade validator looks at. Snapshots only; the
/// validator never mutates state.
pub struct ValidationContext<'a> {
    pub signal: &'a Signal,
    pub account: &'a AccountSnapshot,
    pub positions: &'a [Position],
    pub limits: &'a SafetyLimits,
    /// Realized + unrealized PnL since the UTC day anchor
    pub daily_pnl: Decimal,
    pub peak_equity: Decimal,
    /// Current price of the candidate symbol, for exposure projection
    pub candidate_price: Decimal,
    pub correlation: CorrelationInputs<'a>,
}

/// Pure pre-trade validation. `Ok(())` accepts; `Err` carries the
/// structured rule that rejected.
///
/// Close and modify signals always pass: they only ever reduce or maintain
/// risk, and blocking an exit under a breached limit would be
/// counterproductive.
pub fn validate_signal(ctx: &ValidationContext<'_>) -> Result<(), SafetyRule> {
    if ctx.signal.intent() != SignalIntent::Open {
        return Ok(());
    }
    let volume = match &ctx.signal.action {
        SignalAction::Open { volume, .. } => *volume,
        _ => return Ok(()),
    };
    let limits = ctx.limits;

    if volume > limits.max_lot_size {
        return Err(SafetyRule::LotSize {
            requested: volume,
            limit: limits.max_lot_size,
        });
    }

    if ctx.positions.len() + 1 > limits.max_open_positions {
        return Err(SafetyRule::OpenPositions {
            current: ctx.positions.len(),
            limit: limits.max_open_positions,
        });
    }

    let current_exposure: Decimal = ctx.positions.iter().map(|p| p.exposure()).sum();
    let projected = current_exposure + volume * ctx.candidate_price;
    if projected > limits.max_total_exposure {
        return Err(SafetyRule::TotalExposure {
            projected,
            limit: limits.max_total_exposure,
        });
    }

    let pct_loss_limit = ctx.account.balance * limits.max_daily_loss_pct / Decimal::ONE_HUNDRED;
    let daily_loss_limit = limits.max_daily_loss.min(pct_loss_limit);
    if ctx.daily_pnl < -daily_loss_limit {
        return Err(SafetyRule::DailyLoss {
            loss: ctx.daily_pnl,
            limit: daily_loss_limit,
        });
    }

    let drawdown = ctx.peak_equity - ctx.account.equity;
    let pct_drawdown_limit = ctx.peak_equity * limits.max_drawdown_pct / Decimal::ONE_HUNDRED;
    let drawdown_limit = limits.max_drawdown.min(pct_drawdown_limit);
    if drawdown > drawdown_limit {
        return Err(SafetyRule::Drawdown {
            drawdown,
            limit: drawdown_limit,
        });
    }

    if let Some(candidate) = ctx.correlation.candidate {
        for (symbol, series) in ctx.correlation.open_symbols {
            if let Some(corr) = pearson(candidate, series)
                && corr.abs() > limits.max_correlation
            {
                return Err(SafetyRule::Correlation {
                    symbol: symbol.clone(),
                    correlation: corr,
                    limit: limits.max_correlation,
                });
            }
        }
    }

    Ok(())
}

/// Pearson correlation over the overlapping tail of two series.
/// `None` for degenerate inputs (too short, zero variance).
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    let corr = cov / (var_a.sqrt() * var_b.sqrt());
    corr.is_finite().then_some(corr)
}
