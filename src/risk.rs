// ===============================
// src/risk.rs
// ===============================
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    AccountSummary, Ledger, OrderStatus, Policy, RiskCode, RiskLevel, RiskSignal, RiskSnapshot,
    Severity, Side, QTY_EPSILON,
};

/// Share of `maxDrawdownPct` at which new risk is blocked.
pub const DRAWDOWN_RESTRICT_FRACTION: f64 = 0.75;
pub const DRAWDOWN_WATCH_FRACTION: f64 = 0.5;
pub const DAILY_LOSS_WATCH_FRACTION: f64 = 0.5;
pub const REJECTIONS_RESTRICT: usize = 6;
pub const REJECTIONS_WATCH: usize = 3;

/// Highest equity seen in history, including the current mark.
pub fn peak_equity(ledger: &Ledger, current_equity: i64) -> i64 {
    ledger
        .equity_history
        .iter()
        .map(|p| p.equity_cents)
        .fold(current_equity, i64::max)
}

pub fn drawdown_pct(peak: i64, current: i64) -> f64 {
    if peak <= 0 {
        return 0.0;
    }
    (((peak - current) as f64 / peak as f64) * 100.0).max(0.0)
}

/// Equity carried into the current UTC day: the last point before midnight,
/// else the first point of today.
pub fn day_start_equity(ledger: &Ledger, now: DateTime<Utc>) -> Option<i64> {
    let today = now.date_naive();
    let history = &ledger.equity_history;
    history
        .iter()
        .rev()
        .find(|p| p.at.date_naive() < today)
        .or_else(|| history.iter().find(|p| p.at.date_naive() == today))
        .map(|p| p.equity_cents)
}

pub fn rejected_within_24h(ledger: &Ledger, now: DateTime<Utc>) -> usize {
    let since = now - Duration::hours(24);
    // orders are newest first
    ledger
        .orders
        .iter()
        .take_while(|o| o.requested_at >= since)
        .filter(|o| o.status == OrderStatus::Rejected)
        .count()
}

/// Recomputed on every call; there is no persisted risk state.
pub fn evaluate(
    policy: &Policy,
    ledger: &Ledger,
    summary: &AccountSummary,
    now: DateTime<Utc>,
) -> RiskSnapshot {
    let mut level = RiskLevel::Ok;
    let mut signals: Vec<RiskSignal> = Vec::new();
    let mut raise = |to: RiskLevel, code: RiskCode, severity: Severity, message: String| {
        if to > level {
            level = to;
        }
        signals.push(RiskSignal { code, severity, message });
    };

    // 1) kill switch
    if policy.kill_switch_enabled {
        raise(
            RiskLevel::Halt,
            RiskCode::KillSwitch,
            Severity::Critical,
            "kill switch enabled: trading halted".into(),
        );
    }

    // 2) drawdown from peak
    let peak = peak_equity(ledger, summary.equity_cents);
    let drawdown = drawdown_pct(peak, summary.equity_cents);
    let dd_limit = policy.max_drawdown_pct;
    if drawdown > dd_limit {
        raise(
            RiskLevel::Halt,
            RiskCode::DrawdownLimit,
            Severity::Critical,
            format!("drawdown {drawdown:.2}% exceeds limit {dd_limit:.2}%"),
        );
    } else if drawdown >= dd_limit * DRAWDOWN_RESTRICT_FRACTION {
        raise(
            RiskLevel::Restrict,
            RiskCode::DrawdownElevated,
            Severity::Warning,
            format!("drawdown {drawdown:.2}% near limit {dd_limit:.2}%: risk-reducing orders only"),
        );
    } else if drawdown >= dd_limit * DRAWDOWN_WATCH_FRACTION {
        raise(
            RiskLevel::Watch,
            RiskCode::DrawdownElevated,
            Severity::Info,
            format!("drawdown {drawdown:.2}% of {dd_limit:.2}% limit"),
        );
    }

    // 3) daily loss vs. equity carried into the day
    let daily_loss_cents = day_start_equity(ledger, now)
        .map(|start| (start - summary.equity_cents).max(0))
        .unwrap_or(0);
    let loss_limit = policy.max_daily_loss_cents;
    if daily_loss_cents >= loss_limit {
        raise(
            RiskLevel::Restrict,
            RiskCode::DailyLossLimit,
            Severity::Warning,
            format!("daily loss {daily_loss_cents}c reached limit {loss_limit}c"),
        );
    } else if daily_loss_cents as f64 >= loss_limit as f64 * DAILY_LOSS_WATCH_FRACTION {
        raise(
            RiskLevel::Watch,
            RiskCode::DailyLossElevated,
            Severity::Info,
            format!("daily loss {daily_loss_cents}c of {loss_limit}c limit"),
        );
    }

    // 4) rejection rate
    let rejected_orders_24h = rejected_within_24h(ledger, now);
    if rejected_orders_24h >= REJECTIONS_RESTRICT {
        raise(
            RiskLevel::Restrict,
            RiskCode::RejectionSpike,
            Severity::Warning,
            format!("{rejected_orders_24h} rejected orders in 24h"),
        );
    } else if rejected_orders_24h >= REJECTIONS_WATCH {
        raise(
            RiskLevel::Watch,
            RiskCode::RejectionsElevated,
            Severity::Info,
            format!("{rejected_orders_24h} rejected orders in 24h"),
        );
    }

    // 5) position count
    if ledger.positions.len() >= policy.max_open_positions {
        raise(
            RiskLevel::Watch,
            RiskCode::PositionCountAtLimit,
            Severity::Info,
            format!("{} open positions (max {})", ledger.positions.len(), policy.max_open_positions),
        );
    }

    RiskSnapshot {
        level,
        can_trade: level != RiskLevel::Halt,
        can_open_new_risk: level < RiskLevel::Restrict,
        drawdown_pct: drawdown,
        daily_loss_cents,
        rejected_orders_24h,
        signals,
    }
}

/// Buying while long/flat or selling while short/flat adds exposure; so does
/// crossing through flat into the opposite direction.
pub fn is_risk_increasing_order(current_qty: f64, side: Side, quantity: f64) -> bool {
    match side {
        Side::Buy => current_qty > -QTY_EPSILON || quantity > -current_qty + QTY_EPSILON,
        Side::Sell => current_qty < QTY_EPSILON || quantity > current_qty + QTY_EPSILON,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EquityPoint, Order, OrderSource, OrderType, Rejection, RejectionCode};

    fn summary(equity: i64) -> AccountSummary {
        AccountSummary {
            cash_cents: equity,
            positions_value_cents: 0,
            equity_cents: equity,
            realized_pnl_cents: 0,
            buying_power_cents: equity,
        }
    }

    fn rejected_order(at: DateTime<Utc>) -> Order {
        Order {
            id: "x".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: 1.0,
            order_type: OrderType::Market,
            limit_price_cents: None,
            status: OrderStatus::Rejected,
            requested_at: at,
            executed_at: None,
            fill_price_cents: None,
            notional_cents: 0,
            reason: Some(Rejection::new(RejectionCode::NotionalCap, "too big")),
            idempotency_key: None,
            source: OrderSource::Api,
        }
    }

    #[test]
    fn clean_ledger_is_ok() {
        let now = Utc::now();
        let ledger = Ledger::new(10_000_000, now);
        let snap = evaluate(&ledger.policy, &ledger, &summary(10_000_000), now);
        assert_eq!(snap.level, RiskLevel::Ok);
        assert!(snap.can_trade && snap.can_open_new_risk);
        assert!(snap.signals.is_empty());
    }

    #[test]
    fn kill_switch_halts_unconditionally() {
        let now = Utc::now();
        let mut ledger = Ledger::new(10_000_000, now);
        ledger.policy.kill_switch_enabled = true;
        let snap = evaluate(&ledger.policy, &ledger, &summary(10_000_000), now);
        assert_eq!(snap.level, RiskLevel::Halt);
        assert!(!snap.can_trade);
        assert_eq!(snap.signals[0].code, RiskCode::KillSwitch);
    }

    #[test]
    fn drawdown_tiers() {
        let now = Utc::now();
        let ledger = Ledger::new(10_000_000, now - Duration::days(2));
        let policy = Policy { max_drawdown_pct: 20.0, ..Policy::default() };

        // 21% down: halt
        let snap = evaluate(&policy, &ledger, &summary(7_900_000), now);
        assert_eq!(snap.level, RiskLevel::Halt);
        assert!((snap.drawdown_pct - 21.0).abs() < 1e-9);

        // 16% down (>= 15%): restrict
        let snap = evaluate(&policy, &ledger, &summary(8_400_000), now);
        assert_eq!(snap.level, RiskLevel::Restrict);
        assert!(snap.can_trade && !snap.can_open_new_risk);

        // 11% down (>= 10%): watch
        let snap = evaluate(&policy, &ledger, &summary(8_900_000), now);
        assert_eq!(snap.level, RiskLevel::Watch);
        assert!(snap.can_open_new_risk);
    }

    #[test]
    fn daily_loss_restricts() {
        let now = Utc::now();
        let mut ledger = Ledger::new(10_000_000, now - Duration::days(3));
        ledger.equity_history.push(EquityPoint { at: now, equity_cents: 10_000_000 });
        let policy = Policy { max_daily_loss_cents: 500_000, max_drawdown_pct: 90.0, ..Policy::default() };
        let snap = evaluate(&policy, &ledger, &summary(9_500_000), now);
        assert_eq!(snap.daily_loss_cents, 500_000);
        assert_eq!(snap.level, RiskLevel::Restrict);
        assert!(snap.signals.iter().any(|s| s.code == RiskCode::DailyLossLimit));
    }

    #[test]
    fn daily_loss_counts_from_previous_close_without_fills_today() {
        let now = Utc::now();
        let mut ledger = Ledger::new(1_000_000, now - Duration::days(3));
        ledger.equity_history.push(EquityPoint { at: now - Duration::days(1), equity_cents: 1_000_000 });
        let policy = Policy { max_daily_loss_cents: 100_000, max_drawdown_pct: 90.0, ..Policy::default() };

        let snap = evaluate(&policy, &ledger, &summary(900_000), now);
        assert_eq!(snap.daily_loss_cents, 100_000);
        assert_eq!(snap.level, RiskLevel::Restrict);
        assert!(snap.signals.iter().any(|s| s.code == RiskCode::DailyLossLimit));

        // a fill later in the day does not reset the baseline
        ledger.equity_history.push(EquityPoint { at: now, equity_cents: 950_000 });
        let snap = evaluate(&policy, &ledger, &summary(900_000), now);
        assert_eq!(snap.daily_loss_cents, 100_000);
    }

    #[test]
    fn day_start_falls_back_to_first_point_today() {
        let now = Utc::now();
        let mut ledger = Ledger::new(1_000_000, now);
        ledger.equity_history.push(EquityPoint { at: now, equity_cents: 1_200_000 });
        assert_eq!(day_start_equity(&ledger, now), Some(1_000_000));
        ledger.equity_history.clear();
        assert_eq!(day_start_equity(&ledger, now), None);
    }

    #[test]
    fn rejections_in_window_are_counted() {
        let now = Utc::now();
        let mut ledger = Ledger::new(10_000_000, now);
        for i in 0..REJECTIONS_RESTRICT {
            ledger.orders.push(rejected_order(now - Duration::minutes(i as i64)));
        }
        // older than 24h: ignored
        ledger.orders.push(rejected_order(now - Duration::hours(30)));
        let snap = evaluate(&ledger.policy, &ledger, &summary(10_000_000), now);
        assert_eq!(snap.rejected_orders_24h, REJECTIONS_RESTRICT);
        assert_eq!(snap.level, RiskLevel::Restrict);
    }

    #[test]
    fn risk_increasing_classification() {
        assert!(is_risk_increasing_order(0.0, Side::Buy, 1.0));
        assert!(is_risk_increasing_order(5.0, Side::Buy, 1.0));
        assert!(!is_risk_increasing_order(5.0, Side::Sell, 5.0));
        assert!(is_risk_increasing_order(5.0, Side::Sell, 6.0));
        assert!(is_risk_increasing_order(0.0, Side::Sell, 1.0));
        assert!(!is_risk_increasing_order(-3.0, Side::Buy, 2.0));
        assert!(is_risk_increasing_order(-3.0, Side::Sell, 1.0));
    }
}
