// ===============================
// src/engine.rs (order execution: validate -> price -> fill)
// ===============================
//
// Stateless per call and unaware of idempotency: `execute` takes the prior
// ledger and returns the next ledger plus the resulting order. Business-rule
// violations come back as a `rejected` order, never as an error.
//
use chrono::{DateTime, Duration, Utc};

use crate::domain::{
    normalize_symbol, AccountSummary, EquityPoint, Ledger, Order, OrderInput, OrderStatus,
    OrderType, PlaceOptions, Policy, Position, Quote, Rejection, RejectionCode, RiskSnapshot,
    Side, MAX_EQUITY_POINTS, MAX_ORDERS, QTY_EPSILON,
};
use crate::pricing::{summarize, Marks};
use crate::risk::{evaluate, is_risk_increasing_order};

/// A new equity point is appended when the last one is this old...
const EQUITY_POINT_MIN_AGE_SECS: i64 = 60;
/// ...or equity moved at least this fraction since it.
const EQUITY_MATERIAL_MOVE: f64 = 0.005;

/// Inputs the engine does not produce itself.
pub struct ExecContext<'a> {
    pub order_id: String,
    pub now: DateTime<Utc>,
    /// Market quote for the order's symbol.
    pub quote: &'a Quote,
    /// Marks for every other held symbol.
    pub marks: &'a Marks,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub ledger: Ledger,
    pub order: Order,
    /// Pre-trade snapshot the order was judged against.
    pub risk: RiskSnapshot,
    pub summary: AccountSummary,
}

type Check = Result<(), Rejection>;

pub fn execute(
    prev: &Ledger,
    input: &OrderInput,
    opts: &PlaceOptions,
    ctx: &ExecContext<'_>,
) -> Execution {
    // 1) normalize
    let symbol = normalize_symbol(&input.symbol);
    let quote_cents = ctx.quote.price_cents;

    // 2) pre-trade marks, summary and risk
    let mut marks = ctx.marks.clone();
    marks.insert(symbol.clone(), quote_cents);
    let (summary, _) = summarize(prev, &marks);
    let risk = evaluate(&prev.policy, prev, &summary, ctx.now);

    // 3) + 4) price resolution and validation, first failure wins
    let current_qty = prev.position_qty(&symbol);
    let outcome = validate(prev, input, &symbol, quote_cents, current_qty, &risk, &summary);

    let mut next = prev.clone();
    next.updated_at = ctx.now;

    let reference_px = match &outcome {
        Ok(px) => *px,
        Err(_) => input.limit_price_cents.filter(|_| input.order_type == OrderType::Limit).unwrap_or(quote_cents),
    };
    let notional_cents = notional(input.quantity.max(0.0), reference_px);

    let order = match outcome {
        Ok(exec_px) => {
            // 5) fill
            apply_fill(&mut next, &symbol, input.side, input.quantity, exec_px, notional_cents);
            marks.insert(symbol.clone(), exec_px);
            let (post, _) = summarize(&next, &marks);
            record_equity(&mut next.equity_history, ctx.now, post.equity_cents);
            build_order(ctx, input, opts, &symbol, OrderStatus::Filled, Some(exec_px), notional_cents, None)
        }
        Err(rejection) => build_order(
            ctx,
            input,
            opts,
            &symbol,
            OrderStatus::Rejected,
            None,
            notional_cents,
            Some(rejection),
        ),
    };

    // 6) history, newest first
    next.orders.insert(0, order.clone());
    next.orders.truncate(MAX_ORDERS);

    Execution { ledger: next, order, risk, summary }
}

fn validate(
    ledger: &Ledger,
    input: &OrderInput,
    symbol: &str,
    quote_cents: u64,
    current_qty: f64,
    risk: &RiskSnapshot,
    summary: &AccountSummary,
) -> Result<u64, Rejection> {
    let policy = &ledger.policy;
    let qty = input.quantity;

    check_can_trade(risk)?;
    let px = resolve_execution_price(input, quote_cents)?;
    check_blocked(policy, symbol)?;
    check_quantity(qty)?;
    let notional_cents = notional(qty, px);
    check_notional_cap(policy, notional_cents)?;
    let increasing = is_risk_increasing_order(current_qty, input.side, qty);
    check_new_risk(risk, increasing)?;
    check_open_positions(policy, ledger, current_qty)?;
    check_cash(input.side, notional_cents, ledger.cash_cents)?;
    check_short(policy, input.side, current_qty, qty)?;
    if increasing {
        check_concentration(policy, current_qty, input.side, qty, px, summary.equity_cents)?;
    }
    Ok(px)
}

pub fn notional(quantity: f64, price_cents: u64) -> i64 {
    (quantity * price_cents as f64).round() as i64
}

/// Market orders fill at the quote; limits only when the quote already satisfies them.
pub fn resolve_execution_price(input: &OrderInput, quote_cents: u64) -> Result<u64, Rejection> {
    match (input.order_type, input.limit_price_cents) {
        (OrderType::Market, _) => Ok(quote_cents),
        (OrderType::Limit, Some(limit)) => {
            let marketable = match input.side {
                Side::Buy => quote_cents <= limit,
                Side::Sell => quote_cents >= limit,
            };
            if marketable {
                Ok(limit)
            } else {
                Err(Rejection::new(
                    RejectionCode::LimitNotMarketable,
                    format!(
                        "limit {} {}c not executable against quote {}c (no resting orders)",
                        input.side.as_str(),
                        limit,
                        quote_cents
                    ),
                ))
            }
        }
        (OrderType::Limit, None) => Err(Rejection::new(
            RejectionCode::LimitNotMarketable,
            "limit order without a limit price",
        )),
    }
}

pub fn check_can_trade(risk: &RiskSnapshot) -> Check {
    if risk.can_trade {
        return Ok(());
    }
    let why = risk
        .signals
        .iter()
        .find(|s| s.severity == crate::domain::Severity::Critical)
        .map(|s| s.message.as_str())
        .unwrap_or("risk level halt");
    Err(Rejection::new(RejectionCode::RiskHalted, format!("trading halted by risk engine: {why}")))
}

pub fn check_blocked(policy: &Policy, symbol: &str) -> Check {
    if policy.is_blocked(symbol) {
        return Err(Rejection::new(RejectionCode::SymbolBlocked, format!("{symbol} is on the block list")));
    }
    Ok(())
}

pub fn check_quantity(qty: f64) -> Check {
    if !qty.is_finite() || qty <= 0.0 {
        return Err(Rejection::new(RejectionCode::InvalidQuantity, format!("quantity must be > 0, got {qty}")));
    }
    Ok(())
}

pub fn check_notional_cap(policy: &Policy, notional_cents: i64) -> Check {
    if notional_cents > policy.max_order_notional_cents {
        return Err(Rejection::new(
            RejectionCode::NotionalCap,
            format!(
                "order notional {}c exceeds max order notional {}c",
                notional_cents, policy.max_order_notional_cents
            ),
        ));
    }
    Ok(())
}

pub fn check_new_risk(risk: &RiskSnapshot, risk_increasing: bool) -> Check {
    if risk_increasing && !risk.can_open_new_risk {
        return Err(Rejection::new(
            RejectionCode::RiskRestricted,
            format!("risk level {}: only risk-reducing orders are allowed", risk.level.as_str()),
        ));
    }
    Ok(())
}

pub fn check_open_positions(policy: &Policy, ledger: &Ledger, current_qty: f64) -> Check {
    let opens_new = current_qty.abs() < QTY_EPSILON;
    if opens_new && ledger.positions.len() >= policy.max_open_positions {
        return Err(Rejection::new(
            RejectionCode::MaxOpenPositions,
            format!("already holding {} positions (max {})", ledger.positions.len(), policy.max_open_positions),
        ));
    }
    Ok(())
}

pub fn check_cash(side: Side, notional_cents: i64, cash_cents: i64) -> Check {
    if side == Side::Buy && notional_cents > cash_cents {
        return Err(Rejection::new(
            RejectionCode::InsufficientCash,
            format!("buy notional {notional_cents}c exceeds available cash {cash_cents}c"),
        ));
    }
    Ok(())
}

pub fn check_short(policy: &Policy, side: Side, current_qty: f64, qty: f64) -> Check {
    let long = current_qty.max(0.0);
    if side == Side::Sell && !policy.allow_short && qty > long + QTY_EPSILON {
        return Err(Rejection::new(
            RejectionCode::InsufficientPosition,
            format!("sell quantity {qty} exceeds long position {long} and shorting is disabled"),
        ));
    }
    Ok(())
}

pub fn check_concentration(
    policy: &Policy,
    current_qty: f64,
    side: Side,
    qty: f64,
    px: u64,
    equity_cents: i64,
) -> Check {
    let resulting = (current_qty + side.sign() * qty).abs();
    let resulting_cents = resulting * px as f64;
    // notional / equity * 100 > pct, kept multiplicative so the boundary is exact
    if equity_cents <= 0 || resulting_cents * 100.0 > policy.max_position_pct * equity_cents as f64 {
        let pct = if equity_cents > 0 { resulting_cents / equity_cents as f64 * 100.0 } else { f64::INFINITY };
        return Err(Rejection::new(
            RejectionCode::PositionConcentration,
            format!(
                "resulting position would be {:.2}% of equity (max {:.2}%)",
                pct, policy.max_position_pct
            ),
        ));
    }
    Ok(())
}

/// Weighted-average cost on adds; realize P&L on the covered quantity when reducing
/// or flipping, carrying any remainder at the execution price.
pub fn apply_fill(ledger: &mut Ledger, symbol: &str, side: Side, qty: f64, px: u64, notional_cents: i64) {
    match side {
        Side::Buy => ledger.cash_cents -= notional_cents,
        Side::Sell => ledger.cash_cents += notional_cents,
    }

    let signed = side.sign() * qty;
    let idx = ledger.positions.iter().position(|p| p.symbol == symbol);
    let (cur_qty, cur_avg) = idx
        .map(|i| (ledger.positions[i].quantity, ledger.positions[i].avg_price_cents))
        .unwrap_or((0.0, 0));

    let (new_qty, new_avg) = if cur_qty.abs() < QTY_EPSILON || cur_qty.signum() == signed.signum() {
        // same direction (or flat) -> weighted average
        let new_qty = cur_qty + signed;
        let avg = if cur_qty.abs() < QTY_EPSILON {
            px
        } else {
            ((cur_qty.abs() * cur_avg as f64 + qty * px as f64) / new_qty.abs()).round() as u64
        };
        (new_qty, avg)
    } else {
        // opposite direction -> realize on the covered part
        let covered = qty.min(cur_qty.abs());
        let pnl = (cur_avg as f64 - px as f64) * covered * side.sign();
        ledger.realized_pnl_cents += pnl.round() as i64;
        let remaining = cur_qty + signed;
        if remaining.abs() < QTY_EPSILON || remaining.signum() == cur_qty.signum() {
            (remaining, cur_avg)
        } else {
            // flipped: the remainder opens at the execution price
            (remaining, px)
        }
    };

    match idx {
        Some(i) if new_qty.abs() < QTY_EPSILON => {
            ledger.positions.remove(i);
        }
        Some(i) => {
            ledger.positions[i].quantity = new_qty;
            ledger.positions[i].avg_price_cents = new_avg;
        }
        None if new_qty.abs() >= QTY_EPSILON => ledger.positions.push(Position {
            symbol: symbol.to_string(),
            quantity: new_qty,
            avg_price_cents: new_avg,
        }),
        None => {}
    }
}

/// At most one point per minute unless equity moved materially; capped, oldest dropped.
pub fn record_equity(history: &mut Vec<EquityPoint>, at: DateTime<Utc>, equity_cents: i64) {
    if let Some(last) = history.last_mut() {
        let young = at - last.at < Duration::seconds(EQUITY_POINT_MIN_AGE_SECS);
        let moved = (equity_cents - last.equity_cents).abs() as f64
            >= last.equity_cents.abs() as f64 * EQUITY_MATERIAL_MOVE;
        if young && !moved {
            last.equity_cents = equity_cents;
            return;
        }
    }
    history.push(EquityPoint { at, equity_cents });
    if history.len() > MAX_EQUITY_POINTS {
        let excess = history.len() - MAX_EQUITY_POINTS;
        history.drain(..excess);
    }
}

#[allow(clippy::too_many_arguments)]
fn build_order(
    ctx: &ExecContext<'_>,
    input: &OrderInput,
    opts: &PlaceOptions,
    symbol: &str,
    status: OrderStatus,
    fill_price_cents: Option<u64>,
    notional_cents: i64,
    reason: Option<Rejection>,
) -> Order {
    Order {
        id: ctx.order_id.clone(),
        symbol: symbol.to_string(),
        side: input.side,
        quantity: input.quantity,
        order_type: input.order_type,
        limit_price_cents: input.limit_price_cents.filter(|_| input.order_type == OrderType::Limit),
        status,
        requested_at: ctx.now,
        executed_at: fill_price_cents.map(|_| ctx.now),
        fill_price_cents,
        notional_cents,
        reason,
        idempotency_key: opts.idempotency_key.clone(),
        source: opts.source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderSource, PolicyPatch, RiskLevel};

    const START: i64 = 10_000_000; // $100,000.00

    fn ledger() -> Ledger {
        Ledger::new(START, Utc::now() - Duration::days(1))
    }

    fn quote(symbol: &str, px: u64) -> Quote {
        Quote { symbol: symbol.into(), price_cents: px, source: "test".into(), as_of: Utc::now() }
    }

    fn run(l: &Ledger, input: OrderInput, px: u64) -> Execution {
        let q = quote(&input.symbol, px);
        let marks = Marks::new();
        let ctx = ExecContext { order_id: "ord-test".into(), now: Utc::now(), quote: &q, marks: &marks };
        execute(l, &input, &PlaceOptions::default(), &ctx)
    }

    fn with_policy(l: &mut Ledger, patch: PolicyPatch) {
        l.policy = l.policy.merged(&patch).unwrap();
    }

    fn code(e: &Execution) -> Option<RejectionCode> {
        e.order.reason.as_ref().map(|r| r.code)
    }

    #[test]
    fn round_trip_realizes_pnl_and_prunes_position() {
        let l = ledger();
        let buy = run(&l, OrderInput::market("aapl", Side::Buy, 10.0), 10_000);
        assert!(buy.order.is_filled());
        assert_eq!(buy.order.symbol, "AAPL");
        let sell = run(&buy.ledger, OrderInput::market("AAPL", Side::Sell, 10.0), 11_000);
        assert!(sell.order.is_filled());
        assert_eq!(sell.ledger.position_qty("AAPL"), 0.0);
        assert!(sell.ledger.position("AAPL").is_none());
        assert_eq!(sell.ledger.realized_pnl_cents, 10 * (11_000 - 10_000));
        assert_eq!(sell.ledger.cash_cents, START + 10_000);
    }

    #[test]
    fn notional_cap_boundary() {
        let l = ledger();
        let over = run(&l, OrderInput::market("NVDA", Side::Buy, 200.0), 13_000);
        assert_eq!(over.order.status, OrderStatus::Rejected);
        assert_eq!(code(&over), Some(RejectionCode::NotionalCap));
        assert!(over.order.reason.as_ref().unwrap().message.contains("max order notional"));
        assert_eq!(over.order.notional_cents, 2_600_000);
        assert_eq!(over.ledger.cash_cents, START);

        let under = run(&l, OrderInput::market("NVDA", Side::Buy, 190.0), 13_000);
        assert!(under.order.is_filled());
        assert_eq!(under.order.notional_cents, 2_470_000);
    }

    #[test]
    fn position_cap_boundary() {
        let mut l = ledger();
        with_policy(&mut l, PolicyPatch { max_order_notional_cents: Some(10_000_000), ..Default::default() });

        let exact = run(&l, OrderInput::market("MSFT", Side::Buy, 350.0), 10_000);
        assert!(exact.order.is_filled(), "{:?}", exact.order.reason);

        let over = run(&l, OrderInput::market("MSFT", Side::Buy, 351.0), 10_000);
        assert_eq!(code(&over), Some(RejectionCode::PositionConcentration));
    }

    #[test]
    fn kill_switch_rejects_everything_until_cleared() {
        let mut l = run(&ledger(), OrderInput::market("AAPL", Side::Buy, 5.0), 10_000).ledger;
        with_policy(&mut l, PolicyPatch { kill_switch_enabled: Some(true), ..Default::default() });

        for input in [
            OrderInput::market("AAPL", Side::Buy, 1.0),
            OrderInput::market("AAPL", Side::Sell, 1.0),
            OrderInput::limit("MSFT", Side::Buy, 1.0, 1),
        ] {
            let e = run(&l, input, 10_000);
            assert_eq!(code(&e), Some(RejectionCode::RiskHalted));
            assert_eq!(e.risk.level, RiskLevel::Halt);
            assert!(e.order.reason.unwrap().message.contains("kill switch"));
        }

        with_policy(&mut l, PolicyPatch { kill_switch_enabled: Some(false), ..Default::default() });
        assert!(run(&l, OrderInput::market("AAPL", Side::Sell, 1.0), 10_000).order.is_filled());
    }

    #[test]
    fn validation_order_and_codes() {
        let mut l = ledger();
        with_policy(&mut l, PolicyPatch { blocked_symbols: Some(vec!["GME".into()]), ..Default::default() });

        assert_eq!(code(&run(&l, OrderInput::market("gme", Side::Buy, 1.0), 2_000)), Some(RejectionCode::SymbolBlocked));
        // blocked beats invalid quantity
        assert_eq!(code(&run(&l, OrderInput::market("GME", Side::Buy, 0.0), 2_000)), Some(RejectionCode::SymbolBlocked));
        assert_eq!(code(&run(&l, OrderInput::market("AAPL", Side::Buy, 0.0), 2_000)), Some(RejectionCode::InvalidQuantity));
        assert_eq!(code(&run(&l, OrderInput::market("AAPL", Side::Buy, -3.0), 2_000)), Some(RejectionCode::InvalidQuantity));
        assert_eq!(code(&run(&l, OrderInput::market("AAPL", Side::Sell, 1.0), 2_000)), Some(RejectionCode::InsufficientPosition));
    }

    #[test]
    fn limit_orders_fill_only_when_marketable() {
        let l = ledger();
        let ok = run(&l, OrderInput::limit("AAPL", Side::Buy, 2.0, 10_500), 10_000);
        assert!(ok.order.is_filled());
        assert_eq!(ok.order.fill_price_cents, Some(10_500));

        let no = run(&l, OrderInput::limit("AAPL", Side::Buy, 2.0, 9_500), 10_000);
        assert_eq!(code(&no), Some(RejectionCode::LimitNotMarketable));
        assert_eq!(no.ledger.positions.len(), 0);

        let held = ok.ledger;
        let sell_no = run(&held, OrderInput::limit("AAPL", Side::Sell, 1.0, 10_100), 10_000);
        assert_eq!(code(&sell_no), Some(RejectionCode::LimitNotMarketable));
        let sell_ok = run(&held, OrderInput::limit("AAPL", Side::Sell, 1.0, 9_900), 10_000);
        assert!(sell_ok.order.is_filled());
    }

    #[test]
    fn insufficient_cash() {
        let l = Ledger::new(50_000, Utc::now() - Duration::days(1));
        let e = run(&l, OrderInput::market("AAPL", Side::Buy, 6.0), 10_000);
        assert_eq!(code(&e), Some(RejectionCode::InsufficientCash));
    }

    #[test]
    fn weighted_average_on_adds() {
        let l = ledger();
        let a = run(&l, OrderInput::market("AAPL", Side::Buy, 10.0), 10_000).ledger;
        let b = run(&a, OrderInput::market("AAPL", Side::Buy, 30.0), 12_000).ledger;
        let p = b.position("AAPL").unwrap();
        assert_eq!(p.quantity, 40.0);
        assert_eq!(p.avg_price_cents, 11_500);
        // partial reduce keeps the basis
        let c = run(&b, OrderInput::market("AAPL", Side::Sell, 15.0), 13_000).ledger;
        assert_eq!(c.position("AAPL").unwrap().avg_price_cents, 11_500);
        assert_eq!(c.realized_pnl_cents, 15 * (13_000 - 11_500));
    }

    #[test]
    fn short_cover_and_flip() {
        let mut l = ledger();
        with_policy(&mut l, PolicyPatch { allow_short: Some(true), ..Default::default() });

        let short = run(&l, OrderInput::market("TSLA", Side::Sell, 10.0), 20_000);
        assert!(short.order.is_filled());
        assert_eq!(short.ledger.position_qty("TSLA"), -10.0);
        assert_eq!(short.ledger.cash_cents, START + 200_000);

        // cover 4 at a lower price: gain on the covered part
        let partial = run(&short.ledger, OrderInput::market("TSLA", Side::Buy, 4.0), 18_000);
        assert_eq!(partial.ledger.realized_pnl_cents, 4 * 2_000);
        assert_eq!(partial.ledger.position_qty("TSLA"), -6.0);
        assert_eq!(partial.ledger.position("TSLA").unwrap().avg_price_cents, 20_000);

        // second cover flips to long 4 at the execution price
        let flip = run(&partial.ledger, OrderInput::market("TSLA", Side::Buy, 10.0), 19_000);
        assert!(flip.order.is_filled(), "{:?}", flip.order.reason);
        assert_eq!(flip.ledger.realized_pnl_cents, 4 * 2_000 + 6 * 1_000);
        let p = flip.ledger.position("TSLA").unwrap();
        assert_eq!(p.quantity, 4.0);
        assert_eq!(p.avg_price_cents, 19_000);
    }

    #[test]
    fn exact_flip_to_zero_removes_position() {
        let mut l = ledger();
        with_policy(&mut l, PolicyPatch { allow_short: Some(true), ..Default::default() });
        let short = run(&l, OrderInput::market("TSLA", Side::Sell, 0.3), 20_000).ledger;
        let a = run(&short, OrderInput::market("TSLA", Side::Buy, 0.1), 21_000).ledger;
        let b = run(&a, OrderInput::market("TSLA", Side::Buy, 0.2), 21_000).ledger;
        assert!(b.position("TSLA").is_none());
        assert!(b.positions.iter().all(|p| p.quantity.abs() >= QTY_EPSILON));
        assert_eq!(b.realized_pnl_cents, -300);
    }

    #[test]
    fn restrict_blocks_only_risk_increasing() {
        let held = run(&ledger(), OrderInput::market("AAPL", Side::Buy, 10.0), 10_000).ledger;
        let mut l = held.clone();
        // six rejections in the last day -> restrict
        for i in 0..6 {
            l = run(&l, OrderInput::market("AAPL", Side::Buy, 0.0), 10_000).ledger;
            assert_eq!(l.orders[0].status, OrderStatus::Rejected, "seed {i}");
        }
        let add = run(&l, OrderInput::market("AAPL", Side::Buy, 1.0), 10_000);
        assert_eq!(add.risk.level, RiskLevel::Restrict);
        assert_eq!(code(&add), Some(RejectionCode::RiskRestricted));
        let reduce = run(&l, OrderInput::market("AAPL", Side::Sell, 5.0), 10_000);
        assert!(reduce.order.is_filled());
    }

    #[test]
    fn max_open_positions() {
        let mut l = ledger();
        with_policy(&mut l, PolicyPatch { max_open_positions: Some(2), ..Default::default() });
        let l = run(&l, OrderInput::market("AAA", Side::Buy, 1.0), 1_000).ledger;
        let l = run(&l, OrderInput::market("BBB", Side::Buy, 1.0), 1_000).ledger;
        let third = run(&l, OrderInput::market("CCC", Side::Buy, 1.0), 1_000);
        assert_eq!(code(&third), Some(RejectionCode::MaxOpenPositions));
        // adding to an existing one is fine
        assert!(run(&l, OrderInput::market("AAA", Side::Buy, 1.0), 1_000).order.is_filled());
    }

    #[test]
    fn equity_identity_holds_after_fills() {
        let mut l = ledger();
        with_policy(&mut l, PolicyPatch { allow_short: Some(true), ..Default::default() });
        let l = run(&l, OrderInput::market("AAPL", Side::Buy, 12.5), 18_333).ledger;
        let l = run(&l, OrderInput::market("TSLA", Side::Sell, 3.25), 17_777).ledger;
        let mut marks = Marks::new();
        marks.insert("AAPL".into(), 19_001);
        marks.insert("TSLA".into(), 16_999);
        let (s, views) = summarize(&l, &marks);
        let by_hand: i64 = views.iter().map(|v| (v.quantity * v.mark_price_cents as f64).round() as i64).sum();
        assert_eq!(s.equity_cents, s.cash_cents + by_hand);
    }

    #[test]
    fn rejected_orders_are_recorded_without_touching_balances() {
        let l = ledger();
        let e = run(&l, OrderInput::market("AAPL", Side::Buy, 1_000_000.0), 10_000);
        assert_eq!(e.ledger.cash_cents, l.cash_cents);
        assert_eq!(e.ledger.positions, l.positions);
        assert_eq!(e.ledger.orders.len(), 1);
        assert_eq!(e.order.source, OrderSource::Api);
        assert!(e.order.executed_at.is_none());
    }

    #[test]
    fn order_history_is_capped_newest_first() {
        let mut l = ledger();
        let template = run(&l, OrderInput::market("AAPL", Side::Buy, 0.0), 100).order;
        l.orders = (0..MAX_ORDERS)
            .rev()
            .map(|i| Order { id: format!("old-{i}"), ..template.clone() })
            .collect();
        let e = run(&l, OrderInput::market("AAPL", Side::Buy, 0.0), 100);
        assert_eq!(e.ledger.orders.len(), MAX_ORDERS);
        assert_eq!(e.ledger.orders[0].id, "ord-test");
        assert_eq!(e.ledger.orders.last().unwrap().id, "old-1");
    }

    #[test]
    fn equity_points_coalesce_within_a_minute() {
        let t0 = Utc::now();
        let mut h = vec![EquityPoint { at: t0, equity_cents: 1_000_000 }];
        record_equity(&mut h, t0 + Duration::seconds(10), 1_000_100);
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].equity_cents, 1_000_100);
        // material move
        record_equity(&mut h, t0 + Duration::seconds(20), 1_100_000);
        assert_eq!(h.len(), 2);
        // a minute later
        record_equity(&mut h, t0 + Duration::seconds(120), 1_100_001);
        assert_eq!(h.len(), 3);
    }
}
