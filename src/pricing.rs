// ===============================
// src/pricing.rs (quote resolution & mark-to-market)
// ===============================
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};

use crate::domain::{normalize_symbol, AccountSummary, Ledger, Position, PositionView, Quote};

pub const SOURCE_SYNTHETIC: &str = "synthetic";
pub const SOURCE_LAST_MARK: &str = "last-mark";

/// symbol -> mark price (cents)
pub type Marks = HashMap<String, u64>;

/// Deterministic offline price in [$20.00, $520.00): FNV-1a of the normalized symbol.
pub fn pseudo_price_cents(symbol: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in normalize_symbol(symbol).bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    2_000 + h % 50_000
}

/// Last observed price per symbol (fills and live quotes).
#[derive(Debug, Default)]
pub struct MarkBook {
    marks: HashMap<String, (u64, DateTime<Utc>)>,
}

impl MarkBook {
    pub fn record(&mut self, symbol: &str, price_cents: u64, at: DateTime<Utc>) {
        if price_cents == 0 {
            return;
        }
        let e = self.marks.entry(symbol.to_string()).or_insert((price_cents, at));
        if at >= e.1 {
            *e = (price_cents, at);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<(u64, DateTime<Utc>)> {
        self.marks.get(symbol).copied()
    }
}

/// Live/cached price as-is when present, else the last mark, else the pseudo-price.
pub fn resolve_quote(
    symbol: &str,
    live: Option<Quote>,
    last_mark: Option<(u64, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> Quote {
    if let Some(q) = live {
        return q;
    }
    let symbol = normalize_symbol(symbol);
    match last_mark {
        Some((price_cents, at)) => Quote { symbol, price_cents, source: SOURCE_LAST_MARK.into(), as_of: at },
        None => Quote {
            price_cents: pseudo_price_cents(&symbol),
            symbol,
            source: SOURCE_SYNTHETIC.into(),
            as_of: now,
        },
    }
}

pub fn market_value_cents(quantity: f64, mark_cents: u64) -> i64 {
    (quantity * mark_cents as f64).round() as i64
}

pub fn value_position(p: &Position, mark_cents: u64) -> PositionView {
    let value = market_value_cents(p.quantity, mark_cents);
    let cost = market_value_cents(p.quantity, p.avg_price_cents);
    PositionView {
        symbol: p.symbol.clone(),
        quantity: p.quantity,
        avg_price_cents: p.avg_price_cents,
        mark_price_cents: mark_cents,
        market_value_cents: value,
        unrealized_pnl_cents: value - cost,
    }
}

pub fn mark_for(marks: &Marks, symbol: &str) -> u64 {
    marks.get(symbol).copied().unwrap_or_else(|| pseudo_price_cents(symbol))
}

/// equity == cash + sum(round(qty * mark)), recomputed on every call.
pub fn summarize(ledger: &Ledger, marks: &Marks) -> (AccountSummary, Vec<PositionView>) {
    let views: Vec<PositionView> = ledger
        .positions
        .iter()
        .map(|p| value_position(p, mark_for(marks, &p.symbol)))
        .collect();
    let positions_value_cents: i64 = views.iter().map(|v| v.market_value_cents).sum();
    let summary = AccountSummary {
        cash_cents: ledger.cash_cents,
        positions_value_cents,
        equity_cents: ledger.cash_cents + positions_value_cents,
        realized_pnl_cents: ledger.realized_pnl_cents,
        buying_power_cents: ledger.cash_cents.max(0),
    };
    (summary, views)
}
