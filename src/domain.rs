// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Quantities with a smaller magnitude are flat; such positions are pruned.
pub const QTY_EPSILON: f64 = 1e-8;
/// Order history cap (newest first).
pub const MAX_ORDERS: usize = 5000;
/// Equity history cap (oldest dropped).
pub const MAX_EQUITY_POINTS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSource {
    Ui,
    #[default]
    Api,
    Auto,
}

// ---------- Rejections ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    RiskHalted,
    SymbolBlocked,
    InvalidQuantity,
    LimitNotMarketable,
    NotionalCap,
    RiskRestricted,
    MaxOpenPositions,
    InsufficientCash,
    InsufficientPosition,
    PositionConcentration,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::RiskHalted => "risk_halted",
            RejectionCode::SymbolBlocked => "symbol_blocked",
            RejectionCode::InvalidQuantity => "invalid_quantity",
            RejectionCode::LimitNotMarketable => "limit_not_marketable",
            RejectionCode::NotionalCap => "notional_cap",
            RejectionCode::RiskRestricted => "risk_restricted",
            RejectionCode::MaxOpenPositions => "max_open_positions",
            RejectionCode::InsufficientCash => "insufficient_cash",
            RejectionCode::InsufficientPosition => "insufficient_position",
            RejectionCode::PositionConcentration => "position_concentration",
        }
    }
}

/// Why an order was not filled. Carried on the order, never raised as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

// ---------- Orders ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price_cents: Option<u64>,
    pub status: OrderStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_price_cents: Option<u64>,
    pub notional_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub source: OrderSource,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

/// Caller-supplied order request, validated at the boundary before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInput {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    #[serde(rename = "type", default)]
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price_cents: Option<u64>,
}

impl OrderInput {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price_cents: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, quantity: f64, limit_price_cents: u64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            order_type: OrderType::Limit,
            limit_price_cents: Some(limit_price_cents),
        }
    }

    /// Schema checks only; business limits (quantity > 0, caps, ...) are the engine's job.
    pub fn validate(&self) -> Result<()> {
        let symbol = normalize_symbol(&self.symbol);
        if !is_valid_symbol(&symbol) {
            return Err(Error::InvalidInput(format!("invalid symbol {:?}", self.symbol)));
        }
        if !self.quantity.is_finite() {
            return Err(Error::InvalidInput("quantity must be a finite number".into()));
        }
        match (self.order_type, self.limit_price_cents) {
            (OrderType::Limit, None) | (OrderType::Limit, Some(0)) => Err(Error::InvalidInput(
                "limit orders require a positive limitPriceCents".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceOptions {
    pub idempotency_key: Option<String>,
    pub source: OrderSource,
}

pub fn validate_idempotency_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 128 || !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(Error::InvalidInput(
            "idempotency key must be 1..=128 printable ASCII characters".into(),
        ));
    }
    Ok(())
}

pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn is_valid_symbol(sym: &str) -> bool {
    !sym.is_empty()
        && sym.len() <= 15
        && sym
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-')
}

// ---------- Ledger ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    pub max_position_pct: f64,
    pub max_order_notional_cents: i64,
    pub allow_short: bool,
    pub blocked_symbols: Vec<String>,
    pub max_open_positions: usize,
    pub max_daily_loss_cents: i64,
    pub max_drawdown_pct: f64,
    pub kill_switch_enabled: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_position_pct: 35.0,
            max_order_notional_cents: 2_500_000,
            allow_short: false,
            blocked_symbols: Vec::new(),
            max_open_positions: 12,
            max_daily_loss_cents: 500_000,
            max_drawdown_pct: 20.0,
            kill_switch_enabled: false,
        }
    }
}

impl Policy {
    pub fn is_blocked(&self, symbol: &str) -> bool {
        self.blocked_symbols.iter().any(|s| s == symbol)
    }

    /// Replace-with-merge: fields present in the patch win, the rest are kept.
    pub fn merged(&self, patch: &PolicyPatch) -> Result<Policy> {
        let mut next = self.clone();
        if let Some(v) = patch.max_position_pct {
            if !(v > 0.0 && v <= 100.0) {
                return Err(Error::InvalidInput("maxPositionPct must be in (0, 100]".into()));
            }
            next.max_position_pct = v;
        }
        if let Some(v) = patch.max_order_notional_cents {
            if v <= 0 {
                return Err(Error::InvalidInput("maxOrderNotionalCents must be > 0".into()));
            }
            next.max_order_notional_cents = v;
        }
        if let Some(v) = patch.allow_short {
            next.allow_short = v;
        }
        if let Some(list) = &patch.blocked_symbols {
            let mut out: Vec<String> = Vec::with_capacity(list.len());
            for raw in list {
                let sym = normalize_symbol(raw);
                if sym.is_empty() {
                    continue;
                }
                if !is_valid_symbol(&sym) {
                    return Err(Error::InvalidInput(format!("invalid blocked symbol {raw:?}")));
                }
                if !out.contains(&sym) {
                    out.push(sym);
                }
            }
            next.blocked_symbols = out;
        }
        if let Some(v) = patch.max_open_positions {
            if !(1..=500).contains(&v) {
                return Err(Error::InvalidInput("maxOpenPositions must be in 1..=500".into()));
            }
            next.max_open_positions = v;
        }
        if let Some(v) = patch.max_daily_loss_cents {
            if v <= 0 {
                return Err(Error::InvalidInput("maxDailyLossCents must be > 0".into()));
            }
            next.max_daily_loss_cents = v;
        }
        if let Some(v) = patch.max_drawdown_pct {
            if !(v > 0.0 && v <= 100.0) {
                return Err(Error::InvalidInput("maxDrawdownPct must be in (0, 100]".into()));
            }
            next.max_drawdown_pct = v;
        }
        if let Some(v) = patch.kill_switch_enabled {
            next.kill_switch_enabled = v;
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyPatch {
    pub max_position_pct: Option<f64>,
    pub max_order_notional_cents: Option<i64>,
    pub allow_short: Option<bool>,
    pub blocked_symbols: Option<Vec<String>>,
    pub max_open_positions: Option<usize>,
    pub max_daily_loss_cents: Option<i64>,
    pub max_drawdown_pct: Option<f64>,
    pub kill_switch_enabled: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub at: DateTime<Utc>,
    pub equity_cents: i64,
}

/// Aggregate root. Mutated only through `engine::execute` (fills) and policy replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub cash_cents: i64,
    pub realized_pnl_cents: i64,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub equity_history: Vec<EquityPoint>,
    pub updated_at: DateTime<Utc>,
}

impl Ledger {
    pub fn new(starting_cash_cents: i64, now: DateTime<Utc>) -> Self {
        Self {
            cash_cents: starting_cash_cents,
            realized_pnl_cents: 0,
            policy: Policy::default(),
            positions: Vec::new(),
            orders: Vec::new(),
            equity_history: vec![EquityPoint { at: now, equity_cents: starting_cash_cents }],
            updated_at: now,
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn position_qty(&self, symbol: &str) -> f64 {
        self.position(symbol).map(|p| p.quantity).unwrap_or(0.0)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Option<&Order> {
        // Newest first; the oldest match is the first acceptance.
        self.orders
            .iter()
            .rev()
            .find(|o| o.idempotency_key.as_deref() == Some(key))
    }
}

// ---------- Derived views ----------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub cash_cents: i64,
    pub positions_value_cents: i64,
    pub equity_cents: i64,
    pub realized_pnl_cents: i64,
    pub buying_power_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price_cents: u64,
    pub mark_price_cents: u64,
    pub market_value_cents: i64,
    pub unrealized_pnl_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub price_cents: u64,
    /// e.g. "finnhub-live", "alphavantage-delayed", "last-mark", "synthetic"
    pub source: String,
    pub as_of: DateTime<Utc>,
}

// ---------- Risk ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Ok,
    Watch,
    Restrict,
    Halt,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Ok => "ok",
            RiskLevel::Watch => "watch",
            RiskLevel::Restrict => "restrict",
            RiskLevel::Halt => "halt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCode {
    KillSwitch,
    DrawdownLimit,
    DrawdownElevated,
    DailyLossLimit,
    DailyLossElevated,
    RejectionSpike,
    RejectionsElevated,
    PositionCountAtLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSignal {
    pub code: RiskCode,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSnapshot {
    pub level: RiskLevel,
    pub can_trade: bool,
    pub can_open_new_risk: bool,
    pub drawdown_pct: f64,
    pub daily_loss_cents: i64,
    pub rejected_orders_24h: usize,
    pub signals: Vec<RiskSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub account: AccountSummary,
    pub policy: Policy,
    pub positions: Vec<PositionView>,
    pub recent_orders: Vec<Order>,
    pub risk: RiskSnapshot,
}

// ---------- Audit ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditKind {
    OrderExecuted,
    OrderIdempotentReplay,
    PolicyUpdated,
}

/// One line of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OrderSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notional_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

impl AuditEvent {
    pub fn for_order(kind: AuditKind, ts: DateTime<Utc>, order: &Order, risk: Option<RiskLevel>) -> Self {
        Self {
            ts,
            kind,
            order_id: Some(order.id.clone()),
            idempotency_key: order.idempotency_key.clone(),
            source: Some(order.source),
            status: Some(order.status),
            symbol: Some(order.symbol.clone()),
            side: Some(order.side),
            quantity: Some(order.quantity),
            notional_cents: Some(order.notional_cents),
            reason: order.reason.as_ref().map(|r| r.message.clone()),
            risk_level: risk,
        }
    }

    pub fn policy_updated(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            kind: AuditKind::PolicyUpdated,
            order_id: None,
            idempotency_key: None,
            source: None,
            status: None,
            symbol: None,
            side: None,
            quantity: None,
            notional_cents: None,
            reason: None,
            risk_level: None,
        }
    }
}
