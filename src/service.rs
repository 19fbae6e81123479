// ===============================
// src/service.rs (public operations)
// ===============================
//
// getOverview / placeOrder / getPolicy / updatePolicy / getQuotes.
// Quote resolution: router (live or cached) -> last mark -> pseudo-price.
// Network I/O happens before the writer lock is taken; marks for already held
// symbols are resolved cache-only inside the lock.
//
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    is_valid_symbol, normalize_symbol, validate_idempotency_key, Ledger, Order, OrderInput,
    Overview, PlaceOptions, Policy, PolicyPatch, Quote, RiskLevel,
};
use crate::engine::{execute, ExecContext};
use crate::error::{Error, Result};
use crate::feed::CredentialScope;
use crate::metrics;
use crate::pricing::{resolve_quote, summarize, MarkBook, Marks};
use crate::risk::evaluate;
use crate::router::{MarketDataRouter, RoutedContext};
use crate::store::{Commit, LedgerStore};

/// Orders returned in the overview.
pub const RECENT_ORDERS: usize = 50;
/// Symbols accepted per quotes request.
pub const MAX_QUOTE_SYMBOLS: usize = 25;

pub struct PaperTradingService {
    store: LedgerStore,
    router: MarketDataRouter,
    scope: CredentialScope,
    marks: Mutex<MarkBook>,
}

impl PaperTradingService {
    pub fn new(store: LedgerStore, router: MarketDataRouter, scope: CredentialScope) -> Self {
        Self { store, router, scope, marks: Mutex::new(MarkBook::default()) }
    }

    /// Store + router wired from configuration.
    pub async fn open(cfg: &AppConfig) -> Result<Arc<Self>> {
        let store = LedgerStore::open(&cfg.store).await?;
        let router = MarketDataRouter::from_config(cfg)?;
        Ok(Arc::new(Self::new(store, router, CredentialScope::new())))
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn router(&self) -> &MarketDataRouter {
        &self.router
    }

    pub async fn overview(&self) -> Overview {
        let ledger = self.store.snapshot().await;
        let now = Utc::now();
        let marks = self.cached_marks(&ledger);
        let (account, positions) = summarize(&ledger, &marks);
        let risk = evaluate(&ledger.policy, &ledger, &account, now);

        metrics::EQUITY_CENTS.set(account.equity_cents);
        metrics::CASH_CENTS.set(account.cash_cents);
        metrics::OPEN_POSITIONS.set(ledger.positions.len() as i64);
        metrics::RISK_LEVEL.set(risk_gauge(risk.level));

        Overview {
            account,
            policy: ledger.policy.clone(),
            positions,
            recent_orders: ledger.orders.iter().take(RECENT_ORDERS).cloned().collect(),
            risk,
        }
    }

    /// Always returns an order for a well-formed request; rejections are data.
    pub async fn place_order(&self, input: OrderInput, opts: PlaceOptions) -> Result<Order> {
        // 1) boundary validation
        input.validate()?;
        if let Some(key) = opts.idempotency_key.as_deref() {
            validate_idempotency_key(key)?;
        }
        let symbol = normalize_symbol(&input.symbol);

        // 2) quote outside the lock (skipped for a known replay)
        let known = match opts.idempotency_key.as_deref() {
            Some(k) => self.store.find_by_idempotency_key(k).await.is_some(),
            None => false,
        };
        let quote = if known { self.cached_quote(&symbol) } else { self.fetch_quote(&symbol).await };

        // 3) check-then-act under the writer lock
        let order_id = new_order_id();
        let commit = self
            .store
            .commit_order(opts.idempotency_key.as_deref(), &input, |ledger| {
                let marks = self.cached_marks(ledger);
                let ctx = ExecContext { order_id, now: Utc::now(), quote: &quote, marks: &marks };
                execute(ledger, &input, &opts, &ctx)
            })
            .await?;

        // 4) bookkeeping
        match &commit {
            Commit::Executed(exec) => {
                let order = &exec.order;
                metrics::ORDERS.with_label_values(&[order.status.as_str()]).inc();
                metrics::RISK_LEVEL.set(risk_gauge(exec.risk.level));
                match (&order.reason, order.fill_price_cents) {
                    (None, Some(px)) => {
                        self.marks.lock().record(&order.symbol, px, order.requested_at);
                        info!(
                            order_id = %order.id,
                            symbol = %order.symbol,
                            side = order.side.as_str(),
                            qty = order.quantity,
                            px,
                            quote_source = %quote.source,
                            "order filled"
                        );
                    }
                    (Some(r), _) => {
                        metrics::REJECTIONS.with_label_values(&[r.code.as_str()]).inc();
                        info!(
                            order_id = %order.id,
                            symbol = %order.symbol,
                            code = r.code.as_str(),
                            reason = %r.message,
                            "order rejected"
                        );
                    }
                    (None, None) => {}
                }
            }
            Commit::Replayed(order) => {
                metrics::IDEMPOTENT_REPLAYS.with_label_values(&[source_label(&opts)]).inc();
                debug!(order_id = %order.id, "order replayed from history");
            }
        }
        Ok(commit.into_order())
    }

    pub async fn policy(&self) -> Policy {
        self.store.snapshot().await.policy
    }

    pub async fn update_policy(&self, patch: PolicyPatch) -> Result<Policy> {
        self.store.update_policy(&patch, Utc::now()).await
    }

    /// One quote per distinct symbol, in request order. Never fails for provider outages.
    pub async fn quotes(&self, symbols: &[String]) -> Result<Vec<Quote>> {
        let mut seen = HashSet::new();
        let mut wanted = Vec::new();
        for raw in symbols {
            let sym = normalize_symbol(raw);
            if sym.is_empty() {
                continue;
            }
            if !is_valid_symbol(&sym) {
                return Err(Error::InvalidInput(format!("invalid symbol {raw:?}")));
            }
            if seen.insert(sym.clone()) {
                wanted.push(sym);
            }
        }
        if wanted.len() > MAX_QUOTE_SYMBOLS {
            return Err(Error::InvalidInput(format!("at most {MAX_QUOTE_SYMBOLS} symbols per request")));
        }
        Ok(join_all(wanted.iter().map(|s| self.fetch_quote(s))).await)
    }

    /// Analysis context through the router; `None` when every provider is unavailable.
    pub async fn analysis_context(&self, symbol: &str) -> Result<Option<RoutedContext>> {
        let sym = normalize_symbol(symbol);
        if !is_valid_symbol(&sym) {
            return Err(Error::InvalidInput(format!("invalid symbol {symbol:?}")));
        }
        let routed = self.router.fetch_analysis_context(&sym, self.router.preference(), &self.scope).await;
        if let Some(rc) = &routed {
            self.marks.lock().record(&sym, rc.context.current_price_cents, rc.context.last_updated);
        }
        Ok(routed)
    }

    async fn fetch_quote(&self, symbol: &str) -> Quote {
        let live: Option<Quote> = self
            .router
            .fetch_quote(symbol, self.router.preference(), &self.scope)
            .await
            .map(Into::into);
        let now = Utc::now();
        let mut book = self.marks.lock();
        if let Some(q) = &live {
            book.record(&q.symbol, q.price_cents, q.as_of);
        } else {
            warn!(%symbol, "no market data available, falling back to offline price");
        }
        resolve_quote(symbol, live, book.get(symbol), now)
    }

    fn cached_quote(&self, symbol: &str) -> Quote {
        let live: Option<Quote> = self
            .router
            .get_quote(symbol, self.router.preference(), &self.scope)
            .map(Into::into);
        let last = self.marks.lock().get(symbol);
        resolve_quote(symbol, live, last, Utc::now())
    }

    /// Cache-only marks for every held symbol.
    fn cached_marks(&self, ledger: &Ledger) -> Marks {
        ledger
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), self.cached_quote(&p.symbol).price_cents))
            .collect()
    }
}

fn new_order_id() -> String {
    format!("ord-{}-{:08x}", Utc::now().timestamp_millis(), rand::random::<u32>())
}

fn risk_gauge(level: RiskLevel) -> i64 {
    match level {
        RiskLevel::Ok => 0,
        RiskLevel::Watch => 1,
        RiskLevel::Restrict => 2,
        RiskLevel::Halt => 3,
    }
}

fn source_label(opts: &PlaceOptions) -> &'static str {
    match opts.source {
        crate::domain::OrderSource::Ui => "ui",
        crate::domain::OrderSource::Api => "api",
        crate::domain::OrderSource::Auto => "auto",
    }
}
