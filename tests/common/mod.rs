// ===============================
// tests/common/mod.rs
// ===============================
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use paper_desk::config::RouterCfg;
use paper_desk::error::{Error, Result};
use paper_desk::feed::{
    AnalysisContext, CredentialScope, DataStatus, ProviderId, ProviderQuote, QuoteProvider,
};
use paper_desk::router::MarketDataRouter;
use paper_desk::service::PaperTradingService;
use paper_desk::store::LedgerStore;

/// Scripted upstream: counts calls, can be switched to failing, can be slow.
pub struct FakeProvider {
    id: ProviderId,
    price_cents: u64,
    delay: Duration,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub context_calls: AtomicUsize,
    enabled: bool,
}

impl FakeProvider {
    pub fn new(id: ProviderId, price_cents: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            price_cents,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            context_calls: AtomicUsize::new(0),
            enabled: true,
        })
    }

    pub fn failing(id: ProviderId) -> Arc<Self> {
        let p = Self::new(id, 1);
        p.fail.store(true, Ordering::SeqCst);
        p
    }

    pub fn slow(id: ProviderId, price_cents: u64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            price_cents,
            delay,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            context_calls: AtomicUsize::new(0),
            enabled: true,
        })
    }

    pub fn disabled(id: ProviderId) -> Arc<Self> {
        Arc::new(Self {
            id,
            price_cents: 1,
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            context_calls: AtomicUsize::new(0),
            enabled: false,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    async fn settle(&self) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::provider(self.id.as_str(), "upstream unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl QuoteProvider for FakeProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn is_live_mode_enabled(&self, _scope: &CredentialScope) -> bool {
        self.enabled
    }

    async fn fetch_quote(&self, _symbol: &str, _scope: &CredentialScope) -> Result<ProviderQuote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.settle().await?;
        Ok(ProviderQuote { price_cents: self.price_cents, as_of: Utc::now(), status: DataStatus::Live })
    }

    async fn fetch_analysis_context(&self, _symbol: &str, _scope: &CredentialScope) -> Result<AnalysisContext> {
        self.context_calls.fetch_add(1, Ordering::SeqCst);
        self.settle().await?;
        Ok(AnalysisContext {
            status: DataStatus::Delayed,
            last_updated: Utc::now(),
            price_history: Vec::new(),
            current_price_cents: self.price_cents,
            high_52w_cents: self.price_cents,
            low_52w_cents: self.price_cents,
            avg_volume: 0.0,
            fundamentals: None,
        })
    }
}

pub fn router_with(providers: Vec<Arc<FakeProvider>>) -> MarketDataRouter {
    let dyns: Vec<Arc<dyn QuoteProvider>> = providers.into_iter().map(|p| p as Arc<dyn QuoteProvider>).collect();
    MarketDataRouter::new(RouterCfg::default(), dyns)
}

pub async fn service_in(dir: &Path, providers: Vec<Arc<FakeProvider>>) -> PaperTradingService {
    let store = LedgerStore::open_at(
        dir.join("acct.ledger.json"),
        dir.join("acct.audit.jsonl"),
        10_000_000,
        Utc::now(),
    )
    .await
    .expect("open store");
    PaperTradingService::new(store, router_with(providers), CredentialScope::new())
}
