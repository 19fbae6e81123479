// ===============================
// src/router.rs (market data router: failover + circuit + cache + coalescing)
// ===============================
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::circuit::{CircuitBreaker, CircuitState, FailureOutcome};
use crate::config::{AppConfig, RouterCfg};
use crate::domain::{normalize_symbol, Quote};
use crate::error::Result;
use crate::feed::{
    AlphaVantageProvider, AnalysisContext, CredentialScope, DataStatus, FinnhubProvider,
    ProviderId, ProviderPreference, ProviderQuote, QuoteProvider,
};
use crate::metrics::{CACHE_HITS, CIRCUIT_OPENED, COALESCED, PROVIDER_REQUESTS};

const CACHE_MAX_ENTRIES: usize = 4096;

/// (provider, symbol, credential fingerprint)
type CacheKey = (ProviderId, String, String);
/// (provider, credential fingerprint)
type CircuitKey = (ProviderId, String);
/// (symbol, preference, scope fingerprint)
type FlightKey = (String, ProviderPreference, String);

/// Runs on its own task, so it settles and leaves the map even if every waiter is dropped.
type Flight<T> = Shared<BoxFuture<'static, Option<T>>>;

/// Where a routed value came from, rendered as `"<provider>-<live|delayed>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTag {
    pub provider: ProviderId,
    pub status: DataStatus,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.provider.as_str(), self.status.as_str())
    }
}

impl Serialize for SourceTag {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedQuote {
    pub symbol: String,
    pub price_cents: u64,
    pub as_of: DateTime<Utc>,
    pub source: SourceTag,
}

impl From<RoutedQuote> for Quote {
    fn from(q: RoutedQuote) -> Self {
        Quote { symbol: q.symbol, price_cents: q.price_cents, source: q.source.to_string(), as_of: q.as_of }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedContext {
    pub source: SourceTag,
    pub context: AnalysisContext,
}

struct Inner {
    cfg: RouterCfg,
    providers: Vec<Arc<dyn QuoteProvider>>,
    quotes: Mutex<TtlCache<CacheKey, ProviderQuote>>,
    contexts: Mutex<TtlCache<CacheKey, AnalysisContext>>,
    circuits: Mutex<CircuitBreaker<CircuitKey>>,
    quote_flights: Mutex<HashMap<FlightKey, Flight<RoutedQuote>>>,
    context_flights: Mutex<HashMap<FlightKey, Flight<RoutedContext>>>,
}

/// Owns every piece of router state; clones share it. Independent instances share nothing.
#[derive(Clone)]
pub struct MarketDataRouter {
    inner: Arc<Inner>,
}

impl MarketDataRouter {
    pub fn new(cfg: RouterCfg, providers: Vec<Arc<dyn QuoteProvider>>) -> Self {
        let inner = Inner {
            quotes: Mutex::new(TtlCache::new(cfg.quote_ttl, CACHE_MAX_ENTRIES)),
            contexts: Mutex::new(TtlCache::new(cfg.context_ttl, CACHE_MAX_ENTRIES)),
            circuits: Mutex::new(CircuitBreaker::new(cfg.failure_threshold, cfg.cooldown)),
            quote_flights: Mutex::new(HashMap::new()),
            context_flights: Mutex::new(HashMap::new()),
            providers,
            cfg,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Router wired to the real HTTP adapters.
    pub fn from_config(app: &AppConfig) -> Result<Self> {
        let timeout = app.router.request_timeout;
        let providers: Vec<Arc<dyn QuoteProvider>> = vec![
            Arc::new(FinnhubProvider::new(app.finnhub.clone(), timeout)?),
            Arc::new(AlphaVantageProvider::new(app.alphavantage.clone(), timeout)?),
        ];
        Ok(Self::new(app.router.clone(), providers))
    }

    pub fn preference(&self) -> ProviderPreference {
        self.inner.cfg.preference
    }

    /// Cache-only lookup: never performs I/O.
    pub fn get_quote(
        &self,
        symbol: &str,
        pref: ProviderPreference,
        scope: &CredentialScope,
    ) -> Option<RoutedQuote> {
        let symbol = normalize_symbol(symbol);
        let now = Instant::now();
        for id in pref.order() {
            let key = (id, symbol.clone(), scope.fingerprint(id));
            let quote = self.inner.quotes.lock().get(&key, now);
            if let Some(q) = quote {
                return Some(RoutedQuote {
                    symbol,
                    price_cents: q.price_cents,
                    as_of: q.as_of,
                    source: SourceTag { provider: id, status: q.status },
                });
            }
            let ctx = self.inner.contexts.lock().get(&key, now);
            if let Some(c) = ctx {
                return Some(RoutedQuote {
                    symbol,
                    price_cents: c.current_price_cents,
                    as_of: c.last_updated,
                    source: SourceTag { provider: id, status: c.status },
                });
            }
        }
        None
    }

    /// Live quote through the provider chain; `None` once every provider is exhausted.
    pub async fn fetch_quote(
        &self,
        symbol: &str,
        pref: ProviderPreference,
        scope: &CredentialScope,
    ) -> Option<RoutedQuote> {
        let key: FlightKey = (normalize_symbol(symbol), pref, scope.scope_fingerprint());
        let flight = {
            let mut flights = self.inner.quote_flights.lock();
            match flights.get(&key) {
                Some(f) => {
                    COALESCED.with_label_values(&["quote"]).inc();
                    f.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let scope = scope.clone();
                    let k = key.clone();
                    let task = tokio::spawn(async move {
                        let out = inner.route_quote(&k.0, k.1, &scope).await;
                        inner.quote_flights.lock().remove(&k);
                        out
                    });
                    let f = task.map(|joined| joined.ok().flatten()).boxed().shared();
                    flights.insert(key, f.clone());
                    f
                }
            }
        };
        flight.await
    }

    pub async fn fetch_analysis_context(
        &self,
        symbol: &str,
        pref: ProviderPreference,
        scope: &CredentialScope,
    ) -> Option<RoutedContext> {
        let key: FlightKey = (normalize_symbol(symbol), pref, scope.scope_fingerprint());
        let flight = {
            let mut flights = self.inner.context_flights.lock();
            match flights.get(&key) {
                Some(f) => {
                    COALESCED.with_label_values(&["context"]).inc();
                    f.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let scope = scope.clone();
                    let k = key.clone();
                    let task = tokio::spawn(async move {
                        let out = inner.route_context(&k.0, k.1, &scope).await;
                        inner.context_flights.lock().remove(&k);
                        out
                    });
                    let f = task.map(|joined| joined.ok().flatten()).boxed().shared();
                    flights.insert(key, f.clone());
                    f
                }
            }
        };
        flight.await
    }

    pub fn circuit_state(&self, provider: ProviderId, scope: &CredentialScope) -> CircuitState {
        self.inner.circuits.lock().state(&(provider, scope.fingerprint(provider)))
    }

    pub fn in_flight(&self) -> usize {
        self.inner.quote_flights.lock().len() + self.inner.context_flights.lock().len()
    }
}

impl Inner {
    fn provider(&self, id: ProviderId) -> Option<Arc<dyn QuoteProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    async fn route_quote(
        &self,
        symbol: &str,
        pref: ProviderPreference,
        scope: &CredentialScope,
    ) -> Option<RoutedQuote> {
        let (id, q) = self
            .attempt_chain(symbol, pref, scope, "quote", &self.quotes, |p, sym, sc| async move {
                p.fetch_quote(&sym, &sc).await
            })
            .await?;
        Some(RoutedQuote {
            symbol: symbol.to_string(),
            price_cents: q.price_cents,
            as_of: q.as_of,
            source: SourceTag { provider: id, status: q.status },
        })
    }

    async fn route_context(
        &self,
        symbol: &str,
        pref: ProviderPreference,
        scope: &CredentialScope,
    ) -> Option<RoutedContext> {
        let (id, ctx) = self
            .attempt_chain(symbol, pref, scope, "context", &self.contexts, |p, sym, sc| async move {
                p.fetch_analysis_context(&sym, &sc).await
            })
            .await?;
        // the context carries a price too: keep the quote cache warm
        let quote = ProviderQuote {
            price_cents: ctx.current_price_cents,
            as_of: ctx.last_updated,
            status: ctx.status,
        };
        self.quotes.lock().insert(
            (id, symbol.to_string(), scope.fingerprint(id)),
            quote,
            Instant::now(),
        );
        Some(RoutedContext { source: SourceTag { provider: id, status: ctx.status }, context: ctx })
    }

    /// Walk the preference order: skip disabled, serve cache, skip open circuits, else fetch.
    async fn attempt_chain<T, F, Fut>(
        &self,
        symbol: &str,
        pref: ProviderPreference,
        scope: &CredentialScope,
        kind: &'static str,
        cache: &Mutex<TtlCache<CacheKey, T>>,
        fetch: F,
    ) -> Option<(ProviderId, T)>
    where
        T: Clone,
        F: Fn(Arc<dyn QuoteProvider>, String, CredentialScope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for id in pref.order() {
            let Some(provider) = self.provider(id) else { continue };
            if !provider.is_live_mode_enabled(scope) {
                debug!(provider = %id, %symbol, "provider disabled or missing credential");
                continue;
            }

            let fp = scope.fingerprint(id);
            let cache_key: CacheKey = (id, symbol.to_string(), fp.clone());
            let hit = cache.lock().get(&cache_key, Instant::now());
            if let Some(v) = hit {
                CACHE_HITS.with_label_values(&[kind]).inc();
                return Some((id, v));
            }

            let circuit_key: CircuitKey = (id, fp);
            let open = self.circuits.lock().is_open(&circuit_key, Instant::now());
            if open {
                PROVIDER_REQUESTS.with_label_values(&[id.as_str(), kind, "skipped"]).inc();
                debug!(provider = %id, %symbol, "circuit open, skipping provider");
                continue;
            }

            let attempt = fetch(provider, symbol.to_string(), scope.clone());
            match tokio::time::timeout(self.cfg.request_timeout, attempt).await {
                Ok(Ok(v)) => {
                    self.circuits.lock().record_success(&circuit_key);
                    cache.lock().insert(cache_key, v.clone(), Instant::now());
                    PROVIDER_REQUESTS.with_label_values(&[id.as_str(), kind, "ok"]).inc();
                    return Some((id, v));
                }
                Ok(Err(e)) => self.on_failure(circuit_key, symbol, kind, &e.to_string()),
                Err(_) => self.on_failure(circuit_key, symbol, kind, "timed out"),
            }
        }
        None
    }

    fn on_failure(&self, key: CircuitKey, symbol: &str, kind: &'static str, error: &str) {
        let id = key.0;
        PROVIDER_REQUESTS.with_label_values(&[id.as_str(), kind, "error"]).inc();
        let outcome = self.circuits.lock().record_failure(key, Instant::now());
        match outcome {
            FailureOutcome::Counted(n) => {
                warn!(provider = %id, %symbol, failures = n, %error, "provider fetch failed");
            }
            FailureOutcome::Opened { .. } => {
                CIRCUIT_OPENED.with_label_values(&[id.as_str()]).inc();
                warn!(
                    provider = %id,
                    %symbol,
                    %error,
                    cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                    "provider circuit opened"
                );
            }
        }
    }
}
