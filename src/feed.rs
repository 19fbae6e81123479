// ===============================
// src/feed.rs
// ===============================
//
// Quote provider adapters:
// - QuoteProvider   : the shape every upstream conforms to
// - FinnhubProvider : /quote (live), /stock/candle + /stock/metric for context
// - AlphaVantage    : GLOBAL_QUOTE + TIME_SERIES_DAILY (tagged delayed when stale)
//
// Adapters raise on network/auth/rate-limit failure instead of returning empty
// data, so the router's circuit breaker counts failures accurately.
//
// Price scale: cents (px * 100), same as the rest of the ledger.
//

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::ProviderCfg;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Finnhub,
    AlphaVantage,
}

impl ProviderId {
    /// Order used by `auto`.
    pub const CANONICAL: [ProviderId; 2] = [ProviderId::Finnhub, ProviderId::AlphaVantage];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Finnhub => "finnhub",
            ProviderId::AlphaVantage => "alphavantage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "finnhub" => Some(ProviderId::Finnhub),
            "alphavantage" | "alpha_vantage" | "alpha-vantage" | "av" => Some(ProviderId::AlphaVantage),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProviderPreference {
    #[default]
    Auto,
    Named(ProviderId),
}

impl ProviderPreference {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Some(ProviderPreference::Auto),
            other => ProviderId::parse(other).map(ProviderPreference::Named),
        }
    }

    /// Fixed two-element priority order: [primary, secondary].
    pub fn order(&self) -> [ProviderId; 2] {
        match self {
            ProviderPreference::Auto => ProviderId::CANONICAL,
            ProviderPreference::Named(ProviderId::Finnhub) => {
                [ProviderId::Finnhub, ProviderId::AlphaVantage]
            }
            ProviderPreference::Named(ProviderId::AlphaVantage) => {
                [ProviderId::AlphaVantage, ProviderId::Finnhub]
            }
        }
    }
}

/// Caller-supplied credentials. Only fingerprints ever leave this type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialScope {
    keys: BTreeMap<ProviderId, String>,
}

impl CredentialScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, provider: ProviderId, key: impl Into<String>) -> Self {
        let key = key.into();
        if !key.trim().is_empty() {
            self.keys.insert(provider, key);
        }
        self
    }

    pub fn key(&self, provider: ProviderId) -> Option<&str> {
        self.keys.get(&provider).map(String::as_str)
    }

    /// Short SHA-256 of the key material, so different API keys never share cache entries.
    pub fn fingerprint(&self, provider: ProviderId) -> String {
        match self.keys.get(&provider) {
            Some(key) => {
                let mut h = Sha256::new();
                h.update(provider.as_str().as_bytes());
                h.update(b":");
                h.update(key.as_bytes());
                hex::encode(&h.finalize()[..8])
            }
            None => "default".to_string(),
        }
    }

    /// Fingerprint over every provider, for keys that span the whole preference order.
    pub fn scope_fingerprint(&self) -> String {
        ProviderId::CANONICAL
            .iter()
            .map(|p| self.fingerprint(*p))
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStatus {
    Live,
    Delayed,
}

impl DataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataStatus::Live => "live",
            DataStatus::Delayed => "delayed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQuote {
    pub price_cents: u64,
    pub as_of: DateTime<Utc>,
    pub status: DataStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub at: DateTime<Utc>,
    pub close_cents: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fundamentals {
    pub pe_ratio: Option<f64>,
    pub market_cap_millions: Option<f64>,
    pub dividend_yield_pct: Option<f64>,
    pub beta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisContext {
    pub status: DataStatus,
    pub last_updated: DateTime<Utc>,
    pub price_history: Vec<PricePoint>,
    pub current_price_cents: u64,
    pub high_52w_cents: u64,
    pub low_52w_cents: u64,
    pub avg_volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fundamentals: Option<Fundamentals>,
}

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Enabled by configuration and holding a usable credential for this scope.
    fn is_live_mode_enabled(&self, scope: &CredentialScope) -> bool;

    async fn fetch_quote(&self, symbol: &str, scope: &CredentialScope) -> Result<ProviderQuote>;

    async fn fetch_analysis_context(
        &self,
        symbol: &str,
        scope: &CredentialScope,
    ) -> Result<AnalysisContext>;
}

pub fn dollars_to_cents(px: f64) -> Option<u64> {
    if px.is_finite() && px > 0.0 {
        Some((px * 100.0).round() as u64)
    } else {
        None
    }
}

fn build_http(provider: ProviderId, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("{provider} http client: {e}")))
}

async fn get_json(http: &reqwest::Client, provider: ProviderId, url: &str) -> Result<Value> {
    let rsp = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::provider(provider.as_str(), format!("request failed: {}", e.without_url())))?;
    let code = rsp.status();
    if !code.is_success() {
        let what = match code.as_u16() {
            401 | 403 => "auth rejected",
            429 => "rate limited",
            _ => "http error",
        };
        return Err(Error::provider(provider.as_str(), format!("{what} ({code})")));
    }
    rsp.json::<Value>()
        .await
        .map_err(|e| Error::provider(provider.as_str(), format!("bad body: {}", e.without_url())))
}

fn resolve_key<'a>(cfg: &'a ProviderCfg, scope: &'a CredentialScope, id: ProviderId) -> Option<&'a str> {
    scope.key(id).or(cfg.api_key.as_deref())
}

fn summarize_history(highs: &[f64], lows: &[f64], volumes: &[f64]) -> (u64, u64, f64) {
    let hi = highs.iter().copied().fold(f64::MIN, f64::max);
    let lo = lows.iter().copied().fold(f64::MAX, f64::min);
    let avg_vol = if volumes.is_empty() {
        0.0
    } else {
        volumes.iter().sum::<f64>() / volumes.len() as f64
    };
    (dollars_to_cents(hi).unwrap_or(0), dollars_to_cents(lo).unwrap_or(0), avg_vol)
}

// ---------- Finnhub ----------

pub struct FinnhubProvider {
    cfg: ProviderCfg,
    http: reqwest::Client,
}

impl FinnhubProvider {
    pub fn new(cfg: ProviderCfg, timeout: Duration) -> Result<Self> {
        Ok(Self { cfg, http: build_http(ProviderId::Finnhub, timeout)? })
    }

    fn url(&self, path: &str, query: &str, key: &str) -> String {
        format!(
            "{}/{}?{}&token={}",
            self.cfg.base_url.trim_end_matches('/'),
            path,
            query,
            urlencoding::encode(key)
        )
    }
}

/// `{"c": current, "t": unix seconds, ...}`; `c == 0` means unknown symbol.
pub fn parse_finnhub_quote(v: &Value) -> Result<ProviderQuote> {
    let px = v.get("c").and_then(Value::as_f64).unwrap_or(0.0);
    let price_cents = dollars_to_cents(px)
        .ok_or_else(|| Error::provider("finnhub", "no price in quote response"))?;
    let as_of = v
        .get("t")
        .and_then(Value::as_i64)
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now);
    Ok(ProviderQuote { price_cents, as_of, status: DataStatus::Live })
}

fn f64_array(v: &Value, key: &str) -> Vec<f64> {
    v.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Daily candles: `{"s":"ok","c":[..],"h":[..],"l":[..],"v":[..],"t":[..]}`.
pub fn parse_finnhub_candles(v: &Value, quote: &ProviderQuote) -> Result<AnalysisContext> {
    if v.get("s").and_then(Value::as_str) != Some("ok") {
        return Err(Error::provider("finnhub", "candle response not ok"));
    }
    let closes = f64_array(v, "c");
    let times: Vec<i64> = v
        .get("t")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default();
    let price_history = closes
        .iter()
        .zip(times.iter())
        .filter_map(|(c, t)| {
            Some(PricePoint {
                at: Utc.timestamp_opt(*t, 0).single()?,
                close_cents: dollars_to_cents(*c)?,
            })
        })
        .collect::<Vec<_>>();
    let (high_52w_cents, low_52w_cents, avg_volume) =
        summarize_history(&f64_array(v, "h"), &f64_array(v, "l"), &f64_array(v, "v"));
    Ok(AnalysisContext {
        status: quote.status,
        last_updated: quote.as_of,
        price_history,
        current_price_cents: quote.price_cents,
        high_52w_cents,
        low_52w_cents,
        avg_volume,
        fundamentals: None,
    })
}

pub fn parse_finnhub_metrics(v: &Value) -> Option<Fundamentals> {
    let m = v.get("metric")?;
    let pick = |k: &str| m.get(k).and_then(Value::as_f64);
    let f = Fundamentals {
        pe_ratio: pick("peBasicExclExtraTTM"),
        market_cap_millions: pick("marketCapitalization"),
        dividend_yield_pct: pick("dividendYieldIndicatedAnnual"),
        beta: pick("beta"),
    };
    if f == Fundamentals::default() {
        None
    } else {
        Some(f)
    }
}

#[async_trait]
impl QuoteProvider for FinnhubProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Finnhub
    }

    fn is_live_mode_enabled(&self, scope: &CredentialScope) -> bool {
        self.cfg.enabled && resolve_key(&self.cfg, scope, ProviderId::Finnhub).is_some()
    }

    async fn fetch_quote(&self, symbol: &str, scope: &CredentialScope) -> Result<ProviderQuote> {
        let key = resolve_key(&self.cfg, scope, ProviderId::Finnhub)
            .ok_or_else(|| Error::provider("finnhub", "missing api key"))?;
        let url = self.url("quote", &format!("symbol={}", urlencoding::encode(symbol)), key);
        parse_finnhub_quote(&get_json(&self.http, ProviderId::Finnhub, &url).await?)
    }

    async fn fetch_analysis_context(
        &self,
        symbol: &str,
        scope: &CredentialScope,
    ) -> Result<AnalysisContext> {
        let key = resolve_key(&self.cfg, scope, ProviderId::Finnhub)
            .ok_or_else(|| Error::provider("finnhub", "missing api key"))?;
        let quote = self.fetch_quote(symbol, scope).await?;

        let to = Utc::now().timestamp();
        let from = to - 365 * 24 * 3600;
        let sym = urlencoding::encode(symbol);
        let candles_url = self.url(
            "stock/candle",
            &format!("symbol={sym}&resolution=D&from={from}&to={to}"),
            key,
        );
        let candles = get_json(&self.http, ProviderId::Finnhub, &candles_url).await?;
        let mut ctx = parse_finnhub_candles(&candles, &quote)?;

        // fundamentals are optional: a failure here does not fail the context
        let metric_url = self.url("stock/metric", &format!("symbol={sym}&metric=all"), key);
        ctx.fundamentals = match get_json(&self.http, ProviderId::Finnhub, &metric_url).await {
            Ok(v) => parse_finnhub_metrics(&v),
            Err(e) => {
                tracing::debug!(%symbol, error = %e, "finnhub metrics unavailable");
                None
            }
        };
        Ok(ctx)
    }
}

// ---------- Alpha Vantage ----------

pub struct AlphaVantageProvider {
    cfg: ProviderCfg,
    http: reqwest::Client,
}

impl AlphaVantageProvider {
    pub fn new(cfg: ProviderCfg, timeout: Duration) -> Result<Self> {
        Ok(Self { cfg, http: build_http(ProviderId::AlphaVantage, timeout)? })
    }

    fn url(&self, function: &str, symbol: &str, key: &str) -> String {
        format!(
            "{}/query?function={}&symbol={}&apikey={}",
            self.cfg.base_url.trim_end_matches('/'),
            function,
            urlencoding::encode(symbol),
            urlencoding::encode(key)
        )
    }
}

/// Alpha Vantage answers throttling and bad symbols with HTTP 200 + a message field.
fn alphavantage_guard(v: &Value) -> Result<()> {
    for field in ["Note", "Information", "Error Message"] {
        if let Some(msg) = v.get(field).and_then(Value::as_str) {
            return Err(Error::provider("alphavantage", msg.chars().take(120).collect::<String>()));
        }
    }
    Ok(())
}

fn status_for_day(day: NaiveDate, today: NaiveDate) -> DataStatus {
    if day < today {
        DataStatus::Delayed
    } else {
        DataStatus::Live
    }
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt))
        .unwrap_or_else(Utc::now)
}

fn av_number(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_str).and_then(|s| s.trim().parse().ok())
}

pub fn parse_alphavantage_quote(v: &Value, now: DateTime<Utc>) -> Result<ProviderQuote> {
    alphavantage_guard(v)?;
    let q = v
        .get("Global Quote")
        .filter(|q| q.as_object().map(|o| !o.is_empty()).unwrap_or(false))
        .ok_or_else(|| Error::provider("alphavantage", "empty global quote"))?;
    let price_cents = av_number(q, "05. price")
        .and_then(dollars_to_cents)
        .ok_or_else(|| Error::provider("alphavantage", "no price in global quote"))?;
    let day = q
        .get("07. latest trading day")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
    let (status, as_of) = match day {
        Some(d) if status_for_day(d, now.date_naive()) == DataStatus::Delayed => {
            (DataStatus::Delayed, day_start(d))
        }
        _ => (DataStatus::Live, now),
    };
    Ok(ProviderQuote { price_cents, as_of, status })
}

pub fn parse_alphavantage_daily(v: &Value, now: DateTime<Utc>) -> Result<AnalysisContext> {
    alphavantage_guard(v)?;
    let series = v
        .get("Time Series (Daily)")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::provider("alphavantage", "missing daily series"))?;

    // (day, close, high, low, volume), oldest first
    let mut rows: Vec<(NaiveDate, f64, f64, f64, f64)> = series
        .iter()
        .filter_map(|(d, bar)| {
            let day = NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()?;
            Some((
                day,
                av_number(bar, "4. close")?,
                av_number(bar, "2. high")?,
                av_number(bar, "3. low")?,
                av_number(bar, "5. volume").unwrap_or(0.0),
            ))
        })
        .collect();
    rows.sort_by_key(|r| r.0);
    let last = *rows
        .last()
        .ok_or_else(|| Error::provider("alphavantage", "empty daily series"))?;

    let highs: Vec<f64> = rows.iter().map(|r| r.2).collect();
    let lows: Vec<f64> = rows.iter().map(|r| r.3).collect();
    let vols: Vec<f64> = rows.iter().map(|r| r.4).collect();
    let (high_52w_cents, low_52w_cents, avg_volume) = summarize_history(&highs, &lows, &vols);

    let status = status_for_day(last.0, now.date_naive());
    Ok(AnalysisContext {
        status,
        last_updated: if status == DataStatus::Live { now } else { day_start(last.0) },
        price_history: rows
            .iter()
            .filter_map(|r| {
                Some(PricePoint { at: day_start(r.0), close_cents: dollars_to_cents(r.1)? })
            })
            .collect(),
        current_price_cents: dollars_to_cents(last.1)
            .ok_or_else(|| Error::provider("alphavantage", "bad close price"))?,
        high_52w_cents,
        low_52w_cents,
        avg_volume,
        fundamentals: None,
    })
}

#[async_trait]
impl QuoteProvider for AlphaVantageProvider {
    fn id(&self) -> ProviderId {
        ProviderId::AlphaVantage
    }

    fn is_live_mode_enabled(&self, scope: &CredentialScope) -> bool {
        self.cfg.enabled && resolve_key(&self.cfg, scope, ProviderId::AlphaVantage).is_some()
    }

    async fn fetch_quote(&self, symbol: &str, scope: &CredentialScope) -> Result<ProviderQuote> {
        let key = resolve_key(&self.cfg, scope, ProviderId::AlphaVantage)
            .ok_or_else(|| Error::provider("alphavantage", "missing api key"))?;
        let url = self.url("GLOBAL_QUOTE", symbol, key);
        let v = get_json(&self.http, ProviderId::AlphaVantage, &url).await?;
        parse_alphavantage_quote(&v, Utc::now())
    }

    async fn fetch_analysis_context(
        &self,
        symbol: &str,
        scope: &CredentialScope,
    ) -> Result<AnalysisContext> {
        let key = resolve_key(&self.cfg, scope, ProviderId::AlphaVantage)
            .ok_or_else(|| Error::provider("alphavantage", "missing api key"))?;
        let url = self.url("TIME_SERIES_DAILY", symbol, key);
        let v = get_json(&self.http, ProviderId::AlphaVantage, &url).await?;
        parse_alphavantage_daily(&v, Utc::now())
    }
}
