// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : paper_desk — paper-trading execution core in Rust
Module  : config.rs

Summary : Environment-style configuration (.env aware). Every numeric knob is
          parsed, clamped into safe bounds, and falls back to a default when
          missing or unparseable.
=============================================================================
*/
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use dotenvy::dotenv;
use tracing::warn;

use crate::feed::{ProviderId, ProviderPreference};

/// Settings for a single upstream quote provider.
#[derive(Clone, Debug)]
pub struct ProviderCfg {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct RouterCfg {
    pub preference: ProviderPreference,
    pub request_timeout: Duration,
    pub quote_ttl: Duration,
    pub context_ttl: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for RouterCfg {
    fn default() -> Self {
        Self {
            preference: ProviderPreference::Auto,
            request_timeout: Duration::from_millis(8_000),
            quote_ttl: Duration::from_millis(15_000),
            context_ttl: Duration::from_millis(60_000),
            failure_threshold: 3,
            cooldown: Duration::from_millis(30_000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreCfg {
    pub data_dir: PathBuf,
    pub account: String,
    pub starting_cash_cents: i64,
}

impl StoreCfg {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.ledger.json", self.account))
    }

    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.audit.jsonl", self.account))
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_addr: String,
    pub store: StoreCfg,
    pub router: RouterCfg,
    pub finnhub: ProviderCfg,
    pub alphavantage: ProviderCfg,
}

impl AppConfig {
    pub fn provider(&self, id: ProviderId) -> &ProviderCfg {
        match id {
            ProviderId::Finnhub => &self.finnhub,
            ProviderId::AlphaVantage => &self.alphavantage,
        }
    }

    /// Build from any key lookup (process env in production, a map in tests).
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // ===== Store =====
        let data_dir = get("PAPER_DATA_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let account = get("PAPER_ACCOUNT")
            .map(|s| s.trim().to_string())
            .filter(|s| {
                !s.is_empty()
                    && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            })
            .unwrap_or_else(|| "default".to_string());
        let starting_cash_cents =
            bounded(&get, "PAPER_STARTING_CASH_CENTS", 10_000_000i64, 0, 1_000_000_000_000);

        // ===== Router =====
        let preference = get("MARKET_DATA_PROVIDER")
            .and_then(|s| ProviderPreference::parse(&s))
            .unwrap_or(ProviderPreference::Auto);
        let router = RouterCfg {
            preference,
            request_timeout: millis(&get, "MARKET_DATA_TIMEOUT_MS", 8_000, 500, 30_000),
            quote_ttl: millis(&get, "QUOTE_CACHE_TTL_MS", 15_000, 1_000, 300_000),
            context_ttl: millis(&get, "CONTEXT_CACHE_TTL_MS", 60_000, 1_000, 900_000),
            failure_threshold: bounded(&get, "CIRCUIT_FAILURE_THRESHOLD", 3u32, 1, 20),
            cooldown: millis(&get, "CIRCUIT_COOLDOWN_MS", 30_000, 1_000, 600_000),
        };

        // ===== Providers =====
        let finnhub = ProviderCfg {
            enabled: flag(&get, "FINNHUB_ENABLED", true),
            api_key: get("FINNHUB_API_KEY").filter(|s| !s.trim().is_empty()),
            base_url: get("FINNHUB_BASE_URL")
                .unwrap_or_else(|| "https://finnhub.io/api/v1".to_string()),
        };
        let alphavantage = ProviderCfg {
            enabled: flag(&get, "ALPHAVANTAGE_ENABLED", true),
            api_key: get("ALPHAVANTAGE_API_KEY").filter(|s| !s.trim().is_empty()),
            base_url: get("ALPHAVANTAGE_BASE_URL")
                .unwrap_or_else(|| "https://www.alphavantage.co".to_string()),
        };

        let api_addr = get("API_ADDR").unwrap_or_else(|| "127.0.0.1:8787".to_string());

        Self {
            api_addr,
            store: StoreCfg { data_dir, account, starting_cash_cents },
            router,
            finnhub,
            alphavantage,
        }
    }
}

pub fn load() -> AppConfig {
    // .env is optional
    let _ = dotenv();
    AppConfig::from_lookup(|k| env::var(k).ok())
}

fn bounded<T, F>(get: &F, key: &str, default: T, min: T, max: T) -> T
where
    T: FromStr + PartialOrd + Copy + Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else { return default };
    match raw.trim().parse::<T>() {
        Ok(v) if v < min => {
            warn!(%key, value = %v, %min, "config value below bound, clamped");
            min
        }
        Ok(v) if v > max => {
            warn!(%key, value = %v, %max, "config value above bound, clamped");
            max
        }
        Ok(v) => v,
        Err(_) => {
            warn!(%key, %raw, %default, "config value unparseable, using default");
            default
        }
    }
}

fn millis<F>(get: &F, key: &str, default: u64, min: u64, max: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_millis(bounded(get, key, default, min, max))
}

fn flag<F>(get: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match get(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
