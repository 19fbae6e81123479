// ===============================
// src/main.rs
// ===============================
/*
 # run the API
 PAPER_DATA_DIR=./data FINNHUB_API_KEY=... cargo run -- serve

 curl -s localhost:8787/api/overview | jq .account
 curl -s -XPOST localhost:8787/api/orders -H 'Idempotency-Key: k-1' \
      -d '{"symbol":"AAPL","side":"buy","quantity":5}'
 curl -s localhost:8787/metrics | grep '^paper_'
*/
/*
=============================================================================
Project : paper_desk — paper-trading execution core in Rust
Module  : main.rs

Summary : Single-writer paper ledger with risk guardrails, fed by a
          multi-provider market-data router (TTL cache, failover, circuit
          breaker, in-flight coalescing). Exposes a JSON API, Prometheus
          metrics and a JSONL audit trail.
=============================================================================
*/
use std::{net::SocketAddr, process::ExitCode};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use paper_desk::{
    api, config,
    domain::{OrderInput, OrderSource, OrderType, PlaceOptions, PolicyPatch, Side},
    error::{Error, Result},
    metrics,
    service::PaperTradingService,
};

#[derive(Parser, Debug)]
#[command(name = "paper-desk")]
#[command(about = "Paper-trading execution core: ledger, risk guardrails, market-data routing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API (and /metrics)
    Serve {
        /// Overrides API_ADDR
        #[arg(long)]
        addr: Option<SocketAddr>,
    },

    /// Print account, positions, recent orders and risk as JSON
    Overview,

    /// Place one order and print the resulting order
    Order {
        symbol: String,
        #[arg(value_parser = parse_side)]
        side: Side,
        quantity: f64,
        /// Limit price in cents; omitted means market
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Show the policy, or patch it when any flag is given
    Policy {
        #[arg(long)]
        kill_switch: Option<bool>,
        #[arg(long)]
        allow_short: Option<bool>,
        #[arg(long)]
        max_position_pct: Option<f64>,
        #[arg(long)]
        max_order_notional_cents: Option<i64>,
        #[arg(long)]
        max_open_positions: Option<usize>,
        #[arg(long)]
        max_daily_loss_cents: Option<i64>,
        #[arg(long)]
        max_drawdown_pct: Option<f64>,
        /// Replaces the block list (comma separated; empty string clears it)
        #[arg(long)]
        blocked: Option<String>,
    },

    /// Resolve quotes for the given symbols
    Quotes {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
}

fn parse_side(s: &str) -> std::result::Result<Side, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "buy" | "b" => Ok(Side::Buy),
        "sell" | "s" => Ok(Side::Sell),
        other => Err(format!("side must be buy or sell, got {other:?}")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "paper-desk: failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // ---- Config & metrics ----
    let cfg = config::load();
    metrics::init();

    info!(
        data_dir = %cfg.store.data_dir.display(),
        account = %cfg.store.account,
        provider = ?cfg.router.preference,
        finnhub = cfg.finnhub.enabled,
        alphavantage = cfg.alphavantage.enabled,
        timeout_ms = cfg.router.request_timeout.as_millis() as u64,
        "startup config"
    );

    let svc = PaperTradingService::open(&cfg).await?;

    match cli.command {
        Command::Serve { addr } => {
            let addr = match addr {
                Some(a) => a,
                None => cfg
                    .api_addr
                    .parse()
                    .map_err(|e| Error::Config(format!("API_ADDR {:?}: {e}", cfg.api_addr)))?,
            };
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
                info!("ctrl-c received, shutting down");
            };
            api::serve(addr, svc, shutdown).await?;
        }
        Command::Overview => print_json(&svc.overview().await)?,
        Command::Order { symbol, side, quantity, limit, idempotency_key } => {
            let input = OrderInput {
                symbol,
                side,
                quantity,
                order_type: if limit.is_some() { OrderType::Limit } else { OrderType::Market },
                limit_price_cents: limit,
            };
            let opts = PlaceOptions { idempotency_key, source: OrderSource::Ui };
            print_json(&svc.place_order(input, opts).await?)?;
        }
        Command::Policy {
            kill_switch,
            allow_short,
            max_position_pct,
            max_order_notional_cents,
            max_open_positions,
            max_daily_loss_cents,
            max_drawdown_pct,
            blocked,
        } => {
            let patch = PolicyPatch {
                max_position_pct,
                max_order_notional_cents,
                allow_short,
                blocked_symbols: blocked.map(|s| s.split(',').map(str::to_string).collect()),
                max_open_positions,
                max_daily_loss_cents,
                max_drawdown_pct,
                kill_switch_enabled: kill_switch,
            };
            if patch == PolicyPatch::default() {
                print_json(&svc.policy().await)?;
            } else {
                print_json(&svc.update_policy(patch).await?)?;
            }
        }
        Command::Quotes { symbols } => print_json(&svc.quotes(&symbols).await?)?,
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
