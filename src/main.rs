//! Minimal CLI surface (spec §6): start the engine against an optional
//! config-file path, exit 0 on clean shutdown, non-zero on unrecoverable
//! initialization failure. Grounded in the teacher's `main.rs` init
//! sequence (`tracing_subscriber::fmt` with `EnvFilter`, `dotenv().ok()`,
//! `Arc`-wrapped shared state, `tokio::spawn` per task) with the
//! Kalshi-specific bootstrap (account loading, market discovery) dropped
//! in favor of this spec's single fixed trading pair.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use mm_engine::app::Engine;
use mm_engine::config::{Config, ExecMode};
use mm_engine::exchange::fake::FakeExchange;
use mm_engine::exchange::{ExchangeAdapter, MarketDataSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    dotenv().ok();

    let config = load_config()?;
    let exec_mode = config.exec_mode;
    let engine = Engine::new(config);

    let (exchange, market_data) = build_exchange(exec_mode)?;

    tracing::info!("starting engine, press ctrl-c to stop");
    tokio::select! {
        result = engine.run(exchange, market_data) => {
            result.context("engine task exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

fn load_config() -> Result<Config> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    match path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

/// Live mode needs a real exchange transport, which this crate treats as
/// an external collaborator behind `ExchangeAdapter`/`MarketDataSource`
/// (spec §1's out-of-scope boundary) — none is wired in here, so `Live`
/// fails fast at startup rather than silently running against nothing.
fn build_exchange(mode: ExecMode) -> Result<(Arc<dyn ExchangeAdapter>, Arc<dyn MarketDataSource>)> {
    match mode {
        ExecMode::Paper => {
            let fake = Arc::new(FakeExchange::new());
            Ok((fake.clone() as Arc<dyn ExchangeAdapter>, fake as Arc<dyn MarketDataSource>))
        }
        ExecMode::Live => {
            anyhow::bail!("live exec_mode requires a concrete exchange adapter; none is configured")
        }
    }
}
