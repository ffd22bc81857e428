//! Top-level wiring: constructs every shared component once and spawns one
//! task per logical concurrency unit (spec §5). Grounded in the teacher's
//! `main.rs` (`Arc`-wrapped shared state, a `tokio::spawn` per task, the
//! engine's own evaluation loop running on the caller's task so a single
//! `.await` still reports the first fatal error) — generalized from a
//! bespoke one-off wiring block into a reusable `Engine` type so both the
//! binary and integration tests can construct the same wiring.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::info;

use crate::config::Config;
use crate::event_bus::Bus;
use crate::exchange::{ExchangeAdapter, MarketDataSource};
use crate::order_manager::OrderManager;
use crate::position::{run_position_tracker, PositionTracker};
use crate::price_estimator::run_price_estimator;
use crate::reset_scheduler::run_reset_scheduler;
use crate::risk_gate::{run_risk_gate, RiskContext, RiskGate};
use crate::strategy::{run_strategy_engine, EmergencyFlag};
use crate::types::Price;

mod market_feed {
    use super::*;

    /// Pulls trades and book updates off the injected `MarketDataSource`
    /// and republishes them on the bus's never-dropped market-data
    /// channels. Mirrors the teacher's `ws/task.rs` role of bridging an
    /// external stream into shared state, narrowed to the trait boundary
    /// this spec draws around the transport.
    pub async fn run(market_data: Arc<dyn MarketDataSource>, bus: Arc<Bus>) -> anyhow::Result<()> {
        let trades = {
            let market_data = Arc::clone(&market_data);
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                while let Some(trade) = market_data.next_trade().await {
                    bus.publish_market_trade(trade);
                }
            })
        };
        let books = tokio::spawn(async move {
            while let Some(update) = market_data.next_book_update().await {
                bus.publish_book_update(update);
            }
        });
        tokio::try_join!(trades, books)?;
        Ok(())
    }
}

/// Tracks the latest `PriceUpdate` so the risk gate's per-decision context
/// closure can read it synchronously without its own channel subscription.
struct LastReferencePrice(Mutex<Price>);

impl LastReferencePrice {
    fn new() -> Self {
        Self(Mutex::new(Price::ZERO))
    }

    fn get(&self) -> Price {
        *self.0.lock().unwrap()
    }

    async fn run(self: Arc<Self>, bus: Arc<Bus>) {
        let mut updates = bus.subscribe_price_update();
        while let Ok(update) = updates.recv().await {
            *self.0.lock().unwrap() = update.value;
        }
    }
}

/// The constructed engine: every shared component, owned for the
/// lifetime of the process (spec §9 "no global singletons" — constructed
/// once here, injected everywhere else).
pub struct Engine {
    pub config: Config,
    pub bus: Arc<Bus>,
    pub orders: Arc<OrderManager>,
    pub risk_gate: Arc<RiskGate>,
    pub position: Arc<PositionTracker>,
    pub emergency: EmergencyFlag,
}

impl Engine {
    pub fn new(config: Config) -> Arc<Self> {
        let emergency = EmergencyFlag::new();
        let orders = Arc::new(OrderManager::new(
            config.order_management.history_capacity,
            config.order_management.max_pending_modifications,
        ));
        let risk_gate = Arc::new(RiskGate::new(config.risk.clone(), emergency.clone()));
        Arc::new(Self {
            bus: Arc::new(Bus::new()),
            orders,
            risk_gate,
            position: Arc::new(PositionTracker::new()),
            emergency,
            config,
        })
    }

    /// Spawns every task and blocks until the first one exits (fatal
    /// error or, in tests, deliberate shutdown). Mirrors the teacher's
    /// `main.rs`: every other task is `tokio::spawn`ed, the strategy
    /// engine runs as the "main" loop driving the return value.
    pub async fn run(
        self: Arc<Self>,
        exchange: Arc<dyn ExchangeAdapter>,
        market_data: Arc<dyn MarketDataSource>,
    ) -> anyhow::Result<()> {
        info!(symbol = %self.config.strategy.symbol, exec_mode = ?self.config.exec_mode, "engine starting");

        let last_price = Arc::new(LastReferencePrice::new());
        tokio::spawn(Arc::clone(&last_price).run(Arc::clone(&self.bus)));

        tokio::spawn(market_feed::run(Arc::clone(&market_data), Arc::clone(&self.bus)));

        tokio::spawn(run_price_estimator(self.config.price.clone(), Arc::clone(&self.bus)));

        tokio::spawn(run_execution_engine_task(
            self.config.execution.clone(),
            Arc::clone(&exchange),
            Arc::clone(&self.orders),
            Arc::clone(&self.bus),
        ));

        tokio::spawn(run_reset_scheduler(
            self.config.order_management.reset_interval_s,
            Arc::clone(&self.orders),
            Arc::clone(&self.bus),
        ));

        tokio::spawn(crate::modification_watchdog::run_modification_watchdog(
            self.config.order_management.modification_timeout_s,
            self.config.execution.max_retries,
            self.config.execution.retry_delay_s,
            Arc::clone(&exchange),
            Arc::clone(&self.orders),
            Arc::clone(&self.bus),
        ));

        tokio::spawn(run_cleanup_sweep(
            self.config.order_management.cleanup_interval_s,
            Arc::clone(&self.orders),
        ));

        tokio::spawn(run_position_tracker(
            Arc::clone(&self.position),
            Arc::clone(&self.risk_gate),
            Arc::clone(&self.bus),
        ));

        {
            let risk_gate = Arc::clone(&self.risk_gate);
            let bus = Arc::clone(&self.bus);
            let orders = Arc::clone(&self.orders);
            let position = Arc::clone(&self.position);
            let last_price = Arc::clone(&last_price);
            tokio::spawn(run_risk_gate(risk_gate, bus, move || RiskContext {
                current_position: position.net_position(),
                active_order_count: orders.all_non_terminal().len(),
                reference_price: last_price.get(),
            }));
        }

        tokio::spawn(crate::observability::run_event_logger(Arc::clone(&self.bus)));

        tokio::spawn(run_engine_snapshot_logger(
            self.config.risk.check_interval_s,
            self.config.strategy.symbol.clone(),
            Arc::clone(&last_price),
            Arc::clone(&self.position),
            Arc::clone(&self.orders),
        ));

        // The strategy engine runs on the calling task, same role the
        // teacher's `engine::task::run_engine(...)` plays as the last line
        // of `main`: its return ends the process.
        run_strategy_engine(
            self.config.strategy.clone(),
            self.emergency.clone(),
            Arc::clone(&self.orders),
            Arc::clone(&self.bus),
        )
        .await
    }
}

async fn run_execution_engine_task(
    cfg: crate::config::ExecutionConfig,
    exchange: Arc<dyn ExchangeAdapter>,
    orders: Arc<OrderManager>,
    bus: Arc<Bus>,
) -> anyhow::Result<()> {
    crate::execution::run_execution_engine(cfg, exchange, orders, bus).await
}

/// Periodic history-ring sweep (spec §4.3 "Cleanup"): drops terminal
/// orders older than the sweep interval out of the live index.
async fn run_cleanup_sweep(cleanup_interval_s: u64, orders: Arc<OrderManager>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(cleanup_interval_s.max(1)));
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        let swept = orders.sweep_terminal(chrono::Duration::seconds(cleanup_interval_s.max(1) as i64), now);
        if swept > 0 {
            tracing::debug!(swept, "cleanup sweep removed terminal orders");
        }
    }
}

/// One-line engine snapshot on the same cadence the risk gate uses to
/// re-check its limits, for operators tailing logs without a metrics sink
/// attached.
async fn run_engine_snapshot_logger(
    check_interval_s: u64,
    symbol: String,
    last_price: Arc<LastReferencePrice>,
    position: Arc<PositionTracker>,
    orders: Arc<OrderManager>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(check_interval_s.max(1)));
    loop {
        ticker.tick().await;
        crate::observability::log_engine_snapshot(
            &symbol,
            last_price.get(),
            position.net_position(),
            orders.all_non_terminal().len(),
        );
    }
}
