//! The periodic reset scheduler (spec §4.5): a cooperative timer that
//! emits `ResetTick` every `reset_interval_s` seconds. It never cancels
//! orders itself — the strategy engine does that — and coalesces a tick
//! whose previous cascade is still draining instead of queuing it.
//!
//! Grounded in the teacher's `engine/task.rs::run_engine` tick loop
//! (`tokio::time::interval` driving a periodic re-evaluation), narrowed
//! to just the timer-and-publish responsibility this component owns.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event_bus::{Bus, ResetTick};
use crate::order_manager::OrderManager;

/// A cascade is "draining" if any order that was non-terminal at the
/// previous tick is still non-terminal — the strategy engine's cancels
/// (and the execution engine's acks) haven't fully landed yet.
fn still_draining(orders: &OrderManager, outstanding: &HashSet<Uuid>) -> bool {
    let live: HashSet<Uuid> = orders.all_non_terminal().into_iter().map(|o| o.client_order_id).collect();
    outstanding.iter().any(|id| live.contains(id))
}

pub async fn run_reset_scheduler(
    reset_interval_s: u64,
    orders: Arc<OrderManager>,
    bus: Arc<Bus>,
) -> anyhow::Result<()> {
    let mut ticker = interval(Duration::from_secs(reset_interval_s.max(1)));
    // The first tick fires immediately; skip it so resets start one
    // interval after engine start, not at t=0.
    ticker.tick().await;

    let mut outstanding: HashSet<Uuid> = HashSet::new();

    loop {
        ticker.tick().await;

        if !outstanding.is_empty() && still_draining(&orders, &outstanding) {
            warn!(count = outstanding.len(), "previous reset cascade still draining, coalescing this tick");
            continue;
        }

        let timestamp = chrono::Utc::now();
        debug!(%timestamp, "emitting reset tick");
        bus.publish_reset_tick(ResetTick { timestamp });

        outstanding = orders.all_non_terminal().into_iter().map(|o| o.client_order_id).collect();
    }
}
