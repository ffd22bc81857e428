//! Logging helpers, generalized from the teacher's `report.rs::log_position`
//! (a single structured `tracing::info!` snapshot call) into a small set
//! of snapshot/event loggers for this engine's own state shape.

use std::sync::Arc;

use tracing::{info, warn};

use crate::event_bus::Bus;
use crate::types::Price;

/// One-line structured snapshot of engine state, analogous to the
/// teacher's per-tick position log.
pub fn log_engine_snapshot(symbol: &str, reference_price: Price, position: f64, active_order_count: usize) {
    info!(
        symbol,
        reference_price = %reference_price,
        position,
        active_order_count,
        "engine snapshot"
    );
}

/// Spawns a task that logs every `RiskAlert`, `EmergencyStop`, and
/// `BusOverflow` event at the appropriate level, for operators tailing
/// logs without a metrics sink attached.
pub async fn run_event_logger(bus: Arc<Bus>) -> anyhow::Result<()> {
    let mut risk_alerts = bus.subscribe_risk_alert();
    let mut emergency_stops = bus.subscribe_emergency_stop();
    let mut overflow = bus.subscribe_bus_overflow();

    loop {
        tokio::select! {
            alert = risk_alerts.recv() => {
                if let Ok(alert) = alert {
                    warn!(?alert, "risk alert raised");
                }
            }
            stop = emergency_stops.recv() => {
                if let Ok(stop) = stop {
                    warn!(timestamp = %stop.timestamp, "emergency stop engaged");
                }
            }
            overflow_event = overflow.recv() => {
                if let Ok(overflow_event) = overflow_event {
                    warn!(
                        channel = overflow_event.channel,
                        dropped = overflow_event.dropped,
                        "bus channel overflow"
                    );
                }
            }
        }
    }
}
