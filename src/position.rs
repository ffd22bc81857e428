//! Net position and realized P&L tracking, generalized from the teacher's
//! `state/position.rs::Position` (per-side qty/cost-cc accumulators,
//! average-cost lookup) into a single signed net position over one spot
//! pair, with realized P&L recognized on every reducing or flipping fill.
//!
//! Grounded in `state/position.rs::apply_fill`'s cost-accumulation shape;
//! the pair-cost/imbalance helpers that function built for two-outcome
//! Yes/No markets have no counterpart here and are dropped.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::debug;

use crate::event_bus::Bus;
use crate::risk_gate::RiskGate;
use crate::types::{Price, Qty, Side};

#[derive(Debug, Clone, Copy, Default)]
struct PositionState {
    /// Signed base-currency quantity: positive is long, negative is short.
    net_qty: f64,
    /// Cost basis carrying the same sign as `net_qty`.
    cost_basis: f64,
    realized_pnl: f64,
}

/// Average-cost position tracker. One instance per engine, shared via
/// `Arc` and updated only from [`run_position_tracker`].
#[derive(Default)]
pub struct PositionTracker {
    state: Mutex<PositionState>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn net_position(&self) -> f64 {
        self.state.lock().unwrap().net_qty
    }

    pub fn realized_pnl(&self) -> f64 {
        self.state.lock().unwrap().realized_pnl
    }

    /// Apply one fill, recognizing realized P&L on the portion that
    /// reduces or flips the existing position. Returns the P&L delta
    /// recognized by this fill (0.0 if the fill only adds to exposure).
    pub fn record_fill(&self, side: Side, price: Price, quantity: Qty) -> f64 {
        let signed_qty = match side {
            Side::Buy => quantity.as_f64(),
            Side::Sell => -quantity.as_f64(),
        };
        let fill_price = price.as_f64();
        let mut s = self.state.lock().unwrap();

        let same_direction = s.net_qty == 0.0 || s.net_qty.signum() == signed_qty.signum();
        if same_direction {
            s.net_qty += signed_qty;
            s.cost_basis += signed_qty * fill_price;
            return 0.0;
        }

        let closing_qty = signed_qty.abs().min(s.net_qty.abs());
        let avg_entry = s.cost_basis / s.net_qty;
        let pnl_delta = if s.net_qty > 0.0 {
            closing_qty * (fill_price - avg_entry)
        } else {
            closing_qty * (avg_entry - fill_price)
        };
        s.realized_pnl += pnl_delta;

        let closing_sign = -s.net_qty.signum();
        s.net_qty += closing_sign * closing_qty;
        s.cost_basis = avg_entry * s.net_qty;

        let remaining = signed_qty.abs() - closing_qty;
        if remaining > 0.0 {
            let flipped_sign = signed_qty.signum();
            s.net_qty = flipped_sign * remaining;
            s.cost_basis = flipped_sign * remaining * fill_price;
        }

        pnl_delta
    }
}

/// Drains `OrderStateChanged` events carrying a fill delta, updates the
/// position tracker, and feeds realized losses into the risk gate's daily
/// loss tally (spec §4.6 check 4).
pub async fn run_position_tracker(
    position: Arc<PositionTracker>,
    risk_gate: Arc<RiskGate>,
    bus: Arc<Bus>,
) -> anyhow::Result<()> {
    let mut changes = bus.subscribe_order_state_changed();
    loop {
        let event = match changes.recv().await {
            Ok(e) => e,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let Some(fill) = event.fill else { continue };
        let delta = position.record_fill(fill.side, fill.price, fill.quantity);
        debug!(side = %fill.side, price = %fill.price, quantity = %fill.quantity, delta, "fill applied to position");
        if delta != 0.0 {
            risk_gate.record_realized_loss(-delta);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_fills_accumulate_cost_without_realizing_pnl() {
        let tracker = PositionTracker::new();
        let delta = tracker.record_fill(Side::Buy, Price::from_f64(100.0), Qty::from_f64(2.0));
        assert_eq!(delta, 0.0);
        assert_eq!(tracker.net_position(), 2.0);
        assert_eq!(tracker.realized_pnl(), 0.0);
    }

    #[test]
    fn closing_fill_realizes_profit_at_average_cost() {
        let tracker = PositionTracker::new();
        tracker.record_fill(Side::Buy, Price::from_f64(100.0), Qty::from_f64(2.0));
        let delta = tracker.record_fill(Side::Sell, Price::from_f64(110.0), Qty::from_f64(1.0));
        assert!((delta - 10.0).abs() < 1e-6);
        assert!((tracker.net_position() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flipping_fill_realizes_pnl_on_old_side_and_opens_new_side() {
        let tracker = PositionTracker::new();
        tracker.record_fill(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0));
        let delta = tracker.record_fill(Side::Sell, Price::from_f64(90.0), Qty::from_f64(3.0));
        assert!((delta - (-10.0)).abs() < 1e-6);
        assert!((tracker.net_position() - (-2.0)).abs() < 1e-6);
    }
}
