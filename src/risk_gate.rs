//! The risk gate (spec §4.6): intercepts every decision the strategy
//! engine emits and either forwards or drops it, in four ordered checks.
//!
//! Grounded in the shape of the risk engine from the wider example pack
//! (per-symbol atomics, an emergency-stop flag, ordered limit checks) but
//! rebuilt in the teacher's async/tracing idiom rather than that example's
//! branch-free `#[repr(C)]` hot path — this engine has one symbol and one
//! decision stream, not a multi-symbol matching-engine hot loop, so there
//! is no case for bit-masked branch-free checks here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::RiskConfig;
use crate::event_bus::{Bus, EmergencyStop, RiskAlert};
use crate::strategy::EmergencyFlag;
use crate::types::{Decision, Price};

/// Running state the four checks consult. Position and order count are
/// read from the live order view by the caller and passed in per check
/// (spec's `current_position`/`active_order_count` are derived quantities,
/// not owned by the gate).
pub struct RiskGate {
    cfg: RiskConfig,
    emergency: EmergencyFlag,
    /// f64 bit pattern; only `record_realized_loss` writes it, so the
    /// load-add-store isn't racing another writer.
    daily_realized_loss: std::sync::atomic::AtomicU64,
    consecutive_price_breaches: AtomicUsize,
    prev_reference: std::sync::Mutex<Option<Price>>,
}

impl RiskGate {
    pub fn new(cfg: RiskConfig, emergency: EmergencyFlag) -> Self {
        Self {
            cfg,
            emergency,
            daily_realized_loss: std::sync::atomic::AtomicU64::new(0),
            consecutive_price_breaches: AtomicUsize::new(0),
            prev_reference: std::sync::Mutex::new(None),
        }
    }

    /// Checks 1-2: position and order-count limits (spec §4.6 steps 1-2).
    /// Cancels and reducing amends are always allowed through, since they
    /// can only shrink exposure.
    fn position_and_count_ok(&self, decision: &Decision, current_position: f64, active_order_count: usize) -> bool {
        match decision {
            Decision::Cancel { .. } => true,
            Decision::Amend { .. } => true,
            Decision::Place { .. } => {
                current_position.abs() <= self.cfg.max_position
                    && active_order_count < self.cfg.max_order_count
            }
        }
    }

    /// Check 3: reference-price jump over the check window. Raises a
    /// `RiskAlert::PriceJump`; escalates to `EmergencyStop` if breached on
    /// two consecutive checks.
    fn check_price_change(&self, bus: &Bus, reference_price: Price, now: DateTime<Utc>) -> bool {
        let mut prev_guard = self.prev_reference.lock().unwrap();
        let Some(prev) = *prev_guard else {
            *prev_guard = Some(reference_price);
            return true;
        };
        let change = reference_price.frac_deviation(prev);
        *prev_guard = Some(reference_price);
        drop(prev_guard);

        if change <= self.cfg.max_price_change {
            self.consecutive_price_breaches.store(0, Ordering::SeqCst);
            return true;
        }

        bus.publish_risk_alert(RiskAlert::PriceJump {
            change,
            limit: self.cfg.max_price_change,
        });
        let breaches = self.consecutive_price_breaches.fetch_add(1, Ordering::SeqCst) + 1;
        if breaches >= 2 {
            self.trip_emergency_stop(bus, now);
        }
        false
    }

    /// Check 4: daily realized loss. Caller reports realized loss deltas
    /// via [`RiskGate::record_realized_loss`]; breach trips
    /// `EmergencyStop` immediately (spec §4.6 step 4).
    fn check_daily_loss(&self, bus: &Bus, now: DateTime<Utc>) -> bool {
        let loss = f64::from_bits(self.daily_realized_loss.load(Ordering::SeqCst));
        if loss <= self.cfg.max_daily_loss {
            return true;
        }
        bus.publish_risk_alert(RiskAlert::DailyLoss {
            loss,
            limit: self.cfg.max_daily_loss,
        });
        self.trip_emergency_stop(bus, now);
        false
    }

    pub fn record_realized_loss(&self, loss: f64) {
        let current = f64::from_bits(self.daily_realized_loss.load(Ordering::SeqCst));
        self.daily_realized_loss
            .store((current + loss).to_bits(), Ordering::SeqCst);
    }

    fn trip_emergency_stop(&self, bus: &Bus, now: DateTime<Utc>) {
        if !self.emergency.is_tripped() {
            warn!("risk gate tripping emergency stop");
            self.emergency.trip();
            bus.publish_emergency_stop(EmergencyStop { timestamp: now });
        }
    }

    /// Run a decision through all four checks, in order. Returns `true`
    /// if the decision should be forwarded to execution.
    pub fn admit(
        &self,
        bus: &Bus,
        decision: &Decision,
        current_position: f64,
        active_order_count: usize,
        reference_price: Price,
        now: DateTime<Utc>,
    ) -> bool {
        if self.emergency.is_tripped() {
            return matches!(decision, Decision::Cancel { .. });
        }
        if !self.position_and_count_ok(decision, current_position, active_order_count) {
            if active_order_count >= self.cfg.max_order_count {
                bus.publish_risk_alert(RiskAlert::OrderCountLimit {
                    count: active_order_count,
                    limit: self.cfg.max_order_count,
                });
            } else {
                bus.publish_risk_alert(RiskAlert::PositionLimit {
                    position: current_position,
                    limit: self.cfg.max_position,
                });
            }
            return false;
        }
        if !self.check_price_change(bus, reference_price, now) {
            return false;
        }
        self.check_daily_loss(bus, now)
    }
}

/// Position/order-count snapshot the caller supplies per decision; kept
/// as a small struct so `run_risk_gate`'s loop body stays readable.
pub struct RiskContext {
    pub current_position: f64,
    pub active_order_count: usize,
    pub reference_price: Price,
}

/// Drains raw decisions from the bus, gates them, and republishes the
/// survivors on the approved channel. `context` is a callback the engine
/// wires up to read the live order manager + position tracker snapshot at
/// gate time.
pub async fn run_risk_gate<F>(gate: Arc<RiskGate>, bus: Arc<Bus>, context: F) -> anyhow::Result<()>
where
    F: Fn() -> RiskContext + Send + Sync + 'static,
{
    let mut decisions = bus.subscribe_decision();
    loop {
        let decision = match decisions.recv().await {
            Ok(d) => d,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let ctx = context();
        let now = Utc::now();
        if gate.admit(&bus, &decision, ctx.current_position, ctx.active_order_count, ctx.reference_price, now) {
            bus.publish_decision_approved(decision);
        } else {
            tracing::debug!(?decision, "risk gate vetoed decision");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        RiskConfig {
            max_position: 1.0,
            max_order_count: 4,
            max_daily_loss: 500.0,
            max_price_change: 0.05,
            check_interval_s: 5,
        }
    }

    #[test]
    fn cancels_always_pass_even_over_position_limit() {
        let gate = RiskGate::new(cfg(), EmergencyFlag::new());
        let bus = Bus::new();
        let decision = Decision::Cancel {
            client_order_id: uuid::Uuid::new_v4(),
        };
        assert!(gate.admit(&bus, &decision, 10.0, 100, Price::from_f64(30_000.0), Utc::now()));
    }

    #[test]
    fn place_over_position_limit_is_rejected() {
        let gate = RiskGate::new(cfg(), EmergencyFlag::new());
        let bus = Bus::new();
        let decision = Decision::Place {
            side: crate::types::Side::Buy,
            price: Price::from_f64(30_000.0),
            quantity: crate::types::Qty::from_f64(1.0),
        };
        assert!(!gate.admit(&bus, &decision, 2.0, 1, Price::from_f64(30_000.0), Utc::now()));
    }

    #[test]
    fn sustained_price_jump_trips_emergency_stop() {
        let emergency = EmergencyFlag::new();
        let gate = RiskGate::new(cfg(), emergency.clone());
        let bus = Bus::new();
        let decision = Decision::Cancel {
            client_order_id: uuid::Uuid::new_v4(),
        };

        gate.admit(&bus, &decision, 0.0, 0, Price::from_f64(30_000.0), Utc::now());
        gate.admit(&bus, &decision, 0.0, 0, Price::from_f64(33_000.0), Utc::now());
        assert!(!emergency.is_tripped(), "single breach should not yet trip");
        gate.admit(&bus, &decision, 0.0, 0, Price::from_f64(36_000.0), Utc::now());
        assert!(emergency.is_tripped(), "second consecutive breach should trip");
    }

    #[test]
    fn daily_loss_breach_trips_emergency_stop() {
        let emergency = EmergencyFlag::new();
        let gate = RiskGate::new(cfg(), emergency.clone());
        let bus = Bus::new();
        gate.record_realized_loss(600.0);
        let decision = Decision::Cancel {
            client_order_id: uuid::Uuid::new_v4(),
        };
        gate.admit(&bus, &decision, 0.0, 0, Price::from_f64(30_000.0), Utc::now());
        assert!(emergency.is_tripped());
    }
}
