//! Order lifecycle state machine and concurrent order index (spec §4.3).
//!
//! Grounded in the teacher's `state/orders.rs::Orders` (primary index by
//! `client_order_id`, reverse index by exchange `order_id`, fill
//! application), generalized from a flat `HashMap` behind the caller's own
//! lock into a `DashMap`-backed index so lookups don't serialize on a
//! single mutex, and extended with the explicit pending-amend/pending-cancel
//! states and transition table spec §4.3 calls for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use crate::types::{Price, Qty, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    PendingNew,
    Active,
    PendingAmend,
    PendingCancel,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Events that drive the order state machine. One variant per ack/reject/
/// fill kind the execution engine or exchange feed can report.
#[derive(Debug, Clone, Copy)]
pub enum OrderEvent {
    Acked,
    Rejected,
    AmendRequested,
    AmendAcked { price: Price, quantity: Qty },
    AmendRejected,
    CancelRequested,
    CancelAcked,
    CancelRejected,
    Filled { quantity: Qty },
}

/// Pure transition table: `(status, event) -> next status`, or `None` if
/// the event is not valid from that status (spec §4.3 invariant: illegal
/// transitions are refused, not silently coerced). `Filled` is special:
/// a partial fill keeps the order in its current non-terminal status (so
/// it can still resolve its pending amend/cancel), a complete fill always
/// moves to `Filled`; `is_complete` is resolved by the caller, which knows
/// the order's remaining quantity.
fn transition(status: OrderStatus, event: &OrderEvent, is_complete_fill: bool) -> Option<OrderStatus> {
    use OrderEvent::*;
    use OrderStatus::*;
    match (status, event) {
        (PendingNew, Acked) => Some(Active),
        (PendingNew, Rejected) => Some(Rejected),

        (Active, AmendRequested) => Some(PendingAmend),
        (Active, CancelRequested) => Some(PendingCancel),
        (Active, Filled { .. }) => Some(if is_complete_fill { Filled } else { Active }),

        (PendingAmend, AmendAcked { .. }) => Some(Active),
        (PendingAmend, AmendRejected) => Some(Active),
        (PendingAmend, Filled { .. }) => Some(if is_complete_fill { Filled } else { PendingAmend }),

        (PendingCancel, CancelAcked) => Some(Cancelled),
        (PendingCancel, CancelRejected) => Some(Active),
        (PendingCancel, Filled { .. }) => Some(if is_complete_fill { Filled } else { PendingCancel }),

        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub client_order_id: Uuid,
    pub order_id: Option<String>,
    pub side: Side,
    pub price: Price,
    pub quantity: Qty,
    pub filled_quantity: Qty,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every accepted amend, price-only, qty-only or both
    /// (resolved open question, see DESIGN.md).
    pub amend_count: u64,
}

impl Order {
    fn new(client_order_id: Uuid, side: Side, price: Price, quantity: Qty, now: DateTime<Utc>) -> Self {
        Self {
            client_order_id,
            order_id: None,
            side,
            price,
            quantity,
            filled_quantity: Qty::ZERO,
            status: OrderStatus::PendingNew,
            created_at: now,
            updated_at: now,
            amend_count: 0,
        }
    }

    pub fn remaining(&self) -> Qty {
        self.quantity.saturating_sub(self.filled_quantity)
    }
}

/// The quantity newly filled by one `Filled` event, with the side/price
/// it executed at, so [`crate::position::PositionTracker`] can update
/// exposure without re-reading the order record after the mutation.
#[derive(Debug, Clone, Copy)]
pub struct FillDelta {
    pub side: Side,
    pub price: Price,
    pub quantity: Qty,
}

#[derive(Debug, Clone)]
pub struct OrderStateChanged {
    pub client_order_id: Uuid,
    pub previous: OrderStatus,
    pub current: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub fill: Option<FillDelta>,
}

/// Concurrent order index plus bounded transition history. Constructed
/// once and shared via `Arc`, matching the teacher's `Shared` state holder.
pub struct OrderManager {
    by_client: DashMap<Uuid, Order>,
    by_order_id: DashMap<String, Uuid>,
    by_side: DashMap<Side, DashSet<Uuid>>,

    history: Mutex<VecDeque<OrderStateChanged>>,
    history_capacity: usize,

    pending_modifications: AtomicUsize,
    max_pending_modifications: usize,
}

impl OrderManager {
    pub fn new(history_capacity: usize, max_pending_modifications: usize) -> Self {
        let by_side = DashMap::new();
        by_side.insert(Side::Buy, DashSet::new());
        by_side.insert(Side::Sell, DashSet::new());
        Self {
            by_client: DashMap::new(),
            by_order_id: DashMap::new(),
            by_side,
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity: history_capacity.max(1),
            pending_modifications: AtomicUsize::new(0),
            max_pending_modifications: max_pending_modifications.max(1),
        }
    }

    /// Register a brand-new order in `PendingNew`. Returns the generated
    /// client order id.
    pub fn insert_pending(&self, side: Side, price: Price, quantity: Qty, now: DateTime<Utc>) -> Uuid {
        let client_order_id = Uuid::new_v4();
        let order = Order::new(client_order_id, side, price, quantity, now);
        self.by_client.insert(client_order_id, order);
        if let Some(set) = self.by_side.get(&side) {
            set.insert(client_order_id);
        }
        client_order_id
    }

    pub fn link_order_id(&self, client_order_id: Uuid, order_id: &str) {
        if let Some(mut rec) = self.by_client.get_mut(&client_order_id) {
            rec.order_id = Some(order_id.to_string());
        }
        self.by_order_id.insert(order_id.to_string(), client_order_id);
    }

    pub fn client_for_order_id(&self, order_id: &str) -> Option<Uuid> {
        self.by_order_id.get(order_id).map(|e| *e)
    }

    /// Reserve a modification slot. Returns `false` if the cap in spec
    /// §4.3/§6 (`max_pending_modifications`) is already reached, in which
    /// case the caller must not submit the amend/cancel.
    pub fn try_begin_modification(&self) -> bool {
        let mut current = self.pending_modifications.load(Ordering::SeqCst);
        loop {
            if current >= self.max_pending_modifications {
                return false;
            }
            match self.pending_modifications.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn end_modification(&self) {
        self.pending_modifications.fetch_sub(1, Ordering::SeqCst);
    }

    /// Apply a lifecycle event to an order, update both indices, push a
    /// bounded history entry and return the resulting [`OrderStateChanged`].
    /// Returns `None` if the client id is unknown or the transition is
    /// illegal from the order's current status.
    pub fn apply_event(
        &self,
        client_order_id: Uuid,
        event: OrderEvent,
        now: DateTime<Utc>,
    ) -> Option<OrderStateChanged> {
        let mut rec = self.by_client.get_mut(&client_order_id)?;
        let previous = rec.status;

        let is_complete_fill = if let OrderEvent::Filled { quantity } = event {
            rec.filled_quantity.saturating_add(quantity) >= rec.quantity
        } else {
            false
        };
        let next = transition(previous, &event, is_complete_fill)?;

        let fill = if let OrderEvent::Filled { quantity } = event {
            Some(FillDelta {
                side: rec.side,
                price: rec.price,
                quantity,
            })
        } else {
            None
        };

        if let OrderEvent::AmendAcked { price, quantity } = event {
            rec.price = price;
            rec.quantity = quantity;
            rec.amend_count += 1;
        }
        if let OrderEvent::Filled { quantity } = event {
            rec.filled_quantity = rec.filled_quantity.saturating_add(quantity).min(rec.quantity);
        }

        rec.status = next;
        rec.updated_at = now;
        drop(rec);

        if next.is_terminal() {
            if let Some(side) = self.by_client.get(&client_order_id).map(|r| r.side) {
                if let Some(bucket) = self.by_side.get(&side) {
                    bucket.remove(&client_order_id);
                }
            }
        }

        let changed = OrderStateChanged {
            client_order_id,
            previous,
            current: next,
            timestamp: now,
            fill,
        };
        self.push_history(changed.clone());
        Some(changed)
    }

    /// Force any non-terminal order directly into `PendingCancel`,
    /// bypassing the normal transition table. The one sanctioned exception
    /// to §4.3's table (spec: "amend/cancel stale > modification_timeout
    /// → force-cancel retry path"), used only by the modification
    /// watchdog on a stale amend/cancel.
    pub fn force_to_pending_cancel(&self, client_order_id: Uuid, now: DateTime<Utc>) -> Option<OrderStateChanged> {
        let mut rec = self.by_client.get_mut(&client_order_id)?;
        if rec.status.is_terminal() || rec.status == OrderStatus::PendingCancel {
            return None;
        }
        let previous = rec.status;
        rec.status = OrderStatus::PendingCancel;
        rec.updated_at = now;
        drop(rec);

        let changed = OrderStateChanged {
            client_order_id,
            previous,
            current: OrderStatus::PendingCancel,
            timestamp: now,
            fill: None,
        };
        self.push_history(changed.clone());
        Some(changed)
    }

    fn push_history(&self, entry: OrderStateChanged) {
        let mut history = self.history.lock().unwrap();
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(entry);
    }

    pub fn get(&self, client_order_id: Uuid) -> Option<Order> {
        self.by_client.get(&client_order_id).map(|r| r.clone())
    }

    /// All resting (status `Active`) orders on one side, for the strategy
    /// engine's per-side reconciliation pass.
    pub fn active_on_side(&self, side: Side) -> Vec<Order> {
        let Some(set) = self.by_side.get(&side) else {
            return Vec::new();
        };
        set.iter()
            .filter_map(|id| self.by_client.get(&id).map(|r| r.clone()))
            .filter(|o| o.status == OrderStatus::Active)
            .collect()
    }

    pub fn all_non_terminal(&self) -> Vec<Order> {
        self.by_client
            .iter()
            .map(|e| e.value().clone())
            .filter(|o| !o.status.is_terminal())
            .collect()
    }

    /// Drop terminal orders older than `max_age` from the live index, as
    /// the periodic cleanup sweep (spec §4.3 `cleanup_interval_s`). History
    /// already holds their transitions, so nothing is lost.
    pub fn sweep_terminal(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        let stale: Vec<Uuid> = self
            .by_client
            .iter()
            .filter(|e| e.value().status.is_terminal() && now - e.value().updated_at > max_age)
            .map(|e| *e.key())
            .collect();

        for id in &stale {
            if let Some((_, order)) = self.by_client.remove(id) {
                if let Some(order_id) = order.order_id {
                    self.by_order_id.remove(&order_id);
                }
            }
        }
        stale.len()
    }

    pub fn history_snapshot(&self) -> Vec<OrderStateChanged> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn new_order_starts_pending_new() {
        let mgr = OrderManager::new(16, 4);
        let id = mgr.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now());
        assert_eq!(mgr.get(id).unwrap().status, OrderStatus::PendingNew);
    }

    #[test]
    fn ack_then_cancel_round_trip() {
        let mgr = OrderManager::new(16, 4);
        let id = mgr.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now());
        mgr.apply_event(id, OrderEvent::Acked, now()).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, OrderStatus::Active);

        mgr.apply_event(id, OrderEvent::CancelRequested, now()).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, OrderStatus::PendingCancel);

        mgr.apply_event(id, OrderEvent::CancelAcked, now()).unwrap();
        assert_eq!(mgr.get(id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn illegal_transition_is_refused() {
        let mgr = OrderManager::new(16, 4);
        let id = mgr.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now());
        // Still PendingNew: a cancel ack is not a legal event from here.
        assert!(mgr.apply_event(id, OrderEvent::CancelAcked, now()).is_none());
        assert_eq!(mgr.get(id).unwrap().status, OrderStatus::PendingNew);
    }

    #[test]
    fn amend_count_increments_on_any_successful_amend() {
        let mgr = OrderManager::new(16, 4);
        let id = mgr.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now());
        mgr.apply_event(id, OrderEvent::Acked, now()).unwrap();
        mgr.apply_event(id, OrderEvent::AmendRequested, now()).unwrap();
        mgr.apply_event(
            id,
            OrderEvent::AmendAcked {
                price: Price::from_f64(101.0),
                quantity: Qty::from_f64(1.0),
            },
            now(),
        )
        .unwrap();
        assert_eq!(mgr.get(id).unwrap().amend_count, 1);
    }

    #[test]
    fn pending_modification_cap_is_enforced() {
        let mgr = OrderManager::new(16, 2);
        assert!(mgr.try_begin_modification());
        assert!(mgr.try_begin_modification());
        assert!(!mgr.try_begin_modification());
        mgr.end_modification();
        assert!(mgr.try_begin_modification());
    }

    #[test]
    fn filled_order_drops_out_of_active_side_index() {
        let mgr = OrderManager::new(16, 4);
        let id = mgr.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now());
        mgr.apply_event(id, OrderEvent::Acked, now()).unwrap();
        assert_eq!(mgr.active_on_side(Side::Buy).len(), 1);
        mgr.apply_event(
            id,
            OrderEvent::Filled {
                quantity: Qty::from_f64(1.0),
            },
            now(),
        )
        .unwrap();
        assert_eq!(mgr.active_on_side(Side::Buy).len(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let mgr = OrderManager::new(2, 4);
        let id = mgr.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now());
        mgr.apply_event(id, OrderEvent::Acked, now()).unwrap();
        mgr.apply_event(id, OrderEvent::CancelRequested, now()).unwrap();
        mgr.apply_event(id, OrderEvent::CancelAcked, now()).unwrap();
        assert!(mgr.history_snapshot().len() <= 2);
    }
}
