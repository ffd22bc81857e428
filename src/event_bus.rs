//! A single in-process publish/subscribe bus with one typed channel per
//! event kind (spec §4.7). Dispatch is by field access on [`Bus`], not by
//! dynamic trait object — mirroring the tagged-variant convention used for
//! [`crate::types::Decision`].
//!
//! Market-data channels (`MarketTrade`, `BookUpdate`) are unbounded: they
//! are the control signal and must never be dropped. Decision/ack channels
//! are bounded `broadcast` channels; when a bounded channel's buffer is
//! exhausted, `tokio::sync::broadcast` drops the oldest entries for lagging
//! subscribers, and the bus surfaces that as a `BusOverflow` event on the
//! (also bounded, but much larger) overflow channel, counted in the
//! [`BusMetrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::order_manager::OrderStateChanged;
use crate::types::{Decision, Price, Qty, Side};

#[derive(Debug, Clone)]
pub struct MarketTrade {
    pub price: Price,
    pub quantity: Qty,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub best_bid: Price,
    pub best_ask: Price,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceUpdate {
    pub value: Price,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub client_order_id: Uuid,
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderReject {
    pub client_order_id: Uuid,
    pub reason: String,
    pub transient: bool,
}

#[derive(Debug, Clone)]
pub struct AmendAck {
    pub client_order_id: Uuid,
    pub price: Price,
    pub quantity: Qty,
}

#[derive(Debug, Clone)]
pub struct AmendReject {
    pub client_order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CancelAck {
    pub client_order_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct CancelReject {
    pub client_order_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ResetTick {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RiskAlert {
    PositionLimit { position: f64, limit: f64 },
    OrderCountLimit { count: usize, limit: usize },
    PriceJump { change: f64, limit: f64 },
    DailyLoss { loss: f64, limit: f64 },
}

#[derive(Debug, Clone, Copy)]
pub struct EmergencyStop {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BusOverflow {
    pub channel: &'static str,
    pub dropped: u64,
}

/// Per-channel drop counters, exposed for metrics sinks. Names intentionally
/// mirror the event kinds they track.
#[derive(Debug, Default)]
pub struct BusMetrics {
    pub decision_dropped: AtomicU64,
    pub ack_dropped: AtomicU64,
    pub order_state_dropped: AtomicU64,
}

const CHANNEL_CAPACITY: usize = 1024;

/// The event bus. Constructed once at startup and shared via `Arc` —
/// consistent with "no global singletons" (spec §9): every component that
/// needs to publish or subscribe is handed a reference at construction.
pub struct Bus {
    market_trade_tx: mpsc::UnboundedSender<MarketTrade>,
    market_trade_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<MarketTrade>>>,

    book_update_tx: mpsc::UnboundedSender<BookUpdate>,
    book_update_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<BookUpdate>>>,

    price_update: broadcast::Sender<PriceUpdate>,
    /// Raw decisions as emitted by the strategy engine, before the risk
    /// gate has had a chance to veto them.
    decision: broadcast::Sender<Decision>,
    /// Decisions the risk gate has approved; the execution engine
    /// subscribes here, never to `decision` directly (spec §4.6: every
    /// decision passes through the gate first).
    decision_approved: broadcast::Sender<Decision>,
    order_ack: broadcast::Sender<OrderAck>,
    order_reject: broadcast::Sender<OrderReject>,
    amend_ack: broadcast::Sender<AmendAck>,
    amend_reject: broadcast::Sender<AmendReject>,
    cancel_ack: broadcast::Sender<CancelAck>,
    cancel_reject: broadcast::Sender<CancelReject>,
    order_state_changed: broadcast::Sender<OrderStateChanged>,
    reset_tick: broadcast::Sender<ResetTick>,
    risk_alert: broadcast::Sender<RiskAlert>,
    emergency_stop: broadcast::Sender<EmergencyStop>,
    bus_overflow: broadcast::Sender<BusOverflow>,

    pub metrics: Arc<BusMetrics>,
}

impl Bus {
    pub fn new() -> Self {
        let (market_trade_tx, market_trade_rx) = mpsc::unbounded_channel();
        let (book_update_tx, book_update_rx) = mpsc::unbounded_channel();

        Self {
            market_trade_tx,
            market_trade_rx: std::sync::Mutex::new(Some(market_trade_rx)),
            book_update_tx,
            book_update_rx: std::sync::Mutex::new(Some(book_update_rx)),
            price_update: broadcast::channel(CHANNEL_CAPACITY).0,
            decision: broadcast::channel(CHANNEL_CAPACITY).0,
            decision_approved: broadcast::channel(CHANNEL_CAPACITY).0,
            order_ack: broadcast::channel(CHANNEL_CAPACITY).0,
            order_reject: broadcast::channel(CHANNEL_CAPACITY).0,
            amend_ack: broadcast::channel(CHANNEL_CAPACITY).0,
            amend_reject: broadcast::channel(CHANNEL_CAPACITY).0,
            cancel_ack: broadcast::channel(CHANNEL_CAPACITY).0,
            cancel_reject: broadcast::channel(CHANNEL_CAPACITY).0,
            order_state_changed: broadcast::channel(CHANNEL_CAPACITY).0,
            reset_tick: broadcast::channel(64).0,
            risk_alert: broadcast::channel(256).0,
            emergency_stop: broadcast::channel(16).0,
            bus_overflow: broadcast::channel(256).0,
            metrics: Arc::new(BusMetrics::default()),
        }
    }

    // --- market data: never dropped, unbounded, single-consumer mpsc ---

    pub fn publish_market_trade(&self, event: MarketTrade) {
        // An unbounded channel with no receiver left simply means the
        // consumer task has shut down; dropping the send is the right
        // behavior during teardown.
        let _ = self.market_trade_tx.send(event);
    }

    pub fn take_market_trade_receiver(&self) -> Option<mpsc::UnboundedReceiver<MarketTrade>> {
        self.market_trade_rx.lock().unwrap().take()
    }

    pub fn publish_book_update(&self, event: BookUpdate) {
        let _ = self.book_update_tx.send(event);
    }

    pub fn take_book_update_receiver(&self) -> Option<mpsc::UnboundedReceiver<BookUpdate>> {
        self.book_update_rx.lock().unwrap().take()
    }

    // --- everything else: bounded broadcast, droppable under overload ---

    pub fn publish_price_update(&self, event: PriceUpdate) {
        let _ = self.price_update.send(event);
    }
    pub fn subscribe_price_update(&self) -> broadcast::Receiver<PriceUpdate> {
        self.price_update.subscribe()
    }

    pub fn publish_decision(&self, event: Decision) {
        if self.decision.send(event).is_err() {
            self.note_overflow("decision", &self.metrics.decision_dropped);
        }
    }
    pub fn subscribe_decision(&self) -> broadcast::Receiver<Decision> {
        self.decision.subscribe()
    }

    pub fn publish_decision_approved(&self, event: Decision) {
        if self.decision_approved.send(event).is_err() {
            self.note_overflow("decision_approved", &self.metrics.decision_dropped);
        }
    }
    pub fn subscribe_decision_approved(&self) -> broadcast::Receiver<Decision> {
        self.decision_approved.subscribe()
    }

    pub fn publish_order_ack(&self, event: OrderAck) {
        let _ = self.order_ack.send(event);
    }
    pub fn subscribe_order_ack(&self) -> broadcast::Receiver<OrderAck> {
        self.order_ack.subscribe()
    }

    pub fn publish_order_reject(&self, event: OrderReject) {
        let _ = self.order_reject.send(event);
    }
    pub fn subscribe_order_reject(&self) -> broadcast::Receiver<OrderReject> {
        self.order_reject.subscribe()
    }

    pub fn publish_amend_ack(&self, event: AmendAck) {
        let _ = self.amend_ack.send(event);
    }
    pub fn subscribe_amend_ack(&self) -> broadcast::Receiver<AmendAck> {
        self.amend_ack.subscribe()
    }

    pub fn publish_amend_reject(&self, event: AmendReject) {
        let _ = self.amend_reject.send(event);
    }
    pub fn subscribe_amend_reject(&self) -> broadcast::Receiver<AmendReject> {
        self.amend_reject.subscribe()
    }

    pub fn publish_cancel_ack(&self, event: CancelAck) {
        let _ = self.cancel_ack.send(event);
    }
    pub fn subscribe_cancel_ack(&self) -> broadcast::Receiver<CancelAck> {
        self.cancel_ack.subscribe()
    }

    pub fn publish_cancel_reject(&self, event: CancelReject) {
        let _ = self.cancel_reject.send(event);
    }
    pub fn subscribe_cancel_reject(&self) -> broadcast::Receiver<CancelReject> {
        self.cancel_reject.subscribe()
    }

    pub fn publish_order_state_changed(&self, event: OrderStateChanged) {
        if self.order_state_changed.send(event).is_err() {
            self.note_overflow("order_state_changed", &self.metrics.order_state_dropped);
        }
    }
    pub fn subscribe_order_state_changed(&self) -> broadcast::Receiver<OrderStateChanged> {
        self.order_state_changed.subscribe()
    }

    pub fn publish_reset_tick(&self, event: ResetTick) {
        let _ = self.reset_tick.send(event);
    }
    pub fn subscribe_reset_tick(&self) -> broadcast::Receiver<ResetTick> {
        self.reset_tick.subscribe()
    }

    pub fn publish_risk_alert(&self, event: RiskAlert) {
        let _ = self.risk_alert.send(event);
    }
    pub fn subscribe_risk_alert(&self) -> broadcast::Receiver<RiskAlert> {
        self.risk_alert.subscribe()
    }

    pub fn publish_emergency_stop(&self, event: EmergencyStop) {
        let _ = self.emergency_stop.send(event);
    }
    pub fn subscribe_emergency_stop(&self) -> broadcast::Receiver<EmergencyStop> {
        self.emergency_stop.subscribe()
    }

    pub fn subscribe_bus_overflow(&self) -> broadcast::Receiver<BusOverflow> {
        self.bus_overflow.subscribe()
    }

    fn note_overflow(&self, channel: &'static str, counter: &AtomicU64) {
        let dropped = counter.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(channel, dropped, "bus channel has no active subscribers or is lagging");
        let _ = self.bus_overflow.send(BusOverflow { channel, dropped });
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
