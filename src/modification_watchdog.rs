//! The stale-modification watchdog (spec §4.3's last row: "any non-terminal
//! order whose amend/cancel has been outstanding longer than
//! `modification_timeout` is force-cancelled"). This is the one place the
//! order manager's transition table is deliberately bypassed, since the
//! exchange may never answer the original amend/cancel at all.
//!
//! Grounded in the same poll-and-act shape as the reset scheduler
//! ([`crate::reset_scheduler`]), narrowed to per-order staleness instead
//! of a whole-pool cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::warn;

use crate::event_bus::{Bus, CancelAck as BusCancelAck, CancelReject as BusCancelReject};
use crate::exchange::ExchangeAdapter;
use crate::execution::retry_with_backoff;
use crate::order_manager::{OrderEvent, OrderManager, OrderStatus};

pub async fn run_modification_watchdog(
    timeout_s: u64,
    max_retries: u32,
    retry_delay_s: f64,
    exchange: Arc<dyn ExchangeAdapter>,
    orders: Arc<OrderManager>,
    bus: Arc<Bus>,
) -> anyhow::Result<()> {
    let timeout = ChronoDuration::seconds(timeout_s.max(1) as i64);
    let poll = Duration::from_secs_f64((timeout_s.max(1) as f64 / 2.0).max(1.0));
    let mut ticker = tokio::time::interval(poll);

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();

        let stale: Vec<_> = orders
            .all_non_terminal()
            .into_iter()
            .filter(|o| matches!(o.status, OrderStatus::PendingAmend | OrderStatus::PendingCancel))
            .filter(|o| now - o.updated_at > timeout)
            .collect();

        for order in stale {
            warn!(
                client_order_id = %order.client_order_id,
                status = ?order.status,
                "modification stale past timeout, forcing cancel"
            );
            let Some(changed) = orders.force_to_pending_cancel(order.client_order_id, now) else {
                continue;
            };
            bus.publish_order_state_changed(changed);

            let Some(order_id) = order.order_id.clone() else {
                continue;
            };
            let result = retry_with_backoff(max_retries, retry_delay_s, None, || exchange.cancel(&order_id)).await;
            let now = chrono::Utc::now();
            match result {
                Ok(()) => {
                    if let Some(changed) = orders.apply_event(order.client_order_id, OrderEvent::CancelAcked, now) {
                        bus.publish_order_state_changed(changed);
                    }
                    bus.publish_cancel_ack(BusCancelAck {
                        client_order_id: order.client_order_id,
                    });
                }
                Err(err) => {
                    if let Some(changed) =
                        orders.apply_event(order.client_order_id, OrderEvent::CancelRejected, now)
                    {
                        bus.publish_order_state_changed(changed);
                    }
                    bus.publish_cancel_reject(BusCancelReject {
                        client_order_id: order.client_order_id,
                        reason: err.message,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::fake::FakeExchange;
    use crate::types::{Price, Qty, Side};

    #[tokio::test]
    async fn stale_pending_amend_is_force_cancelled() {
        let orders = Arc::new(OrderManager::new(16, 4));
        let bus = Arc::new(Bus::new());
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange::new());

        let now = chrono::Utc::now() - chrono::Duration::seconds(30);
        let id = orders.insert_pending(Side::Buy, Price::from_f64(100.0), Qty::from_f64(1.0), now);
        orders.apply_event(id, OrderEvent::Acked, now);
        orders.link_order_id(id, "exch-1");
        orders.apply_event(id, OrderEvent::AmendRequested, now);

        let watchdog = tokio::spawn(run_modification_watchdog(
            1,
            1,
            0.01,
            exchange,
            Arc::clone(&orders),
            Arc::clone(&bus),
        ));

        tokio::time::sleep(Duration::from_millis(900)).await;
        watchdog.abort();

        assert_eq!(orders.get(id).unwrap().status, OrderStatus::Cancelled);
    }
}
