//! The execution engine (spec §4.4): drains approved decisions through two
//! independent rate-limited worker pools, retries transient failures with
//! exponential backoff, and reconciles exchange responses back into the
//! order manager.
//!
//! Grounded in the teacher's `exec/task.rs::run_exec` (a single task
//! draining an `ExecCommand` channel, dispatching to a live/paper client,
//! then writing the result back into shared state and notifying the
//! engine loop), split here into the two pools spec §4.4 calls for so a
//! burst of amendments cannot starve cancels.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ExecutionConfig;
use crate::event_bus::{
    AmendAck as BusAmendAck, AmendReject as BusAmendReject, Bus, CancelAck as BusCancelAck,
    CancelReject as BusCancelReject, OrderAck as BusOrderAck, OrderReject as BusOrderReject,
};
use crate::exchange::{ExchangeAdapter, ExchangeError};
use crate::order_manager::{OrderEvent, OrderManager};
use crate::rate_limiter::RateLimiter;
use crate::types::Decision;

/// `limiter` is `None` for call sites with no pool of their own (the
/// modification watchdog's force-cancel has no rate-limited pool to
/// throttle); the two execution workers pass their own pool's limiter so a
/// rate-limit refusal (spec §7) gets its dedicated handling — the pool is
/// throttled to half-rate for 10s and the operation is requeued exactly
/// once, before any remaining failures fall through to the plain
/// exponential backoff every other transient failure gets.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    max_retries: u32,
    retry_delay_s: f64,
    limiter: Option<&Arc<RateLimiter>>,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0u32;
    let mut rate_limit_requeued = false;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.rate_limited && !rate_limit_requeued => {
                rate_limit_requeued = true;
                warn!(error = %err, "rate-limit refusal, throttling pool to half-rate for 10s and requeuing once");
                if let Some(limiter) = limiter {
                    limiter.throttle(Duration::from_secs(10));
                }
            }
            Err(err) if err.transient && attempt < max_retries => {
                let delay = retry_delay_s * 2f64.powi(attempt as i32);
                warn!(attempt, delay, error = %err, "transient exchange failure, retrying");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Applies an exchange-response event to the order manager and republishes
/// the resulting `OrderStateChanged` on the bus, so the strategy engine's
/// and position tracker's subscriptions see every reconciliation. Logs at
/// `error!` when the event doesn't apply (spec §7 "invariant violation" —
/// an unknown `client_order_id` or a transition the table refuses) instead
/// of silently dropping it.
fn apply_and_publish(
    orders: &OrderManager,
    bus: &Bus,
    client_order_id: uuid::Uuid,
    event: OrderEvent,
    now: chrono::DateTime<chrono::Utc>,
) -> Option<crate::order_manager::OrderStateChanged> {
    match orders.apply_event(client_order_id, event, now) {
        Some(changed) => {
            bus.publish_order_state_changed(changed.clone());
            Some(changed)
        }
        None => {
            error!(%client_order_id, ?event, "order manager refused reconciliation event");
            None
        }
    }
}

struct Pools {
    transactional_tx: mpsc::Sender<Decision>,
    amend_tx: mpsc::Sender<Decision>,
}

/// Spawns the dispatcher and every worker task for both pools. Returns
/// once the approved-decision channel closes (engine shutdown).
pub async fn run_execution_engine(
    cfg: ExecutionConfig,
    exchange: Arc<dyn ExchangeAdapter>,
    orders: Arc<OrderManager>,
    bus: Arc<Bus>,
) -> anyhow::Result<()> {
    let (transactional_tx, transactional_rx) = mpsc::channel::<Decision>(cfg.batch_size.max(1) * 4);
    let (amend_tx, amend_rx) = mpsc::channel::<Decision>(cfg.batch_size.max(1) * 4);

    let transactional_rx = Arc::new(AsyncMutex::new(transactional_rx));
    let amend_rx = Arc::new(AsyncMutex::new(amend_rx));

    let transactional_limiter = Arc::new(RateLimiter::new(cfg.rate_limit));
    let amend_limiter = Arc::new(RateLimiter::new(cfg.modify_rate_limit));

    let mut workers = Vec::new();
    for worker_id in 0..cfg.worker_count.max(1) {
        workers.push(tokio::spawn(run_transactional_worker(
            worker_id,
            cfg.max_retries,
            cfg.retry_delay_s,
            Arc::clone(&transactional_rx),
            Arc::clone(&transactional_limiter),
            Arc::clone(&exchange),
            Arc::clone(&orders),
            Arc::clone(&bus),
        )));
    }
    for worker_id in 0..cfg.modify_worker_count.max(1) {
        workers.push(tokio::spawn(run_amend_worker(
            worker_id,
            cfg.max_retries,
            cfg.retry_delay_s,
            Arc::clone(&amend_rx),
            Arc::clone(&amend_limiter),
            Arc::clone(&exchange),
            Arc::clone(&orders),
            Arc::clone(&bus),
        )));
    }

    let pools = Pools {
        transactional_tx,
        amend_tx,
    };
    run_dispatcher(pools, bus).await
}

async fn run_dispatcher(pools: Pools, bus: Arc<Bus>) -> anyhow::Result<()> {
    let mut decisions = bus.subscribe_decision_approved();
    loop {
        let decision = match decisions.recv().await {
            Ok(d) => d,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        };
        let send_result = match &decision {
            Decision::Amend { .. } => pools.amend_tx.send(decision).await,
            Decision::Place { .. } | Decision::Cancel { .. } => {
                pools.transactional_tx.send(decision).await
            }
        };
        if send_result.is_err() {
            return Ok(());
        }
    }
}

async fn run_transactional_worker(
    worker_id: usize,
    max_retries: u32,
    retry_delay_s: f64,
    rx: Arc<AsyncMutex<mpsc::Receiver<Decision>>>,
    limiter: Arc<RateLimiter>,
    exchange: Arc<dyn ExchangeAdapter>,
    orders: Arc<OrderManager>,
    bus: Arc<Bus>,
) {
    loop {
        let decision = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(decision) = decision else { return };

        limiter.acquire().await;
        match decision {
            Decision::Place { side, price, quantity } => {
                let now = chrono::Utc::now();
                let client_order_id = orders.insert_pending(side, price, quantity, now);
                let result = retry_with_backoff(max_retries, retry_delay_s, Some(&limiter), || {
                    exchange.place(side, price, quantity)
                })
                .await;
                match result {
                    Ok(ack) => {
                        orders.link_order_id(client_order_id, &ack.order_id);
                        apply_and_publish(&orders, &bus, client_order_id, OrderEvent::Acked, now);
                        info!(worker_id, %client_order_id, order_id = %ack.order_id, "order acked");
                        bus.publish_order_ack(BusOrderAck {
                            client_order_id,
                            order_id: ack.order_id,
                        });
                    }
                    Err(err) => {
                        apply_and_publish(&orders, &bus, client_order_id, OrderEvent::Rejected, now);
                        bus.publish_order_reject(BusOrderReject {
                            client_order_id,
                            reason: err.message,
                            transient: err.transient,
                        });
                    }
                }
            }
            Decision::Cancel { client_order_id } => {
                let Some(order) = orders.get(client_order_id) else {
                    continue;
                };
                if apply_and_publish(
                    &orders,
                    &bus,
                    client_order_id,
                    OrderEvent::CancelRequested,
                    chrono::Utc::now(),
                )
                .is_none()
                {
                    continue;
                }
                let Some(order_id) = order.order_id.clone() else {
                    continue;
                };
                let result =
                    retry_with_backoff(max_retries, retry_delay_s, Some(&limiter), || exchange.cancel(&order_id))
                        .await;
                let now = chrono::Utc::now();
                match result {
                    Ok(()) => {
                        apply_and_publish(&orders, &bus, client_order_id, OrderEvent::CancelAcked, now);
                        bus.publish_cancel_ack(BusCancelAck { client_order_id });
                    }
                    Err(err) => {
                        apply_and_publish(&orders, &bus, client_order_id, OrderEvent::CancelRejected, now);
                        bus.publish_cancel_reject(BusCancelReject {
                            client_order_id,
                            reason: err.message,
                        });
                    }
                }
            }
            Decision::Amend { .. } => unreachable!("amends are routed to the amend pool"),
        }
    }
}

async fn run_amend_worker(
    worker_id: usize,
    max_retries: u32,
    retry_delay_s: f64,
    rx: Arc<AsyncMutex<mpsc::Receiver<Decision>>>,
    limiter: Arc<RateLimiter>,
    exchange: Arc<dyn ExchangeAdapter>,
    orders: Arc<OrderManager>,
    bus: Arc<Bus>,
) {
    loop {
        let decision = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(decision) = decision else { return };

        let Decision::Amend {
            client_order_id,
            new_price,
            new_quantity,
        } = decision
        else {
            continue;
        };

        if !orders.try_begin_modification() {
            bus.publish_amend_reject(BusAmendReject {
                client_order_id,
                reason: "max_pending_modifications reached".to_string(),
            });
            continue;
        }

        let Some(order) = orders.get(client_order_id) else {
            orders.end_modification();
            continue;
        };
        let Some(order_id) = order.order_id.clone() else {
            orders.end_modification();
            continue;
        };

        // Reserves the modification concurrency slot only; the per-order
        // "already pending" guard comes from the order manager's
        // transition table rejecting a second AmendRequested.
        if apply_and_publish(
            &orders,
            &bus,
            client_order_id,
            OrderEvent::AmendRequested,
            chrono::Utc::now(),
        )
        .is_none()
        {
            orders.end_modification();
            bus.publish_amend_reject(BusAmendReject {
                client_order_id,
                reason: "order already has an outstanding amend or cancel".to_string(),
            });
            continue;
        }

        limiter.acquire().await;
        let result = retry_with_backoff(max_retries, retry_delay_s, Some(&limiter), || {
            exchange.amend(&order_id, new_price, new_quantity)
        })
        .await;
        let now = chrono::Utc::now();
        match result {
            Ok(ack) => {
                apply_and_publish(
                    &orders,
                    &bus,
                    client_order_id,
                    OrderEvent::AmendAcked {
                        price: ack.price,
                        quantity: ack.quantity,
                    },
                    now,
                );
                info!(worker_id, %client_order_id, "amend acked");
                bus.publish_amend_ack(BusAmendAck {
                    client_order_id,
                    price: ack.price,
                    quantity: ack.quantity,
                });
            }
            Err(err) => {
                apply_and_publish(&orders, &bus, client_order_id, OrderEvent::AmendRejected, now);
                bus.publish_amend_reject(BusAmendReject {
                    client_order_id,
                    reason: err.message,
                });
            }
        }
        orders.end_modification();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::fake::FakeExchange;
    use crate::types::{Price, Qty, Side};

    fn cfg() -> ExecutionConfig {
        ExecutionConfig {
            worker_count: 1,
            batch_size: 4,
            rate_limit: 100,
            max_retries: 3,
            retry_delay_s: 0.001,
            modify_worker_count: 1,
            modify_rate_limit: 100,
        }
    }

    #[tokio::test]
    async fn place_acks_and_reaches_active_status() {
        let bus = Arc::new(Bus::new());
        let orders = Arc::new(OrderManager::new(16, 8));
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange::new());

        let mut order_acks = bus.subscribe_order_ack();
        let engine = tokio::spawn(run_execution_engine(cfg(), exchange, Arc::clone(&orders), Arc::clone(&bus)));

        bus.publish_decision_approved(Decision::Place {
            side: Side::Buy,
            price: Price::from_f64(30_000.0),
            quantity: Qty::from_f64(1.0),
        });

        let ack = tokio::time::timeout(Duration::from_secs(1), order_acks.recv())
            .await
            .expect("ack should arrive")
            .unwrap();
        let order = orders.get(ack.client_order_id).unwrap();
        assert_eq!(order.status, crate::order_manager::OrderStatus::Active);
        engine.abort();
    }

    #[tokio::test]
    async fn transient_place_failure_retries_then_succeeds() {
        let bus = Arc::new(Bus::new());
        let orders = Arc::new(OrderManager::new(16, 8));
        let fake = Arc::new(FakeExchange::new());
        fake.push_place_response(Err(ExchangeError::transient("network blip")));
        fake.push_place_response(Err(ExchangeError::transient("network blip")));
        let exchange: Arc<dyn ExchangeAdapter> = fake;

        let mut order_acks = bus.subscribe_order_ack();
        let engine = tokio::spawn(run_execution_engine(cfg(), exchange, Arc::clone(&orders), Arc::clone(&bus)));

        bus.publish_decision_approved(Decision::Place {
            side: Side::Buy,
            price: Price::from_f64(30_000.0),
            quantity: Qty::from_f64(1.0),
        });

        let ack = tokio::time::timeout(Duration::from_secs(2), order_acks.recv())
            .await
            .expect("ack should eventually arrive")
            .unwrap();
        let order = orders.get(ack.client_order_id).unwrap();
        assert_eq!(order.status, crate::order_manager::OrderStatus::Active);
        engine.abort();
    }

    #[tokio::test]
    async fn permanent_place_failure_rejects_without_retry() {
        let bus = Arc::new(Bus::new());
        let orders = Arc::new(OrderManager::new(16, 8));
        let fake = Arc::new(FakeExchange::new());
        fake.push_place_response(Err(ExchangeError::permanent("insufficient balance")));
        let exchange: Arc<dyn ExchangeAdapter> = fake;

        let mut order_rejects = bus.subscribe_order_reject();
        let engine = tokio::spawn(run_execution_engine(cfg(), exchange, Arc::clone(&orders), Arc::clone(&bus)));

        bus.publish_decision_approved(Decision::Place {
            side: Side::Sell,
            price: Price::from_f64(30_090.0),
            quantity: Qty::from_f64(1.0),
        });

        let reject = tokio::time::timeout(Duration::from_secs(1), order_rejects.recv())
            .await
            .expect("reject should arrive")
            .unwrap();
        assert!(!reject.transient);
        let order = orders.get(reject.client_order_id).unwrap();
        assert_eq!(order.status, crate::order_manager::OrderStatus::Rejected);
        engine.abort();
    }

    #[tokio::test]
    async fn rate_limit_refusal_throttles_pool_and_requeues_once() {
        let bus = Arc::new(Bus::new());
        let orders = Arc::new(OrderManager::new(16, 8));
        let fake = Arc::new(FakeExchange::new());
        fake.push_place_response(Err(ExchangeError::rate_limited("too many requests")));
        let exchange: Arc<dyn ExchangeAdapter> = fake;

        let mut order_acks = bus.subscribe_order_ack();
        let engine = tokio::spawn(run_execution_engine(cfg(), exchange, Arc::clone(&orders), Arc::clone(&bus)));

        bus.publish_decision_approved(Decision::Place {
            side: Side::Buy,
            price: Price::from_f64(30_000.0),
            quantity: Qty::from_f64(1.0),
        });

        // the single scripted rate-limit refusal is consumed by the requeue,
        // so the order still reaches Active without exhausting max_retries.
        let ack = tokio::time::timeout(Duration::from_secs(2), order_acks.recv())
            .await
            .expect("order should ack after the requeued attempt")
            .unwrap();
        let order = orders.get(ack.client_order_id).unwrap();
        assert_eq!(order.status, crate::order_manager::OrderStatus::Active);
        engine.abort();
    }

    // P8: retry delays between attempts k and k+1 satisfy
    // retry_delay * 2^k <= actual_delay (with a small scheduling tolerance,
    // since this implementation adds no jitter of its own).
    mod property {
        use super::*;
        use proptest::prelude::*;
        use std::sync::Mutex as StdMutex;
        use std::time::Instant;

        /// Drives `retry_with_backoff` to exhaustion-then-success on a
        /// throwaway runtime and returns the wall-clock gap between each
        /// attempt, so the proptest body can assert on plain `Vec<f64>`
        /// outside any async context.
        fn measure_attempt_gaps(failures: usize, retry_delay_s: f64) -> Vec<f64> {
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap()
                .block_on(async move {
                    let attempts: StdMutex<Vec<Instant>> = StdMutex::new(Vec::new());
                    let remaining = StdMutex::new(failures);

                    let _: Result<(), ExchangeError> = retry_with_backoff(10, retry_delay_s, None, || {
                        attempts.lock().unwrap().push(Instant::now());
                        let mut left = remaining.lock().unwrap();
                        if *left > 0 {
                            *left -= 1;
                            std::future::ready(Err(ExchangeError::transient("retry me")))
                        } else {
                            std::future::ready(Ok(()))
                        }
                    })
                    .await;

                    let marks = attempts.lock().unwrap();
                    marks
                        .windows(2)
                        .map(|w| w[1].duration_since(w[0]).as_secs_f64())
                        .collect()
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(8))]
            #[test]
            fn retry_delays_grow_exponentially(failures in 1usize..4, retry_delay_ms in 2u64..10) {
                let retry_delay_s = retry_delay_ms as f64 / 1000.0;
                let gaps = measure_attempt_gaps(failures, retry_delay_s);
                for (k, actual) in gaps.iter().enumerate() {
                    let expected = retry_delay_s * 2f64.powi(k as i32);
                    // scheduling jitter on a loaded box, never an early fire.
                    prop_assert!(
                        *actual >= expected * 0.8,
                        "attempt {} fired after {}s, expected >= {}s",
                        k, actual, expected
                    );
                }
            }
        }
    }
}
