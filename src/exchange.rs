//! The exchange boundary (spec §6 "Exchange adapter contract"): a thin
//! async trait the execution engine calls through, plus market-data
//! streams. Grounded in the teacher's `exec/http.rs` (thin wrapper over a
//! client placing/cancelling orders) and `ws/task.rs` (streaming
//! snapshot/delta/trade/fill feed), generalized from a Kalshi-specific
//! client into a trait so the execution engine and strategy tests can run
//! against an in-memory double instead of a real venue.

use async_trait::async_trait;

use crate::event_bus::{BookUpdate, MarketTrade};
use crate::types::{Price, Qty, Side};

/// Whether a failed exchange call should be retried (spec §7 "Transient
/// I/O" vs. "Permanent operation failure"), and whether it is specifically
/// a rate-limit refusal, which gets its own half-rate-throttle-and-requeue
/// handling rather than the plain exponential backoff every other
/// transient failure gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeError {
    pub message: String,
    pub transient: bool,
    pub rate_limited: bool,
}

impl ExchangeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            rate_limited: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            rate_limited: false,
        }
    }

    /// A rate-limit refusal from the exchange. Still transient (the
    /// operation is worth retrying) but carries the extra flag the
    /// execution workers key the throttle-and-requeue-once behavior off.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            rate_limited: true,
        }
    }
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExchangeError {}

#[derive(Debug, Clone)]
pub struct PlaceAck {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct AmendAck {
    pub price: Price,
    pub quantity: Qty,
}

/// The call surface the execution engine drives. One method per decision
/// kind, each returning the ack payload or an [`ExchangeError`] the caller
/// classifies into retry-or-surface.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn place(&self, side: Side, price: Price, quantity: Qty) -> Result<PlaceAck, ExchangeError>;
    async fn amend(&self, order_id: &str, new_price: Price, new_quantity: Qty)
        -> Result<AmendAck, ExchangeError>;
    async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError>;
}

/// Lazy unbounded market-data streams (spec §6), consumed once at startup
/// by whichever task feeds the event bus's market-data channels.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn next_trade(&self) -> Option<MarketTrade>;
    async fn next_book_update(&self) -> Option<BookUpdate>;
}

/// Test double, kept un-gated (rather than behind a dev/test-only cfg) so
/// both unit tests in this crate and the `tests/` integration suite can
/// construct it against the same `ExchangeAdapter` trait.
pub mod fake {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// An in-memory exchange double for integration tests (scenarios
    /// S1-S6). Every call succeeds immediately unless a scripted response
    /// has been queued with [`FakeExchange::push_place_response`] etc.
    pub struct FakeExchange {
        next_order_id: AtomicU64,
        place_script: Mutex<Vec<Result<(), ExchangeError>>>,
        amend_script: Mutex<Vec<Result<(), ExchangeError>>>,
        cancel_script: Mutex<Vec<Result<(), ExchangeError>>>,
        pub calls: Mutex<Vec<String>>,
        trades: tokio::sync::Mutex<std::collections::VecDeque<MarketTrade>>,
        books: tokio::sync::Mutex<std::collections::VecDeque<BookUpdate>>,
    }

    impl Default for FakeExchange {
        fn default() -> Self {
            Self {
                next_order_id: AtomicU64::new(1),
                place_script: Mutex::new(Vec::new()),
                amend_script: Mutex::new(Vec::new()),
                cancel_script: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                trades: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
                books: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            }
        }
    }

    impl FakeExchange {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a scripted outcome for the next N `place` calls, consumed
        /// FIFO; once the script is drained, calls succeed unconditionally.
        pub fn push_place_response(&self, outcome: Result<(), ExchangeError>) {
            self.place_script.lock().unwrap().push(outcome);
        }

        pub fn push_amend_response(&self, outcome: Result<(), ExchangeError>) {
            self.amend_script.lock().unwrap().push(outcome);
        }

        pub fn push_cancel_response(&self, outcome: Result<(), ExchangeError>) {
            self.cancel_script.lock().unwrap().push(outcome);
        }

        fn next_scripted(script: &Mutex<Vec<Result<(), ExchangeError>>>) -> Result<(), ExchangeError> {
            let mut guard = script.lock().unwrap();
            if guard.is_empty() {
                Ok(())
            } else {
                guard.remove(0)
            }
        }

        /// Queue a market trade for `next_trade` to yield, for tests that
        /// drive the price estimator through a `FakeExchange`-backed feed.
        pub async fn push_trade(&self, trade: MarketTrade) {
            self.trades.lock().await.push_back(trade);
        }

        pub async fn push_book_update(&self, update: BookUpdate) {
            self.books.lock().await.push_back(update);
        }
    }

    #[async_trait]
    impl ExchangeAdapter for FakeExchange {
        async fn place(&self, side: Side, price: Price, quantity: Qty) -> Result<PlaceAck, ExchangeError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("place({side},{price},{quantity})"));
            Self::next_scripted(&self.place_script)?;
            let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
            Ok(PlaceAck {
                order_id: format!("fake-{id}"),
            })
        }

        async fn amend(
            &self,
            order_id: &str,
            new_price: Price,
            new_quantity: Qty,
        ) -> Result<AmendAck, ExchangeError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("amend({order_id},{new_price},{new_quantity})"));
            Self::next_scripted(&self.amend_script)?;
            Ok(AmendAck {
                price: new_price,
                quantity: new_quantity,
            })
        }

        async fn cancel(&self, order_id: &str) -> Result<(), ExchangeError> {
            self.calls.lock().unwrap().push(format!("cancel({order_id})"));
            Self::next_scripted(&self.cancel_script)
        }
    }

    /// Polls the queued trade/book deques. Returns `None` only once the
    /// exchange has been explicitly closed via `close()`; an empty queue
    /// just waits, matching a live stream's "nothing new yet" behavior.
    #[async_trait]
    impl MarketDataSource for FakeExchange {
        async fn next_trade(&self) -> Option<MarketTrade> {
            loop {
                if let Some(t) = self.trades.lock().await.pop_front() {
                    return Some(t);
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        async fn next_book_update(&self) -> Option<BookUpdate> {
            loop {
                if let Some(b) = self.books.lock().await.pop_front() {
                    return Some(b);
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}
