//! Reference-price estimator (spec §4.1): consumes trades and book updates,
//! maintains a bounded ring of recent samples, and emits a [`PriceUpdate`]
//! once the estimate has moved by at least `change_threshold` since the
//! last emission.
//!
//! The ring + EMA-smoothing shape is grounded in the teacher's
//! `state/flow.rs::Ema`/`FlowState` (a `VecDeque`-backed smoothing helper
//! updated from market events), generalized here from a microstructure
//! "pressure" signal into the literal reference-price estimate spec §4.1
//! asks for.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::PriceConfig;
use crate::event_bus::{Bus, BookUpdate, MarketTrade, PriceUpdate};
use crate::types::Price;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceMethod {
    Twap,
    Vwap,
    Ema,
    Hybrid,
}

impl Default for PriceMethod {
    fn default() -> Self {
        PriceMethod::Twap
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    price: Price,
    quantity: f64,
    timestamp: DateTime<Utc>,
}

/// Owns the sliding window and the running estimate for one symbol.
pub struct PriceEstimator {
    cfg: PriceConfig,
    window: VecDeque<Sample>,
    ema_value: Option<f64>,
    current_estimate: Option<Price>,
    last_emitted: Option<Price>,
}

impl PriceEstimator {
    pub fn new(cfg: PriceConfig) -> Self {
        Self {
            cfg,
            window: VecDeque::with_capacity(cfg.window_size.max(2)),
            ema_value: None,
            current_estimate: None,
            last_emitted: None,
        }
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.window.back().map(|s| s.timestamp)
    }

    /// Reject samples that are out of order or that deviate too far from
    /// the current estimate (spec §4.1 "Outlier rejection" and "Edge
    /// cases"). Returns `true` if the sample was accepted into the window.
    fn accept(&mut self, price: Price, quantity: f64, timestamp: DateTime<Utc>) -> bool {
        if let Some(last_ts) = self.last_timestamp() {
            if timestamp < last_ts {
                tracing::debug!(?timestamp, ?last_ts, "dropping out-of-order price sample");
                return false;
            }
        }

        if let Some(estimate) = self.current_estimate {
            if price.frac_deviation(estimate) > self.cfg.anomaly_threshold {
                tracing::debug!(
                    price = %price,
                    estimate = %estimate,
                    "dropping anomalous price sample"
                );
                return false;
            }
        }

        if self.window.len() == self.cfg.window_size.max(2) {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            price,
            quantity,
            timestamp,
        });
        true
    }

    fn twap(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let sum: f64 = self.window.iter().map(|s| s.price.as_f64()).sum();
        Some(sum / self.window.len() as f64)
    }

    fn vwap(&self) -> Option<f64> {
        let total_qty: f64 = self.window.iter().map(|s| s.quantity).sum();
        if total_qty <= 0.0 {
            return None;
        }
        let weighted: f64 = self
            .window
            .iter()
            .map(|s| s.price.as_f64() * s.quantity)
            .sum();
        Some(weighted / total_qty)
    }

    fn compute_estimate(&mut self, incoming: Price) -> Option<f64> {
        match self.cfg.method {
            PriceMethod::Twap => self.twap(),
            PriceMethod::Vwap => self.vwap(),
            PriceMethod::Ema => {
                let alpha = self.cfg.smoothing_factor;
                let next = match self.ema_value {
                    Some(prev) => alpha * incoming.as_f64() + (1.0 - alpha) * prev,
                    None => incoming.as_f64(),
                };
                self.ema_value = Some(next);
                Some(next)
            }
            PriceMethod::Hybrid => match (self.twap(), self.vwap()) {
                (Some(t), Some(v)) => Some(0.6 * t + 0.4 * v),
                _ => None,
            },
        }
    }

    /// Process one accepted trade and return a [`PriceUpdate`] if one
    /// should be emitted.
    fn on_trade(&mut self, price: Price, quantity: f64, timestamp: DateTime<Utc>) -> Option<PriceUpdate> {
        if !self.accept(price, quantity, timestamp) {
            return None;
        }

        // EMA can run before the window holds two samples (it has no
        // "window" precondition); every other method needs >= 2 samples
        // before it is allowed to publish (spec §4.1 edge case).
        if self.cfg.method != PriceMethod::Ema && self.window.len() < 2 {
            return None;
        }

        let value = self.compute_estimate(price)?;
        let estimate = Price::from_f64(value);
        self.current_estimate = Some(estimate);

        let should_emit = match self.last_emitted {
            None => true,
            // EMA emits on every accepted sample, per P5.
            Some(_) if self.cfg.method == PriceMethod::Ema => true,
            Some(last) => estimate.frac_deviation(last) >= self.cfg.change_threshold,
        };

        if !should_emit {
            return None;
        }

        self.last_emitted = Some(estimate);
        Some(PriceUpdate {
            value: estimate,
            timestamp,
        })
    }

    /// Book updates feed the mid-price into the same window as a
    /// zero-weight (for VWAP) sample — they move TWAP/EMA but do not
    /// distort VWAP's trade-volume weighting.
    fn on_book(&mut self, best_bid: Price, best_ask: Price, timestamp: DateTime<Utc>) -> Option<PriceUpdate> {
        let mid = Price::from_f64((best_bid.as_f64() + best_ask.as_f64()) / 2.0);
        self.on_trade(mid, 0.0, timestamp)
    }
}

/// Drains the bus's market-data channels and publishes `PriceUpdate`s.
/// Runs as its own task (spec §5): one logical unit, no suspension points
/// beyond the channel `recv`.
pub async fn run_price_estimator(cfg: PriceConfig, bus: std::sync::Arc<Bus>) -> anyhow::Result<()> {
    let mut trades = bus
        .take_market_trade_receiver()
        .expect("market trade receiver already taken");
    let mut books = bus
        .take_book_update_receiver()
        .expect("book update receiver already taken");

    let mut estimator = PriceEstimator::new(cfg);

    loop {
        tokio::select! {
            trade = trades.recv() => {
                let Some(trade) = trade else { break; };
                if let Some(update) = estimator.on_trade(trade.price, trade.quantity.as_f64(), trade.timestamp) {
                    bus.publish_price_update(update);
                }
            }
            book = books.recv() => {
                let Some(book) = book else { break; };
                if let Some(update) = estimator.on_book(book.best_bid, book.best_ask, book.timestamp) {
                    bus.publish_price_update(update);
                }
            }
        }
    }

    Ok(())
}

#[allow(dead_code)]
fn _assert_market_trade_shape(_: &MarketTrade, _: &BookUpdate) {}
