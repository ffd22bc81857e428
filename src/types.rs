//! Core value types shared across the engine: sides, fixed-point price/qty,
//! and the tagged `Decision` variant the strategy engine emits.

use std::fmt;

/// Fixed-point scale for [`Price`]: one unit = 1e-8 of quote currency.
pub const PRICE_SCALE: i64 = 100_000_000;
/// Fixed-point scale for [`Qty`]: one unit = 1e-8 of base currency.
pub const QTY_SCALE: i64 = 100_000_000;

/// A tick-aligned fixed-point price, stored as an integer multiple of
/// `1 / PRICE_SCALE`. An integer (rather than `f64`) keeps tick comparisons
/// exact, generalizing the teacher's cent-cents convention (`CC_PER_CENT`)
/// from a $0-$1 price range to an arbitrary spot price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Price(pub i64);

impl Price {
    pub const ZERO: Price = Price(0);

    pub fn from_f64(v: f64) -> Self {
        Price((v * PRICE_SCALE as f64).round() as i64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / PRICE_SCALE as f64
    }

    /// Round to the nearest multiple of `tick`, rounding half away from zero.
    pub fn round_to_tick(self, tick: Price) -> Price {
        if tick.0 <= 0 {
            return self;
        }
        let n = (self.0 as f64 / tick.0 as f64).round() as i64;
        Price(n * tick.0)
    }

    /// Fractional deviation of `self` from `reference`, i.e. `|self - reference| / reference`.
    pub fn frac_deviation(self, reference: Price) -> f64 {
        if reference.0 == 0 {
            return 0.0;
        }
        ((self.0 - reference.0).abs() as f64) / (reference.0 as f64)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.as_f64())
    }
}

/// A fixed-point quantity, stored as an integer multiple of `1 / QTY_SCALE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Qty(pub i64);

impl Qty {
    pub const ZERO: Qty = Qty(0);

    pub fn from_f64(v: f64) -> Self {
        Qty((v * QTY_SCALE as f64).round() as i64)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / QTY_SCALE as f64
    }

    pub fn saturating_add(self, other: Qty) -> Qty {
        Qty(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Qty) -> Qty {
        Qty(self.0.saturating_sub(other.0).max(0))
    }

    /// Notional value `price * qty` as an f64 in quote-currency units.
    pub fn notional(self, price: Price) -> f64 {
        self.as_f64() * price.as_f64()
    }
}

impl fmt::Display for Qty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.8}", self.as_f64())
    }
}

/// Order-book side. `Buy` rests below the reference price, `Sell` rests above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// +1 for Sell (above reference), -1 for Buy (below reference). Used to
    /// derive each side's band offset from a single magnitude.
    pub fn band_sign(self) -> f64 {
        match self {
            Side::Sell => 1.0,
            Side::Buy => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The tagged decision variant the strategy engine emits. Deliberately a
/// sum type (not a trait-object hierarchy) so dispatch in the execution
/// engine and risk gate happens by `match`, not by dynamic method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Place {
        side: Side,
        price: Price,
        quantity: Qty,
    },
    Amend {
        client_order_id: uuid::Uuid,
        new_price: Price,
        new_quantity: Qty,
    },
    Cancel {
        client_order_id: uuid::Uuid,
    },
}

impl Decision {
    pub fn client_order_id(&self) -> Option<uuid::Uuid> {
        match self {
            Decision::Place { .. } => None,
            Decision::Amend {
                client_order_id, ..
            } => Some(*client_order_id),
            Decision::Cancel { client_order_id } => Some(*client_order_id),
        }
    }
}
