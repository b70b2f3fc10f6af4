//! KRX price tick table.
//!
//! Every quote and limit price on the exchange is a multiple of the tick
//! for its price band. Exit orders are priced two ticks under the best ask
//! so they cross the book without chasing it.

use crate::decimal::Price;
use rust_decimal::Decimal;

/// Tick increment for the band containing `price`.
///
/// | band            | tick  |
/// |-----------------|-------|
/// | < 1,000         | 1     |
/// | < 5,000         | 5     |
/// | < 10,000        | 10    |
/// | < 50,000        | 50    |
/// | < 100,000       | 100   |
/// | otherwise       | 1,000 |
#[must_use]
pub fn tick_size(price: Price) -> Price {
    let p = price.inner();
    let tick: u64 = if p < Decimal::from(1_000) {
        1
    } else if p < Decimal::from(5_000) {
        5
    } else if p < Decimal::from(10_000) {
        10
    } else if p < Decimal::from(50_000) {
        50
    } else if p < Decimal::from(100_000) {
        100
    } else {
        1_000
    };
    Price::from_krw(tick)
}

/// Exit limit price for a given best ask: two ticks below the ask, floored
/// at one tick so the order price is always positive.
#[must_use]
pub fn safe_price(ask: Price) -> Price {
    let tick = tick_size(ask);
    let candidate = ask - tick - tick;
    if candidate < tick {
        tick
    } else {
        candidate
    }
}
