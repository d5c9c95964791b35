//! Decimal arithmetic utilities for order sizing and price alignment.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round a price down to an integer multiple of the symbol's tick size.
pub fn floor_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Round a quantity down to an integer multiple of the symbol's lot step.
pub fn floor_to_step(value: Decimal, step_size: Decimal) -> Decimal {
    if step_size <= Decimal::ZERO {
        return value;
    }
    (value / step_size).floor() * step_size
}

/// Apply a signed percentage to a base value: `base * (1 + pct/100)`.
pub fn apply_percent(base: Decimal, pct: Decimal) -> Decimal {
    base * (Decimal::ONE + pct / dec!(100))
}

/// Absolute percentage distance between two values, relative to `reference`.
pub fn percent_distance(value: Decimal, reference: Decimal) -> Decimal {
    if reference == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((value - reference) / reference).abs() * dec!(100)
}

/// Safe division that returns zero when the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}
