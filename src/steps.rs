// =============================================================================
// Decimal step arithmetic — lot/tick rounding and the three-leg split
// =============================================================================
//
// Every price is a multiple of the instrument's tick size and every quantity
// a multiple of its lot step. All rounding happens here, in exact decimal
// arithmetic, so the rest of the engine never touches a raw float.
//
// The three-leg split divides in integer step-units and converts back, which
// makes `qty1 + qty2 + qty3 == qty_total` hold by construction.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Largest multiple of `step` that is <= `x`.
///
/// # Panics
/// On `step <= 0` or negative `x` — both are programmer errors.
pub fn floor_to_step(x: Decimal, step: Decimal) -> Decimal {
    check_inputs(x, step);
    (x / step).floor() * step
}

/// Smallest multiple of `step` that is >= `x`.
pub fn ceil_to_step(x: Decimal, step: Decimal) -> Decimal {
    check_inputs(x, step);
    (x / step).ceil() * step
}

/// Multiple of `step` nearest to `x` (ties round up).
pub fn round_nearest_step(x: Decimal, step: Decimal) -> Decimal {
    check_inputs(x, step);
    ((x / step) + Decimal::new(5, 1)).floor() * step
}

/// Round directionally for an entry price: longs round up (so the limit is
/// marketable), shorts round down.
pub fn round_directional(x: Decimal, step: Decimal, is_long: bool) -> Decimal {
    if is_long {
        ceil_to_step(x, step)
    } else {
        floor_to_step(x, step)
    }
}

/// Format a step-aligned value as the minimal-precision string the exchange
/// accepts. This is the exact text sent on the wire; borrow sizing must use
/// it, not the pre-format value.
pub fn fmt_step(x: Decimal) -> String {
    x.normalize().to_string()
}

/// Number of whole step-units in `qty`.
fn units(qty: Decimal, step: Decimal) -> u64 {
    (qty / step)
        .floor()
        .to_u64()
        .expect("step-unit count out of range")
}

/// Result of splitting a total quantity into three exit legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegSplit {
    pub qty1: Decimal,
    pub qty2: Decimal,
    pub qty3: Decimal,
    /// True when the total was too small for three viable legs and the
    /// split degraded to 50/50/0.
    pub degraded: bool,
}

/// Split `qty_total` into three legs of 33/33/34 step-units.
///
/// When the standard split would leave any leg below `min_qty`, degrade to
/// 50/50/0 (two legs, no trailing remainder). Deterministic given the
/// inputs; the legs always sum to the step-floored total.
///
/// # Panics
/// On `step <= 0` or negative `qty_total`.
pub fn split_three_legs(qty_total: Decimal, step: Decimal, min_qty: Decimal) -> LegSplit {
    check_inputs(qty_total, step);
    let total_units = units(qty_total, step);

    let u1 = total_units * 33 / 100;
    let u2 = total_units * 33 / 100;
    let u3 = total_units - u1 - u2;
    let min_units = units(min_qty, step);

    let viable = u1 >= min_units && u2 >= min_units && u3 >= min_units && u1 > 0 && u3 > 0;
    let (u1, u2, u3, degraded) = if viable {
        (u1, u2, u3, false)
    } else {
        // Two-leg fallback: the remainder goes to leg 2 so leg 3 is empty.
        let h1 = total_units / 2;
        let h2 = total_units - h1;
        (h1, h2, 0, true)
    };

    LegSplit {
        qty1: Decimal::from(u1) * step,
        qty2: Decimal::from(u2) * step,
        qty3: Decimal::from(u3) * step,
        degraded,
    }
}

fn check_inputs(x: Decimal, step: Decimal) {
    assert!(step > Decimal::ZERO, "step must be positive, got {step}");
    assert!(x >= Decimal::ZERO, "quantity/price must be non-negative, got {x}");
}

// =============================================================================
// Tests
// =============================================================================
