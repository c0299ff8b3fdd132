use crate::error::PairTradeError;
use rust_decimal::Decimal;

/// Decimal places used when instrument metadata cannot be fetched. Orders
/// rejected for precision surface at execution time.
pub const FALLBACK_QUANTITY_PRECISION: u32 = 8;

const MAX_DECIMAL_SCALE: u32 = 28;

/// Sizes both legs of a pair. Each leg receives the full `notional`, so the
/// pair carries roughly twice `notional` in gross exposure.
pub fn compute_leg_quantities(
    notional: Decimal,
    price_a: Decimal,
    price_b: Decimal,
    precision_a: u32,
    precision_b: u32,
) -> Result<(Decimal, Decimal), PairTradeError> {
    if notional <= Decimal::ZERO {
        return Err(PairTradeError::InvalidNotional(notional));
    }
    let qty_a = leg_quantity(notional, price_a, precision_a, "leg_a")?;
    let qty_b = leg_quantity(notional, price_b, precision_b, "leg_b")?;
    Ok((qty_a, qty_b))
}

fn leg_quantity(
    notional: Decimal,
    price: Decimal,
    precision: u32,
    leg: &str,
) -> Result<Decimal, PairTradeError> {
    if price <= Decimal::ZERO {
        return Err(PairTradeError::InvalidPrice {
            leg: leg.to_string(),
            price,
        });
    }
    let precision = precision.min(MAX_DECIMAL_SCALE);
    let raw = notional
        .checked_div(price)
        .ok_or_else(|| PairTradeError::InvalidPrice {
            leg: leg.to_string(),
            price,
        })?;
    // round_dp is half-to-even
    let mut qty = raw.round_dp(precision);
    qty.rescale(precision);
    Ok(qty)
}

/// Decimal places implied by a quantity step, e.g. `0.001` -> 3.
pub fn precision_from_step(step: Decimal) -> u32 {
    if step <= Decimal::ZERO {
        return FALLBACK_QUANTITY_PRECISION;
    }
    step.normalize().scale()
}

pub fn dollar_value(quantity: Decimal, price: Decimal) -> Decimal {
    quantity * price
}
