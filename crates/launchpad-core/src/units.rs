//! Exact conversion between human decimal amounts and integer base units.
//!
//! Amounts are handled as decimal strings and scaled by string manipulation
//! before a single integer parse, so `"1000000.5"` at 6 decimals is exactly
//! `1000000500000` and no value ever passes through a float.

use std::fmt::Display;

use alloy_primitives::U256;

use crate::error::LaunchpadError;

/// Largest decimals value accepted for tokens and settlement assets.
pub const MAX_DECIMALS: u8 = 18;

/// Parse a human decimal amount into base units (`amount × 10^decimals`).
///
/// Rejects signs, exponents, and fractional digits that cannot be represented
/// at `decimals` precision. Trailing fractional zeros beyond `decimals` are
/// accepted since they do not change the value.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256, LaunchpadError> {
    let raw = amount.trim();
    let invalid = |why: &str| LaunchpadError::Config(format!("invalid amount {raw:?}: {why}"));

    if raw.is_empty() {
        return Err(invalid("empty"));
    }
    if raw.starts_with('-') {
        return Err(invalid("negative amounts are not allowed"));
    }
    let (int_part, frac_part) = match raw.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (raw, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("expected a plain decimal number"));
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("expected a plain decimal number"));
    }

    let significant = frac_part.trim_end_matches('0');
    if significant.len() > decimals as usize {
        return Err(invalid(&format!(
            "more than {decimals} fractional digits"
        )));
    }

    let mut digits = String::with_capacity(int_part.len() + decimals as usize);
    digits.push_str(int_part);
    digits.push_str(significant);
    for _ in significant.len()..decimals as usize {
        digits.push('0');
    }

    U256::from_str_radix(&digits, 10).map_err(|_| invalid("exceeds uint256"))
}

/// Render an integer amount in base units as an exact human decimal string.
///
/// Trailing fractional zeros are dropped: `400000000` at 6 decimals is `"400"`.
pub fn format_units(value: impl Display, decimals: u8) -> String {
    let digits = value.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }
    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals + 1 - digits.len()), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac_part}")
    }
}

/// Lossy floating point rendering for display fields only.
pub fn display_amount(value: impl Display, decimals: u8) -> f64 {
    format_units(value, decimals).parse().unwrap_or_default()
}
