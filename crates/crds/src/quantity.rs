//! Kubernetes resource quantity parsing
//!
//! Memory and disk sizes in the ScvmmMachine spec use the Kubernetes
//! quantity notation ("4Gi", "512Mi", "20G", "1.5Gi"). The controller only
//! ever needs the integral byte value, rounded up like `Quantity.Value()`.

use thiserror::Error;

/// One mebibyte, the unit the remote functions take sizes in
pub const MEBIBYTE: i64 = 1024 * 1024;

/// Quantity parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity '{0}'")]
    InvalidNumber(String),

    #[error("unknown suffix '{suffix}' in quantity '{quantity}'")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity '{0}' is out of range")]
    Overflow(String),
}

/// Multiplier of a suffix as a fraction (numerator, denominator)
fn suffix_multiplier(suffix: &str) -> Option<(i128, i128)> {
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => {
            // Decimal exponent form: "1e3", "5E6"
            let exp = suffix.strip_prefix(['e', 'E'])?;
            let exp: u32 = exp.parse().ok()?;
            if exp > 18 {
                return None;
            }
            (10_i128.pow(exp), 1)
        }
    };
    Some(m)
}

/// Parse a quantity into an integral value, rounding fractions up
pub fn parse_quantity(quantity: &str) -> Result<i64, QuantityError> {
    let trimmed = quantity.trim();
    if trimmed.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(QuantityError::InvalidNumber(quantity.to_string()));
    }

    let (mult_num, mult_den) =
        suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
            quantity: quantity.to_string(),
            suffix: suffix.to_string(),
        })?;

    let overflow = || QuantityError::Overflow(quantity.to_string());

    let digits = format!("{int_part}{frac_part}");
    let mantissa: i128 = digits
        .parse()
        .map_err(|_| QuantityError::InvalidNumber(quantity.to_string()))?;
    let frac_len = u32::try_from(frac_part.len()).map_err(|_| overflow())?;
    let scale = 10_i128.checked_pow(frac_len).ok_or_else(overflow)?;

    let numerator = mantissa.checked_mul(mult_num).ok_or_else(overflow)?;
    let denominator = scale.checked_mul(mult_den).ok_or_else(overflow)?;
    // Round up (away from zero) like Quantity.Value()
    let value = numerator
        .checked_add(denominator - 1)
        .ok_or_else(overflow)?
        / denominator;
    let value = if negative { -value } else { value };

    i64::try_from(value).map_err(|_| overflow())
}

/// Parse an optional quantity; absent or empty values count as zero
pub fn optional_quantity(quantity: Option<&str>) -> Result<i64, QuantityError> {
    match quantity.filter(|q| !q.trim().is_empty()) {
        Some(q) => parse_quantity(q),
        None => Ok(0),
    }
}
