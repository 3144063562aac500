//! Parse byte quantities like `10Gi`, `1.5G`, or `512e6`.
//!
//! The syntax follows the quantities used in cluster resource requests:
//! a decimal number followed by an optional binary (`Ki`, `Mi`, ...),
//! decimal (`n`, `u`, `m`, `k`, `M`, ...), or exponent (`e3`) suffix.
//! Quantities below one byte, like `1500m`, round up to whole bytes.

use crate::ImportError;

const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: &[(&str, i64)] = &[
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse `quantity` as a number of bytes.
///
/// Fractional results are rounded up. All arithmetic is done with integers.
pub fn parse_quantity(quantity: &str) -> Result<u64, ImportError> {
    let err = |msg| ImportError::SizeParse(quantity.to_owned(), msg);

    let s = quantity.trim();
    let s = s.strip_prefix('+').unwrap_or(s);

    let number_len = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());

    let (number, suffix) = s.split_at(number_len);

    let (integer, fraction) = number.split_once('.').unwrap_or((number, ""));
    if integer.is_empty() && fraction.is_empty() {
        return Err(err("missing number"));
    }

    if fraction.contains('.') {
        return Err(err("invalid number"));
    }

    // Mantissa as an integer, scaled by 10^-(fraction digits).
    let mut mantissa: u128 = 0;
    for c in integer.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(u128::from(c - b'0')))
            .ok_or_else(|| err("number too large"))?;
    }

    let mut multiplier: u128 = 1;
    let mut decimal_exponent: i64 = 0;

    if let Some(&(_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        multiplier = 1u128 << (10 * power);
    } else if let Some(&(_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        decimal_exponent = exp;
    } else if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
        decimal_exponent = exp.parse().map_err(|_| err("invalid exponent"))?;
    } else if !suffix.is_empty() {
        return Err(err("unknown suffix"));
    }

    decimal_exponent -= i64::try_from(fraction.len()).map_err(|_| err("number too long"))?;

    let mut value = mantissa
        .checked_mul(multiplier)
        .ok_or_else(|| err("number too large"))?;

    if decimal_exponent >= 0 {
        let scale = u32::try_from(decimal_exponent)
            .ok()
            .and_then(|e| 10u128.checked_pow(e))
            .ok_or_else(|| err("number too large"))?;

        value = value
            .checked_mul(scale)
            .ok_or_else(|| err("number too large"))?;
    } else {
        // Divide, rounding up. Large negative exponents collapse to 0 or 1.
        let divisor = u32::try_from(-decimal_exponent)
            .ok()
            .and_then(|e| 10u128.checked_pow(e));

        value = match divisor {
            Some(d) => value.div_ceil(d),
            None => u128::from(value > 0),
        };
    }

    u64::try_from(value).map_err(|_| err("number too large"))
}

#[test]
fn parse_suffixes() {
    const GI: u64 = 1 << 30;

    assert_eq!(parse_quantity("0").unwrap(), 0);
    assert_eq!(parse_quantity("512").unwrap(), 512);
    assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
    assert_eq!(parse_quantity("10Gi").unwrap(), 10 * GI);
    assert_eq!(parse_quantity("1.5Gi").unwrap(), GI + GI / 2);
    assert_eq!(parse_quantity("2Ti").unwrap(), 2 << 40);
    assert_eq!(parse_quantity("1k").unwrap(), 1000);
    assert_eq!(parse_quantity("3G").unwrap(), 3_000_000_000);
    assert_eq!(parse_quantity("1.5M").unwrap(), 1_500_000);
    assert_eq!(parse_quantity("5e3").unwrap(), 5000);
    assert_eq!(parse_quantity("  7Mi ").unwrap(), 7 << 20);
    assert_eq!(parse_quantity("+1Ki").unwrap(), 1024);
}

#[test]
fn round_fractions_up() {
    assert_eq!(parse_quantity("0.1").unwrap(), 1);
    assert_eq!(parse_quantity("1.0001Ki").unwrap(), 1025);
    assert_eq!(parse_quantity("1.5").unwrap(), 2);
    assert_eq!(parse_quantity("1e-3").unwrap(), 1);
    assert_eq!(parse_quantity("1500m").unwrap(), 2);
    assert_eq!(parse_quantity("4000m").unwrap(), 4);
    assert_eq!(parse_quantity("1u").unwrap(), 1);
    assert_eq!(parse_quantity("2000000000n").unwrap(), 2);
    assert_eq!(parse_quantity("0m").unwrap(), 0);
}

#[test]
fn reject_invalid_quantities() {
    for invalid in ["", "Gi", "-1Gi", "1.2.3", "10Xi", "1e", "1ee3", "20Ei", "99999999999999999999"] {
        assert!(
            matches!(parse_quantity(invalid), Err(ImportError::SizeParse(..))),
            "{invalid:?} must be rejected"
        );
    }
}
