//! Decimal parsing shared by event payloads and stored balances

use rust_decimal::Decimal;
use std::str::FromStr;

/// Parse a decimal written either plainly (`"115.50"`) or in scientific
/// notation (`"1.5e2"`), as float-based writers sometimes produce.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_plain_decimals() {
        assert_eq!(parse_decimal("15.0"), Some(dec!(15.0)));
        assert_eq!(parse_decimal(" 200 "), Some(dec!(200)));
        assert_eq!(parse_decimal("-3.25"), Some(dec!(-3.25)));
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(parse_decimal("1.5e2"), Some(dec!(150)));
        assert_eq!(parse_decimal("1e-2"), Some(dec!(0.01)));
    }

    #[test]
    fn test_garbage() {
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("abc"), None);
        assert_eq!(parse_decimal("NaN"), None);
    }
}
