//! Integer-encoded price level keys

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Decimal places preserved by a [`PriceRoundKey`]
pub const PRICE_SCALE: u32 = 8;

/// Integer-encoded price level (price x 10^8, rounded)
///
/// Keys compare by their integer form, so equality implies an identical
/// displayed price. Used as the map key for one side of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriceRoundKey(i64);

impl PriceRoundKey {
    /// Encode a decimal price
    pub fn from_price(price: Decimal) -> Self {
        let scaled = price * Decimal::from(10_i64.pow(PRICE_SCALE));
        Self(scaled.round().to_i64().unwrap_or(i64::MAX))
    }

    /// Decode back to the rounded display price
    pub fn to_price(self) -> Decimal {
        Decimal::new(self.0, PRICE_SCALE)
    }

    /// Raw integer form
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl From<Decimal> for PriceRoundKey {
    fn from(price: Decimal) -> Self {
        Self::from_price(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_trip() {
        let key = PriceRoundKey::from_price(dec!(50000.12345678));
        assert_eq!(key.to_price(), dec!(50000.12345678));
    }

    #[test]
    fn test_equality_after_rounding() {
        // Sub-scale digits are rounded away, so both encode the same level
        let a = PriceRoundKey::from_price(dec!(10.000000001));
        let b = PriceRoundKey::from_price(dec!(10.0));
        assert_eq!(a, b);
    }

    #[test]
    fn test_ordering() {
        let low = PriceRoundKey::from_price(dec!(9.99));
        let high = PriceRoundKey::from_price(dec!(10.01));
        assert!(low < high);
    }
}
