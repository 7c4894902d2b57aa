use rust_decimal::Decimal;
use serde::Serialize;

use super::round_money;

/// Platform commission on a single order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Commission {
    pub rate: Decimal,
    pub total_price: Decimal,
    pub commission_amount: Decimal,
    pub artisan_payout: Decimal,
}

/// Splits a line total between the platform and the artisan.
///
/// The commission is rounded to cents; the payout is whatever remains, so the
/// two always add back up to the line total.
pub fn compute(unit_price: Decimal, quantity: i32, rate: Decimal) -> Commission {
    let total_price = unit_price * Decimal::from(quantity);
    let commission_amount = round_money(total_price * rate);
    Commission {
        rate,
        total_price,
        commission_amount,
        artisan_payout: total_price - commission_amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ten_percent_of_two_units() {
        let c = compute(dec!(1000), 2, dec!(0.10));
        assert_eq!(c.total_price, dec!(2000));
        assert_eq!(c.commission_amount, dec!(200.00));
        assert_eq!(c.artisan_payout, dec!(1800.00));
    }

    #[test]
    fn commission_rounds_to_cents() {
        let c = compute(dec!(0.05), 1, dec!(0.15));
        assert_eq!(c.commission_amount, dec!(0.01));
        assert_eq!(c.artisan_payout, dec!(0.04));
    }

    proptest! {
        #[test]
        fn payout_plus_commission_is_line_total(
            cents in 0i64..10_000_000,
            quantity in 1i32..1000,
            rate_bp in 0i64..=10_000,
        ) {
            let unit_price = Decimal::new(cents, 2);
            let rate = Decimal::new(rate_bp, 4);
            let c = compute(unit_price, quantity, rate);
            prop_assert_eq!(c.commission_amount + c.artisan_payout, c.total_price);
            prop_assert!(c.commission_amount >= Decimal::ZERO);
            prop_assert!(c.artisan_payout >= Decimal::ZERO);
        }
    }
}
