use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::model::Service;

/// Tax applied at generation time. Fixed rate — workspace-level tax
/// configuration is not consulted on this path.
pub(crate) fn tax_rate() -> Decimal {
    Decimal::new(8, 2) // 0.08
}

/// Price snapshot for one generated booking. Computed once per
/// generation run and stamped onto every booking it creates; later
/// service price changes do not touch existing bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

pub fn quote(service: &Service) -> Quote {
    let subtotal = service.base_price;
    let tax = (subtotal * tax_rate()).round_dp(2);
    Quote {
        subtotal,
        tax,
        total: subtotal + tax,
    }
}

/// Day-truncated generation clock. Callers thread the date through so
/// tests can pin it.
pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn service(cents: i64) -> Service {
        Service {
            id: Ulid::new(),
            name: "Standard Clean".into(),
            base_price: Decimal::new(cents, 2),
            estimated_minutes: 120,
        }
    }

    #[test]
    fn quote_applies_eight_percent() {
        let q = quote(&service(12000)); // 120.00
        assert_eq!(q.subtotal, Decimal::new(12000, 2));
        assert_eq!(q.tax, Decimal::new(960, 2)); // 9.60
        assert_eq!(q.total, Decimal::new(12960, 2)); // 129.60
    }

    #[test]
    fn quote_rounds_tax_to_cents() {
        let q = quote(&service(9999)); // 99.99 → tax 7.9992
        assert_eq!(q.tax, Decimal::new(800, 2));
        assert_eq!(q.total, Decimal::new(10799, 2));
    }

    #[test]
    fn quote_zero_price() {
        let q = quote(&service(0));
        assert_eq!(q.tax, Decimal::ZERO);
        assert_eq!(q.total, Decimal::ZERO);
    }
}
