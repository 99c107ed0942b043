use super::types::{Lot, MarketState, SecurityKind, TIME_EPSILON};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Payments {
    pub dividends: f64,
    pub coupons: f64,
    pub matured: f64,
}

impl Payments {
    pub fn total(self) -> f64 {
        self.dividends + self.coupons + self.matured
    }
}

pub fn collect_payments(
    lots: &mut Vec<Lot>,
    market: &MarketState,
    as_of: f64,
    narrative: &mut Vec<String>,
) -> Payments {
    let mut payments = Payments::default();
    let mut expired = Vec::new();

    for (index, lot) in lots.iter_mut().enumerate() {
        let Some(security) = market.security(&lot.symbol) else {
            continue;
        };

        let period = security.payment_period_years;
        if period > 0.0 && as_of - lot.last_payment_time >= period - TIME_EPSILON {
            match &security.kind {
                SecurityKind::Stock(stock) => payments.dividends += lot.units * stock.dividend_per_unit,
                SecurityKind::Bond(bond) => payments.coupons += lot.units * bond.coupon_per_unit,
            }
            lot.last_payment_time = as_of;
        }

        if let SecurityKind::Bond(bond) = &security.kind {
            if as_of - lot.purchase_time >= bond.duration_years - TIME_EPSILON {
                payments.matured += lot.units * bond.face_value;
                narrative.push(format!(
                    "Matured {} {} bonds at ${:.2} each.",
                    lot.units, lot.symbol, bond.face_value
                ));
                expired.push(index);
            }
        }
    }

    while let Some(index) = expired.pop() {
        lots.remove(index);
    }

    payments
}
