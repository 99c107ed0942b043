use rand::Rng;

use super::types::{BondTerms, Lot, MarketState, Security, SecurityKind, TIME_EPSILON};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Valuation {
    pub stock_value: f64,
    pub bond_value: f64,
}

impl Valuation {
    pub fn total(self) -> f64 {
        self.stock_value + self.bond_value
    }
}

impl MarketState {
    pub fn step<R: Rng + ?Sized>(&mut self, dt: f64, rng: &mut R) {
        self.step_securities(dt, rng);
        self.step_short_rate(dt, rng);
    }

    fn step_securities<R: Rng + ?Sized>(&mut self, dt: f64, rng: &mut R) {
        for security in self.securities.values_mut() {
            match &mut security.kind {
                SecurityKind::Stock(stock) => {
                    let shock = two_point_shock(stock.volatility * dt.sqrt(), rng);
                    stock.price = (stock.price * (1.0 + dt * stock.expected_return + shock)).max(0.0);
                }
                SecurityKind::Bond(_) => {}
            }
        }
    }

    fn step_short_rate<R: Rng + ?Sized>(&mut self, dt: f64, rng: &mut R) {
        let vasicek = self.vasicek;
        let shock = two_point_shock(vasicek.volatility * dt.sqrt(), rng);
        self.short_rate += vasicek.speed * (vasicek.long_run_mean - self.short_rate) * dt + shock;
        self.short_rate = self.short_rate.max(0.0);
    }
}

fn two_point_shock<R: Rng + ?Sized>(magnitude: f64, rng: &mut R) -> f64 {
    if rng.gen_bool(0.5) {
        magnitude
    } else {
        -magnitude
    }
}

/// Discounted remaining coupons plus discounted face value, per unit.
pub fn bond_unit_value(
    lot: &Lot,
    payment_period_years: f64,
    bond: &BondTerms,
    as_of: f64,
    short_rate: f64,
) -> f64 {
    let discount = |t: f64| (1.0 + short_rate).powf(-t);

    let periods = ((as_of - lot.last_payment_time) / payment_period_years).ceil();
    let to_next_coupon = lot.last_payment_time + periods * payment_period_years - as_of;
    let to_maturity = (lot.purchase_time + bond.duration_years - as_of).max(0.0);

    let mut value = 0.0;
    let mut t = to_next_coupon;
    while t < to_maturity - TIME_EPSILON {
        value += bond.coupon_per_unit * discount(t);
        t += payment_period_years;
    }

    value + bond.face_value * discount(to_maturity)
}

pub fn unit_value(lot: &Lot, security: &Security, as_of: f64, short_rate: f64) -> f64 {
    match &security.kind {
        SecurityKind::Stock(stock) => stock.price,
        SecurityKind::Bond(bond) => bond_unit_value(
            lot,
            security.payment_period_years,
            bond,
            as_of,
            short_rate,
        ),
    }
}

pub fn portfolio_valuation(lots: &[Lot], market: &MarketState, as_of: f64) -> Valuation {
    let mut valuation = Valuation::default();
    for lot in lots {
        let Some(security) = market.security(&lot.symbol) else {
            continue;
        };
        let value = lot.units * unit_value(lot, security, as_of, market.short_rate);
        match security.kind {
            SecurityKind::Stock(_) => valuation.stock_value += value,
            SecurityKind::Bond(_) => valuation.bond_value += value,
        }
    }
    valuation
}

pub fn payment_reference_time(security: &Security, purchase_time: f64) -> f64 {
    purchase_time.floor() + security.payment_delay_years
}

/// Snaps a purchase onto the security's annual payment grid so every lot of
/// one security shares the same payment calendar.
pub fn aligned_last_payment(security: &Security, purchase_time: f64) -> f64 {
    let reference = payment_reference_time(security, purchase_time);
    let period = security.payment_period_years;
    let n = ((purchase_time - reference) / period + TIME_EPSILON).floor();
    reference + n * period
}

pub fn calendar_year(time: f64) -> i32 {
    (time + TIME_EPSILON).floor() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StockTerms, VasicekParams};
    use proptest::prelude::{any, prop_assert, proptest};
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;
    use std::collections::BTreeMap;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn treasury() -> Security {
        Security::bond(
            "UST",
            BondTerms {
                face_value: 1_000.0,
                coupon_per_unit: 25.0,
                duration_years: 2.0,
            },
            0.5,
        )
    }

    fn sample_market(volatility: f64, rate_volatility: f64) -> MarketState {
        let mut securities = BTreeMap::new();
        securities.insert(
            "SPY".to_string(),
            Security::stock(
                "SPY",
                StockTerms {
                    price: 289.0,
                    expected_return: 0.05,
                    volatility,
                    dividend_per_unit: 1.43,
                },
                0.25,
            ),
        );
        securities.insert("UST".to_string(), treasury());
        MarketState {
            securities,
            short_rate: 0.03,
            vasicek: VasicekParams {
                speed: 1.75,
                long_run_mean: 0.075,
                volatility: rate_volatility,
            },
            inflation_rate: 0.02,
        }
    }

    fn bond_lot(purchase_time: f64, last_payment_time: f64) -> Lot {
        Lot {
            symbol: "UST".to_string(),
            units: 1.0,
            purchase_time,
            cost_basis_per_unit: 1_000.0,
            last_payment_time,
        }
    }

    fn spy_price(market: &MarketState) -> f64 {
        match &market.securities["SPY"].kind {
            SecurityKind::Stock(stock) => stock.price,
            SecurityKind::Bond(_) => unreachable!(),
        }
    }

    #[test]
    fn bond_value_at_issuance_with_zero_rate_sums_all_cash_flows() {
        let security = treasury();
        let lot = bond_lot(2026.0, aligned_last_payment(&security, 2026.0));
        assert_approx(unit_value(&lot, &security, 2026.0, 0.0), 1_100.0);
    }

    #[test]
    fn bond_value_at_maturity_is_face_value() {
        let security = treasury();
        let lot = bond_lot(2026.0, 2027.5);
        assert_approx(unit_value(&lot, &security, 2028.0, 0.0), 1_000.0);
        assert_approx(unit_value(&lot, &security, 2028.0, 0.08), 1_000.0);
    }

    #[test]
    fn bond_value_mid_period_counts_only_remaining_coupons() {
        let security = treasury();
        let lot = bond_lot(2026.0, 2026.0);
        // coupons still ahead at 2026.5, 2027.0, 2027.5
        assert_approx(unit_value(&lot, &security, 2026.25, 0.0), 1_075.0);
    }

    #[test]
    fn bond_value_discounts_with_positive_rate() {
        let security = treasury();
        let lot = bond_lot(2026.0, 2026.0);
        let value = unit_value(&lot, &security, 2026.0, 0.05);
        let expected = 25.0
            + 25.0 / 1.05_f64.powf(0.5)
            + 25.0 / 1.05
            + 25.0 / 1.05_f64.powf(1.5)
            + 1_000.0 / 1.05_f64.powi(2);
        assert_approx(value, expected);
    }

    #[test]
    fn zero_volatility_step_applies_drift_only() {
        let mut market = sample_market(0.0, 0.0);
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        market.step(1.0, &mut rng);

        assert_approx(spy_price(&market), 289.0 * 1.05);
        assert_approx(market.short_rate, 0.03 + 1.75 * (0.075 - 0.03));
    }

    #[test]
    fn huge_shock_floors_price_and_rate_at_zero() {
        let mut market = sample_market(50.0, 50.0);
        market.vasicek.speed = 0.0;
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        for _ in 0..64 {
            market.step(1.0, &mut rng);
            assert!(spy_price(&market) >= 0.0);
            assert!(market.short_rate >= 0.0);
        }
    }

    #[test]
    fn valuation_splits_by_class() {
        let market = sample_market(0.2, 0.01);
        let lots = vec![
            Lot {
                symbol: "SPY".to_string(),
                units: 10.0,
                purchase_time: 2026.0,
                cost_basis_per_unit: 250.0,
                last_payment_time: 2026.0,
            },
            bond_lot(2026.0, 2026.0),
        ];
        let valuation = portfolio_valuation(&lots, &market, 2026.0);
        assert_approx(valuation.stock_value, 2_890.0);
        assert!(valuation.bond_value > 1_000.0);
        assert_approx(
            valuation.total(),
            valuation.stock_value + valuation.bond_value,
        );
    }

    #[test]
    fn alignment_respects_payment_delay() {
        let mut security = treasury();
        security.payment_delay_years = 0.1;
        assert_approx(aligned_last_payment(&security, 2026.35), 2026.1);
        assert_approx(aligned_last_payment(&security, 2026.05), 2025.6);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_step_never_goes_negative(
            seed in any::<u64>(),
            dt_days in 1u32..400,
            vol_bp in 0u32..20_000,
            rate_vol_bp in 0u32..5_000,
            return_bp in -5_000i32..5_000,
            steps in 1usize..200
        ) {
            let mut market = sample_market(vol_bp as f64 / 10_000.0, rate_vol_bp as f64 / 10_000.0);
            if let SecurityKind::Stock(stock) = &mut market.securities.get_mut("SPY").unwrap().kind {
                stock.expected_return = return_bp as f64 / 10_000.0;
            }
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            let dt = dt_days as f64 / 365.0;
            for _ in 0..steps {
                market.step(dt, &mut rng);
                prop_assert!(spy_price(&market) >= 0.0);
                prop_assert!(market.short_rate >= 0.0);
            }
        }

        #[test]
        fn prop_aligned_lots_sit_on_the_payment_grid(
            year in 1990u32..2100,
            offset_bp in 0u32..10_000,
            delay_bp in 0u32..10_000,
            payments_per_year in 1u32..13
        ) {
            let mut security = treasury();
            security.payment_period_years = 1.0 / payments_per_year as f64;
            security.payment_delay_years = delay_bp as f64 / 10_000.0;
            let purchase = year as f64 + offset_bp as f64 / 10_000.0;

            let reference = payment_reference_time(&security, purchase);
            let last = aligned_last_payment(&security, purchase);
            let periods = (last - reference) / security.payment_period_years;

            prop_assert!((periods - periods.round()).abs() < 1e-6);
            prop_assert!(last <= purchase + 1e-6);
            prop_assert!(purchase - last < security.payment_period_years + 1e-6);
        }

        #[test]
        fn prop_bond_value_at_maturity_equals_face(
            rate_bp in 0u32..2_000,
            duration_quarters in 1u32..40,
            elapsed_quarters in 0u32..40
        ) {
            let mut security = treasury();
            if let SecurityKind::Bond(bond) = &mut security.kind {
                bond.duration_years = duration_quarters as f64 * 0.25;
            }
            let last = 2026.0 + (elapsed_quarters.min(duration_quarters) as f64) * 0.25;
            let lot = bond_lot(2026.0, last);
            let maturity = 2026.0 + duration_quarters as f64 * 0.25;
            let value = unit_value(&lot, &security, maturity, rate_bp as f64 / 10_000.0);
            prop_assert!((value - 1_000.0).abs() < 1e-6);
        }
    }
}
