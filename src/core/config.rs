use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult, invalid};
use super::market::{aligned_last_payment, calendar_year};
use super::tax::TaxCode;
use super::types::{Agent, Lot, MarketState, SecurityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedLot {
    pub symbol: String,
    pub units: f64,
    pub cost_basis_per_unit: f64,
    /// Defaults to the simulation start time.
    #[serde(default)]
    pub purchase_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub age: f64,
    pub cash: f64,
    pub min_cash: f64,
    pub max_cash: f64,
    #[serde(default)]
    pub earnings: f64,
    #[serde(default)]
    pub expenses: f64,
    #[serde(default)]
    pub healthcare: f64,
    #[serde(default)]
    pub social_security: f64,
    pub stock_ratio: f64,
    #[serde(default)]
    pub lots: Vec<SeedLot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub agent: AgentProfile,
    pub market: MarketState,
    pub trials: u32,
    pub time_step_years: f64,
    pub record_interval_years: f64,
    pub horizon_years: f64,
    pub start_time: f64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub tax_code: TaxCode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSchedule {
    pub start_time: f64,
    pub time_step_years: f64,
    pub horizon_years: f64,
    pub record_interval_years: f64,
}

impl SimulationConfig {
    pub fn schedule(&self) -> TrialSchedule {
        TrialSchedule {
            start_time: self.start_time,
            time_step_years: self.time_step_years,
            horizon_years: self.horizon_years,
            record_interval_years: self.record_interval_years,
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.trials == 0 {
            return Err(invalid("trials must be > 0"));
        }
        if !self.time_step_years.is_finite() || self.time_step_years <= 0.0 {
            return Err(invalid("timeStepYears must be > 0"));
        }
        if !self.record_interval_years.is_finite() || self.record_interval_years <= 0.0 {
            return Err(invalid("recordIntervalYears must be > 0"));
        }
        if !self.horizon_years.is_finite() || self.horizon_years < 0.0 {
            return Err(invalid("horizonYears must be >= 0"));
        }
        if !self.start_time.is_finite() {
            return Err(invalid("startTime must be finite"));
        }

        self.validate_market()?;
        self.validate_agent()?;

        self.tax_code.ordinary.check("ordinary").map_err(invalid)?;
        self.tax_code
            .capital_gains
            .check("capital gains")
            .map_err(invalid)?;
        Ok(())
    }

    fn validate_market(&self) -> SimResult<()> {
        let market = &self.market;
        if market.securities.is_empty() {
            return Err(invalid("market needs at least one security"));
        }
        for (key, security) in &market.securities {
            if *key != security.symbol {
                return Err(invalid(format!(
                    "security keyed '{key}' declares symbol '{}'",
                    security.symbol
                )));
            }
            if !security.payment_period_years.is_finite() || security.payment_period_years <= 0.0 {
                return Err(invalid(format!("{key}: paymentPeriodYears must be > 0")));
            }
            if !security.payment_delay_years.is_finite() || security.payment_delay_years < 0.0 {
                return Err(invalid(format!("{key}: paymentDelayYears must be >= 0")));
            }
            match &security.kind {
                SecurityKind::Stock(stock) => {
                    if !stock.price.is_finite() || stock.price < 0.0 {
                        return Err(invalid(format!("{key}: price must be >= 0")));
                    }
                    if !stock.volatility.is_finite() || stock.volatility < 0.0 {
                        return Err(invalid(format!("{key}: volatility must be >= 0")));
                    }
                    if !stock.expected_return.is_finite() || stock.dividend_per_unit < 0.0 {
                        return Err(invalid(format!(
                            "{key}: expectedReturn must be finite and dividendPerUnit >= 0"
                        )));
                    }
                }
                SecurityKind::Bond(bond) => {
                    if !bond.face_value.is_finite() || bond.face_value <= 0.0 {
                        return Err(invalid(format!("{key}: faceValue must be > 0")));
                    }
                    if !bond.duration_years.is_finite() || bond.duration_years <= 0.0 {
                        return Err(invalid(format!("{key}: durationYears must be > 0")));
                    }
                    if !bond.coupon_per_unit.is_finite() || bond.coupon_per_unit < 0.0 {
                        return Err(invalid(format!("{key}: couponPerUnit must be >= 0")));
                    }
                }
            }
        }
        if !market.short_rate.is_finite() || market.short_rate < 0.0 {
            return Err(invalid("shortRate must be >= 0"));
        }
        let vasicek = market.vasicek;
        if vasicek.speed < 0.0 || vasicek.volatility < 0.0 || !vasicek.long_run_mean.is_finite() {
            return Err(invalid("vasicek speed and volatility must be >= 0"));
        }
        if !market.inflation_rate.is_finite() {
            return Err(invalid("inflationRate must be finite"));
        }
        Ok(())
    }

    fn validate_agent(&self) -> SimResult<()> {
        let agent = &self.agent;
        if !agent.age.is_finite() || agent.age < 0.0 {
            return Err(invalid("agent age must be >= 0"));
        }
        if !agent.min_cash.is_finite() || !agent.max_cash.is_finite() {
            return Err(invalid("minCash and maxCash must be finite"));
        }
        if agent.min_cash < 0.0 || agent.max_cash < agent.min_cash {
            return Err(invalid("cash band must satisfy 0 <= minCash <= maxCash"));
        }
        if !(0.0..=1.0).contains(&agent.stock_ratio) {
            return Err(invalid("stockRatio must be between 0 and 1"));
        }
        let flows = [
            agent.cash,
            agent.earnings,
            agent.expenses,
            agent.healthcare,
            agent.social_security,
        ];
        if flows.iter().any(|v| !v.is_finite()) {
            return Err(invalid("agent cash and recurring flows must be finite"));
        }
        for lot in &agent.lots {
            if self.market.security(&lot.symbol).is_none() {
                return Err(SimError::UnknownSecurity {
                    symbol: lot.symbol.clone(),
                });
            }
            if !lot.units.is_finite() || lot.units < 0.0 {
                return Err(invalid(format!("{}: seed lot units must be >= 0", lot.symbol)));
            }
            if !lot.cost_basis_per_unit.is_finite() || lot.cost_basis_per_unit < 0.0 {
                return Err(invalid(format!(
                    "{}: seed lot cost basis must be >= 0",
                    lot.symbol
                )));
            }
        }
        Ok(())
    }
}

pub fn start_agent(
    profile: &AgentProfile,
    market: &MarketState,
    start_time: f64,
) -> SimResult<Agent> {
    let mut lots = Vec::with_capacity(profile.lots.len());
    for seed in &profile.lots {
        let security = market
            .security(&seed.symbol)
            .ok_or_else(|| SimError::UnknownSecurity {
                symbol: seed.symbol.clone(),
            })?;
        let purchase_time = seed.purchase_time.unwrap_or(start_time);
        lots.push(Lot {
            symbol: seed.symbol.clone(),
            units: seed.units,
            purchase_time,
            cost_basis_per_unit: seed.cost_basis_per_unit,
            last_payment_time: aligned_last_payment(security, purchase_time),
        });
    }
    lots.sort_by(|a, b| a.purchase_time.total_cmp(&b.purchase_time));

    Ok(Agent {
        start_age: profile.age,
        cash: profile.cash,
        min_cash: profile.min_cash,
        max_cash: profile.max_cash,
        earnings: profile.earnings,
        expenses: profile.expenses,
        healthcare: profile.healthcare,
        social_security: profile.social_security,
        stock_ratio: profile.stock_ratio,
        lots,
        bankrupt: false,
        last_settled_tax_year: calendar_year(start_time) - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BondTerms, Security, StockTerms, VasicekParams};
    use std::collections::BTreeMap;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_config() -> SimulationConfig {
        let mut securities = BTreeMap::new();
        securities.insert(
            "SPY".to_string(),
            Security::stock(
                "SPY",
                StockTerms {
                    price: 289.0,
                    expected_return: 0.05,
                    volatility: 0.2,
                    dividend_per_unit: 1.43,
                },
                0.25,
            ),
        );
        securities.insert(
            "UST".to_string(),
            Security::bond(
                "UST",
                BondTerms {
                    face_value: 1_000.0,
                    coupon_per_unit: 25.0,
                    duration_years: 10.0,
                },
                0.5,
            ),
        );

        SimulationConfig {
            agent: AgentProfile {
                age: 40.0,
                cash: 25_000.0,
                min_cash: 10_000.0,
                max_cash: 40_000.0,
                earnings: 70_000.0,
                expenses: 40_000.0,
                healthcare: 4_000.0,
                social_security: 18_000.0,
                stock_ratio: 0.6,
                lots: vec![
                    SeedLot {
                        symbol: "UST".to_string(),
                        units: 5.0,
                        cost_basis_per_unit: 1_000.0,
                        purchase_time: None,
                    },
                    SeedLot {
                        symbol: "SPY".to_string(),
                        units: 50.0,
                        cost_basis_per_unit: 200.0,
                        purchase_time: Some(2023.8),
                    },
                ],
            },
            market: MarketState {
                securities,
                short_rate: 0.03,
                vasicek: VasicekParams {
                    speed: 1.75,
                    long_run_mean: 0.075,
                    volatility: 0.01,
                },
                inflation_rate: 0.02,
            },
            trials: 10,
            time_step_years: 7.0 / 365.0,
            record_interval_years: 1.0,
            horizon_years: 20.0,
            start_time: 2026.6,
            seed: 1,
            tax_code: TaxCode::default(),
        }
    }

    #[test]
    fn sample_config_is_valid() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_positive_time_step_and_interval() {
        let mut config = sample_config();
        config.time_step_years = 0.0;
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));

        let mut config = sample_config();
        config.record_interval_years = -1.0;
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_bad_market_terms() {
        let mut config = sample_config();
        if let Some(ust) = config.market.securities.get_mut("UST") {
            ust.payment_period_years = 0.0;
        }
        let err = config.validate().expect_err("zero period must fail");
        assert!(err.to_string().contains("paymentPeriodYears"));

        let mut config = sample_config();
        config.market.vasicek.volatility = -0.1;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        if let Some(spy) = config.market.securities.get_mut("SPY") {
            spy.symbol = "VOO".to_string();
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_agent_profile() {
        let mut config = sample_config();
        config.agent.stock_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.agent.max_cash = 5_000.0;
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.agent.lots[0].units = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_finite_cash_band() {
        for (min_cash, max_cash) in [
            (f64::NAN, 40_000.0),
            (10_000.0, f64::NAN),
            (10_000.0, f64::INFINITY),
            (f64::NEG_INFINITY, 40_000.0),
        ] {
            let mut config = sample_config();
            config.agent.min_cash = min_cash;
            config.agent.max_cash = max_cash;
            let err = config.validate().expect_err("non-finite band must fail");
            assert!(err.to_string().contains("minCash and maxCash must be finite"));
        }
    }

    #[test]
    fn validate_reports_unknown_seed_symbol() {
        let mut config = sample_config();
        config.agent.lots[0].symbol = "GLD".to_string();
        match config.validate() {
            Err(SimError::UnknownSecurity { symbol }) => assert_eq!(symbol, "GLD"),
            other => panic!("expected unknown security, got {other:?}"),
        }
    }

    #[test]
    fn start_agent_orders_and_aligns_seed_lots() {
        let config = sample_config();
        let agent = start_agent(&config.agent, &config.market, config.start_time)
            .expect("valid profile");

        assert_eq!(agent.lots.len(), 2);
        assert_eq!(agent.lots[0].symbol, "SPY");
        assert_approx(agent.lots[0].purchase_time, 2023.8);
        assert_approx(agent.lots[0].last_payment_time, 2023.75);
        assert_eq!(agent.lots[1].symbol, "UST");
        assert_approx(agent.lots[1].purchase_time, 2026.6);
        assert_approx(agent.lots[1].last_payment_time, 2026.5);
        assert_eq!(agent.last_settled_tax_year, 2025);
        assert!(!agent.bankrupt);
    }

    #[test]
    fn config_json_uses_camel_case_and_defaults_tax_code() {
        let config = sample_config();
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("\"timeStepYears\""));
        assert!(json.contains("\"class\":\"bond\""));

        let mut value: serde_json::Value = serde_json::from_str(&json).expect("json value");
        if let Some(obj) = value.as_object_mut() {
            obj.remove("taxCode");
            obj.remove("seed");
        }
        let parsed: SimulationConfig = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed.tax_code, TaxCode::default());
        assert_eq!(parsed.seed, 0);
    }
}
