use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const TIME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockTerms {
    pub price: f64,
    pub expected_return: f64,
    pub volatility: f64,
    #[serde(default)]
    pub dividend_per_unit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondTerms {
    pub face_value: f64,
    pub coupon_per_unit: f64,
    pub duration_years: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase")]
pub enum SecurityKind {
    Stock(StockTerms),
    Bond(BondTerms),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    pub symbol: String,
    pub payment_period_years: f64,
    #[serde(default)]
    pub payment_delay_years: f64,
    #[serde(flatten)]
    pub kind: SecurityKind,
}

impl Security {
    pub fn stock(symbol: &str, terms: StockTerms, payment_period_years: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            payment_period_years,
            payment_delay_years: 0.0,
            kind: SecurityKind::Stock(terms),
        }
    }

    pub fn bond(symbol: &str, terms: BondTerms, payment_period_years: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            payment_period_years,
            payment_delay_years: 0.0,
            kind: SecurityKind::Bond(terms),
        }
    }

    pub fn is_stock(&self) -> bool {
        matches!(self.kind, SecurityKind::Stock(_))
    }

    pub fn is_bond(&self) -> bool {
        matches!(self.kind, SecurityKind::Bond(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VasicekParams {
    pub speed: f64,
    pub long_run_mean: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketState {
    pub securities: BTreeMap<String, Security>,
    pub short_rate: f64,
    pub vasicek: VasicekParams,
    pub inflation_rate: f64,
}

impl MarketState {
    pub fn security(&self, symbol: &str) -> Option<&Security> {
        self.securities.get(symbol)
    }

    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.securities
            .iter()
            .filter_map(|(symbol, security)| match &security.kind {
                SecurityKind::Stock(stock) => Some((symbol.clone(), stock.price)),
                SecurityKind::Bond(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lot {
    pub symbol: String,
    pub units: f64,
    pub purchase_time: f64,
    pub cost_basis_per_unit: f64,
    pub last_payment_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub start_age: f64,
    pub cash: f64,
    pub min_cash: f64,
    pub max_cash: f64,
    pub earnings: f64,
    pub expenses: f64,
    pub healthcare: f64,
    pub social_security: f64,
    pub stock_ratio: f64,
    pub lots: Vec<Lot>,
    pub bankrupt: bool,
    pub last_settled_tax_year: i32,
}

impl Agent {
    pub fn cash_midpoint(&self) -> f64 {
        (self.max_cash + self.min_cash) / 2.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccrualBucket {
    pub dividends: f64,
    pub coupons: f64,
    pub matured: f64,
    pub invested: f64,
    pub liquidated: f64,
    pub earned: f64,
    pub spent: f64,
    pub income: f64,
    pub expense: f64,
    pub taxes: f64,
    pub net_cashflow: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub time: f64,
    pub age: f64,
    pub total_asset_value: f64,
    pub cash: f64,
    pub stock_value: f64,
    pub bond_value: f64,
    pub short_rate: f64,
    pub inflation_rate: f64,
    pub prices: BTreeMap<String, f64>,
    pub accrued: AccrualBucket,
    pub narrative: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialRecord {
    pub trial_index: u32,
    pub seed: u64,
    pub bankrupt: bool,
    pub samples: Vec<Sample>,
}

impl TrialRecord {
    pub fn final_asset_value(&self) -> f64 {
        self.samples
            .last()
            .map(|s| s.total_asset_value)
            .unwrap_or(0.0)
    }

    pub fn average_asset_value(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.total_asset_value).sum::<f64>() / self.samples.len() as f64
    }

    pub fn is_depleted(&self) -> bool {
        self.final_asset_value() <= 0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedTrials {
    pub trials: Vec<TrialRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileTrial {
    pub percentile: f64,
    pub rank: usize,
    pub average_asset_value: f64,
    pub final_asset_value: f64,
    pub trial: TrialRecord,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub trials: usize,
    pub bankruptcy_rate: f64,
    pub percentiles: Vec<PercentileTrial>,
}
