use serde::{Deserialize, Serialize};

use super::types::Agent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBracket {
    pub rate: f64,
    /// `None` marks the open-ended top bracket.
    #[serde(default)]
    pub upper_bound: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxSchedule {
    #[serde(default)]
    pub standard_deduction: f64,
    pub brackets: Vec<TaxBracket>,
}

impl TaxSchedule {
    pub fn tax_due(&self, income: f64) -> f64 {
        let taxable = (income - self.standard_deduction).max(0.0);
        let mut tax = 0.0;
        let mut covered = 0.0;
        for bracket in &self.brackets {
            if taxable <= covered {
                break;
            }
            let upper = bracket.upper_bound.unwrap_or(f64::INFINITY);
            let portion = (taxable.min(upper) - covered).max(0.0);
            tax += bracket.rate * portion;
            covered += portion;
        }
        tax
    }

    pub(crate) fn check(&self, name: &str) -> Result<(), String> {
        if self.brackets.is_empty() {
            return Err(format!("{name} tax schedule needs at least one bracket"));
        }
        if !self.standard_deduction.is_finite() || self.standard_deduction < 0.0 {
            return Err(format!("{name} standard deduction must be >= 0"));
        }
        let mut previous = 0.0;
        for (idx, bracket) in self.brackets.iter().enumerate() {
            if !(0.0..=1.0).contains(&bracket.rate) {
                return Err(format!("{name} bracket rates must be between 0 and 1"));
            }
            let is_last = idx + 1 == self.brackets.len();
            match bracket.upper_bound {
                Some(upper) if upper.is_finite() && upper > previous => previous = upper,
                Some(_) => {
                    return Err(format!(
                        "{name} bracket upper bounds must be finite and strictly ascending"
                    ));
                }
                None if is_last => {}
                None => {
                    return Err(format!("{name} only the top bracket may be unbounded"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxCode {
    pub ordinary: TaxSchedule,
    pub capital_gains: TaxSchedule,
}

impl Default for TaxCode {
    fn default() -> Self {
        let federal_2019 = vec![
            bracket(0.10, Some(9_700.0)),
            bracket(0.12, Some(39_475.0)),
            bracket(0.22, Some(84_200.0)),
            bracket(0.24, Some(160_725.0)),
            bracket(0.32, Some(204_100.0)),
            bracket(0.35, Some(510_300.0)),
            bracket(0.37, None),
        ];
        Self {
            ordinary: TaxSchedule {
                standard_deduction: 12_200.0,
                brackets: federal_2019.clone(),
            },
            capital_gains: TaxSchedule {
                standard_deduction: 0.0,
                brackets: federal_2019,
            },
        }
    }
}

fn bracket(rate: f64, upper_bound: Option<f64>) -> TaxBracket {
    TaxBracket { rate, upper_bound }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaxBill {
    pub earned_tax: f64,
    pub capital_tax: f64,
}

impl TaxBill {
    pub fn total(self) -> f64 {
        self.earned_tax + self.capital_tax
    }
}

pub fn settle_tax_year(
    agent: &mut Agent,
    tax_year: i32,
    earned_income: f64,
    long_term_gain: f64,
    code: &TaxCode,
) -> TaxBill {
    let bill = TaxBill {
        earned_tax: code.ordinary.tax_due(earned_income),
        capital_tax: code.capital_gains.tax_due(long_term_gain),
    };
    agent.cash -= bill.total();
    agent.last_settled_tax_year = tax_year;
    bill
}
