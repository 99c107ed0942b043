use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use super::config::{SimulationConfig, TrialSchedule, start_agent};
use super::error::{SimError, SimResult, invalid};
use super::market::{calendar_year, portfolio_valuation};
use super::payments::{Payments, collect_payments};
use super::rebalance::{BalanceOutcome, balance_portfolio};
use super::tax::{TaxCode, settle_tax_year};
use super::types::{
    AccrualBucket, Agent, MarketState, PercentileTrial, RankedTrials, Sample, SimulationSummary,
    TIME_EPSILON, TrialRecord,
};

const HEALTHCARE_END_AGE: f64 = 65.0;
const SOCIAL_SECURITY_START_AGE: f64 = 67.0;

#[derive(Debug, Clone, Copy, Default)]
struct AnnualTaxBase {
    earned_income: f64,
    long_term_gain: f64,
}

#[derive(Debug, Clone, Copy)]
struct RecurringFlows {
    earnings: f64,
    expenses: f64,
    healthcare: f64,
    social_security: f64,
}

impl RecurringFlows {
    fn for_step(agent: &Agent, age: f64, dt: f64) -> Self {
        Self {
            earnings: agent.earnings * dt,
            expenses: agent.expenses * dt,
            healthcare: if age < HEALTHCARE_END_AGE {
                agent.healthcare * dt
            } else {
                0.0
            },
            social_security: if age >= SOCIAL_SECURITY_START_AGE {
                agent.social_security * dt
            } else {
                0.0
            },
        }
    }

    fn inflow(self) -> f64 {
        self.earnings + self.social_security
    }

    fn outflow(self) -> f64 {
        self.expenses + self.healthcare
    }
}

/// Per-trial mutable state threaded through every stage of a step.
struct TrialContext<'a> {
    agent: Agent,
    market: MarketState,
    tax_code: &'a TaxCode,
    accrued: AccrualBucket,
    annual: AnnualTaxBase,
    narrative: Vec<String>,
}

impl<'a> TrialContext<'a> {
    fn new(agent: Agent, market: MarketState, tax_code: &'a TaxCode) -> Self {
        Self {
            agent,
            market,
            tax_code,
            accrued: AccrualBucket::default(),
            annual: AnnualTaxBase::default(),
            narrative: Vec::new(),
        }
    }

    fn take_sample(&mut self, now: f64, age: f64) -> Sample {
        let valuation = portfolio_valuation(&self.agent.lots, &self.market, now);
        let total_asset_value = self.agent.cash + valuation.total();
        if total_asset_value <= 0.0 && !self.agent.bankrupt {
            self.agent.bankrupt = true;
            self.narrative.push("Bankrupt.".to_string());
        }

        Sample {
            time: now,
            age,
            total_asset_value,
            cash: self.agent.cash,
            stock_value: valuation.stock_value,
            bond_value: valuation.bond_value,
            short_rate: self.market.short_rate,
            inflation_rate: self.market.inflation_rate,
            prices: self.market.prices(),
            accrued: std::mem::take(&mut self.accrued),
            narrative: std::mem::take(&mut self.narrative),
        }
    }

    fn advance<R: Rng + ?Sized>(&mut self, now: f64, age: f64, dt: f64, rng: &mut R) {
        self.market.step(dt, rng);

        let payments = collect_payments(&mut self.agent.lots, &self.market, now, &mut self.narrative);
        self.agent.cash += payments.total();

        let flows = RecurringFlows::for_step(&self.agent, age, dt);
        self.agent.cash += flows.inflow() - flows.outflow();

        let balance = balance_portfolio(&mut self.agent, &self.market, now, &mut self.narrative);

        // short-term gains are ordinary income, long-term gains are not
        let earned = flows.earnings + payments.coupons + payments.dividends + balance.short_term_gain;
        self.accrue(&payments, &flows, &balance, earned);

        self.settle_taxes_if_due(now);
        self.annual.earned_income += earned;
        self.annual.long_term_gain += balance.long_term_gain;

        let drift = 1.0 + self.market.inflation_rate * dt;
        self.agent.earnings *= drift;
        self.agent.expenses *= drift;
    }

    fn accrue(
        &mut self,
        payments: &Payments,
        flows: &RecurringFlows,
        balance: &BalanceOutcome,
        earned: f64,
    ) {
        let income = flows.inflow() + payments.total() + balance.liquidated;
        let expense = flows.outflow() + balance.invested;

        let acc = &mut self.accrued;
        acc.dividends += payments.dividends;
        acc.coupons += payments.coupons;
        acc.matured += payments.matured;
        acc.invested += balance.invested;
        acc.liquidated += balance.liquidated;
        acc.earned += earned;
        acc.spent += flows.outflow();
        acc.income += income;
        acc.expense += expense;
        acc.net_cashflow += income - expense;
    }

    fn settle_taxes_if_due(&mut self, now: f64) {
        let prior_year = calendar_year(now) - 1;
        if prior_year <= self.agent.last_settled_tax_year {
            return;
        }

        let base = std::mem::take(&mut self.annual);
        let bill = settle_tax_year(
            &mut self.agent,
            prior_year,
            base.earned_income,
            base.long_term_gain,
            self.tax_code,
        );
        let total = bill.total();
        self.accrued.taxes += total;
        self.accrued.expense += total;
        self.accrued.net_cashflow -= total;
        self.narrative.push(format!(
            "Paid ${total:.2} in taxes for {prior_year} (${:.2} on earned income, ${:.2} on capital gains).",
            bill.earned_tax, bill.capital_tax
        ));
    }
}

pub fn step_count(horizon_years: f64, time_step_years: f64) -> usize {
    if time_step_years <= 0.0 || horizon_years <= 0.0 {
        return 0;
    }
    (horizon_years / time_step_years + TIME_EPSILON).floor() as usize
}

pub fn run_trial<R: Rng + ?Sized>(
    agent: Agent,
    market: MarketState,
    schedule: &TrialSchedule,
    tax_code: &TaxCode,
    rng: &mut R,
) -> TrialRecord {
    let dt = schedule.time_step_years;
    let total_steps = step_count(schedule.horizon_years, dt);
    let start_age = agent.start_age;

    let mut ctx = TrialContext::new(agent, market, tax_code);
    let mut samples = Vec::new();
    let mut last_sampled_at: Option<f64> = None;

    for step in 0..total_steps {
        let elapsed = step as f64 * dt;
        let now = schedule.start_time + elapsed;
        let age = start_age + elapsed;

        let sample_due = last_sampled_at.is_none_or(|last| {
            elapsed - last >= schedule.record_interval_years - TIME_EPSILON
        });
        if sample_due {
            samples.push(ctx.take_sample(now, age));
            last_sampled_at = Some(elapsed);
            if ctx.agent.bankrupt {
                break;
            }
        }

        ctx.advance(now, age, dt, rng);
    }

    TrialRecord {
        trial_index: 0,
        seed: 0,
        bankrupt: ctx.agent.bankrupt,
        samples,
    }
}

pub fn run_simulation(config: &SimulationConfig) -> SimResult<RankedTrials> {
    run_simulation_with_cancel(config, &AtomicBool::new(false))
}

pub fn run_simulation_with_cancel(
    config: &SimulationConfig,
    cancel: &AtomicBool,
) -> SimResult<RankedTrials> {
    config.validate()?;
    let agent = start_agent(&config.agent, &config.market, config.start_time)?;
    let schedule = config.schedule();

    let trials = (0..config.trials)
        .into_par_iter()
        .map(|trial_index| {
            if cancel.load(AtomicOrdering::Relaxed) {
                return None;
            }
            let seed = derive_seed(config.seed, trial_index);
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            let mut record = run_trial(
                agent.clone(),
                config.market.clone(),
                &schedule,
                &config.tax_code,
                &mut rng,
            );
            record.trial_index = trial_index;
            record.seed = seed;
            debug!(
                "trial {trial_index}: {} samples, final value {:.2}, bankrupt={}",
                record.samples.len(),
                record.final_asset_value(),
                record.bankrupt
            );
            Some(record)
        })
        .collect::<Vec<_>>();

    let Some(trials) = trials.into_iter().collect::<Option<Vec<_>>>() else {
        warn!("simulation cancelled before all {} trials ran", config.trials);
        return Err(SimError::Cancelled);
    };

    let ranked = RankedTrials::rank(trials);
    info!(
        "ran {} trials over {} years, bankruptcy rate {:.1}%",
        ranked.trials.len(),
        config.horizon_years,
        ranked.bankruptcy_rate() * 100.0
    );
    Ok(ranked)
}

fn compare_outcomes(a: &TrialRecord, b: &TrialRecord) -> Ordering {
    match (a.is_depleted(), b.is_depleted()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .average_asset_value()
            .total_cmp(&b.average_asset_value())
            .then(a.trial_index.cmp(&b.trial_index)),
    }
}

pub fn percentile_index(p: f64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let raw = (p / 100.0 * len as f64).floor();
    if raw.is_nan() || raw < 0.0 {
        0
    } else {
        (raw as usize).min(len - 1)
    }
}

impl RankedTrials {
    /// Worst outcome first.
    pub fn rank(mut trials: Vec<TrialRecord>) -> Self {
        trials.sort_by(compare_outcomes);
        Self { trials }
    }

    pub fn percentile(&self, p: f64) -> Option<&TrialRecord> {
        self.trials.get(percentile_index(p, self.trials.len()))
    }

    pub fn bankruptcy_rate(&self) -> f64 {
        if self.trials.is_empty() {
            return 0.0;
        }
        let bankrupt = self.trials.iter().filter(|t| t.bankrupt).count();
        bankrupt as f64 / self.trials.len() as f64
    }

    pub fn summarize(&self, percentiles: &[f64]) -> SimResult<SimulationSummary> {
        let mut picked = Vec::with_capacity(percentiles.len());
        for &p in percentiles {
            if !(0.0..=100.0).contains(&p) {
                return Err(invalid(format!("percentile {p} must be between 0 and 100")));
            }
            let rank = percentile_index(p, self.trials.len());
            let Some(trial) = self.trials.get(rank) else {
                continue;
            };
            picked.push(PercentileTrial {
                percentile: p,
                rank,
                average_asset_value: trial.average_asset_value(),
                final_asset_value: trial.final_asset_value(),
                trial: trial.clone(),
            });
        }

        Ok(SimulationSummary {
            trials: self.trials.len(),
            bankruptcy_rate: self.bankruptcy_rate(),
            percentiles: picked,
        })
    }
}

fn derive_seed(base_seed: u64, trial_index: u32) -> u64 {
    splitmix64(base_seed ^ ((trial_index as u64) << 32) ^ trial_index as u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
