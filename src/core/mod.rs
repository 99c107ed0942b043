mod config;
mod engine;
mod error;
mod market;
mod payments;
mod rebalance;
mod tax;
mod types;

pub use config::{AgentProfile, SeedLot, SimulationConfig, TrialSchedule, start_agent};
pub use engine::{
    percentile_index, run_simulation, run_simulation_with_cancel, run_trial, step_count,
};
pub use error::{SimError, SimResult};
pub use market::{
    Valuation, aligned_last_payment, bond_unit_value, calendar_year, payment_reference_time,
    portfolio_valuation, unit_value,
};
pub use payments::{Payments, collect_payments};
pub use rebalance::{BalanceOutcome, balance_portfolio};
pub use tax::{TaxBill, TaxBracket, TaxCode, TaxSchedule, settle_tax_year};
pub use types::{
    AccrualBucket, Agent, BondTerms, Lot, MarketState, PercentileTrial, RankedTrials, Sample,
    Security, SecurityKind, SimulationSummary, StockTerms, TIME_EPSILON, TrialRecord,
    VasicekParams,
};
