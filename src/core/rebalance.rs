use super::market::{aligned_last_payment, unit_value};
use super::types::{Agent, Lot, MarketState, Security};

const LONG_TERM_HOLDING_YEARS: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BalanceOutcome {
    pub invested: f64,
    pub liquidated: f64,
    pub short_term_gain: f64,
    pub long_term_gain: f64,
}

pub fn balance_portfolio(
    agent: &mut Agent,
    market: &MarketState,
    as_of: f64,
    narrative: &mut Vec<String>,
) -> BalanceOutcome {
    agent
        .lots
        .sort_by(|a, b| a.purchase_time.total_cmp(&b.purchase_time));

    let mut outcome = BalanceOutcome::default();
    liquidate_oldest_lots(agent, market, as_of, narrative, &mut outcome);
    if agent.cash > agent.max_cash {
        invest_surplus(agent, market, as_of, narrative, &mut outcome);
    }
    outcome
}

fn liquidate_oldest_lots(
    agent: &mut Agent,
    market: &MarketState,
    as_of: f64,
    narrative: &mut Vec<String>,
    outcome: &mut BalanceOutcome,
) {
    let midpoint = agent.cash_midpoint();

    while agent.cash < agent.min_cash && !agent.lots.is_empty() {
        let lot = &mut agent.lots[0];
        let value = market
            .security(&lot.symbol)
            .map(|security| unit_value(lot, security, as_of, market.short_rate))
            .unwrap_or(0.0);

        let units_sold = units_to_sell(lot.units, midpoint - agent.cash, value);
        let proceeds = units_sold * value;
        let gain = proceeds - units_sold * lot.cost_basis_per_unit;
        if as_of - lot.purchase_time > LONG_TERM_HOLDING_YEARS {
            outcome.long_term_gain += gain;
        } else {
            outcome.short_term_gain += gain;
        }

        lot.units = (lot.units - units_sold).max(0.0);
        agent.cash += proceeds;
        outcome.liquidated += proceeds;
        narrative.push(format!(
            "Sold {units_sold} units of {} at ${value:.2} each.",
            lot.symbol
        ));

        if lot.units <= 0.0 {
            agent.lots.remove(0);
        }
    }
}

// Always sells at least one unit (or the fractional remainder) so the loop
// makes progress even when a single unit exceeds the sale target.
fn units_to_sell(available: f64, sale_target: f64, unit_value: f64) -> f64 {
    if unit_value <= 0.0 {
        return available;
    }
    let units = available.min(sale_target / unit_value).floor();
    if units >= 1.0 {
        units
    } else {
        available.min(1.0)
    }
}

fn invest_surplus(
    agent: &mut Agent,
    market: &MarketState,
    as_of: f64,
    narrative: &mut Vec<String>,
    outcome: &mut BalanceOutcome,
) {
    let stocks = market
        .securities
        .values()
        .filter(|s| s.is_stock())
        .collect::<Vec<_>>();
    let bonds = market
        .securities
        .values()
        .filter(|s| s.is_bond())
        .collect::<Vec<_>>();

    // a class with nothing to buy hands its share to the other class
    let stock_ratio = match (stocks.is_empty(), bonds.is_empty()) {
        (true, false) => 0.0,
        (false, true) => 1.0,
        _ => agent.stock_ratio,
    };
    let surplus = agent.cash - agent.cash_midpoint();
    let stock_budget = surplus * stock_ratio;
    let bond_budget = surplus - stock_budget;

    for (budget, candidates) in [(stock_budget, stocks), (bond_budget, bonds)] {
        if candidates.is_empty() || budget <= 0.0 {
            continue;
        }
        let allocation = budget / candidates.len() as f64;
        for security in candidates {
            let Some(lot) = purchase_lot(security, market.short_rate, allocation, as_of) else {
                continue;
            };
            let cost = lot.units * lot.cost_basis_per_unit;
            agent.cash -= cost;
            outcome.invested += cost;
            narrative.push(format!(
                "Purchased {} units of {} at ${:.2}.",
                lot.units, lot.symbol, lot.cost_basis_per_unit
            ));
            agent.lots.push(lot);
        }
    }
}

fn purchase_lot(security: &Security, short_rate: f64, allocation: f64, as_of: f64) -> Option<Lot> {
    let mut lot = Lot {
        symbol: security.symbol.clone(),
        units: 0.0,
        purchase_time: as_of,
        cost_basis_per_unit: 0.0,
        last_payment_time: aligned_last_payment(security, as_of),
    };

    let price = round_to_cents(unit_value(&lot, security, as_of, short_rate));
    if price <= 0.0 {
        return None;
    }
    let units = (allocation / price).floor();
    if units < 1.0 {
        return None;
    }

    lot.units = units;
    lot.cost_basis_per_unit = price;
    Some(lot)
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
