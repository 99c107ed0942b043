use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

use crate::core::{
    AgentProfile, BondTerms, MarketState, Security, SeedLot, SimError, SimResult,
    SimulationConfig, SimulationSummary, StockTerms, TaxCode, VasicekParams, run_simulation,
};

const SECONDS_PER_YEAR: f64 = 365.2425 * 86_400.0;
const DAYS_PER_YEAR: f64 = 365.0;

/// Query strings carry percentiles as `percentiles=10,50,90`; JSON bodies may
/// use either that form or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PercentileList {
    Many(Vec<f64>),
    Joined(String),
}

impl PercentileList {
    fn into_values(self) -> SimResult<Vec<f64>> {
        match self {
            PercentileList::Many(values) => Ok(values),
            PercentileList::Joined(raw) => raw
                .split(',')
                .map(|part| {
                    part.trim()
                        .parse::<f64>()
                        .map_err(|_| invalid_flag("percentiles must be numbers between 0 and 100"))
                })
                .collect(),
        }
    }
}

/// `config` is only accepted in POST bodies; GET takes the scalar fields.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    config: Option<SimulationConfig>,
    percentiles: Option<PercentileList>,

    start_age: Option<f64>,
    cash: Option<f64>,
    min_cash: Option<f64>,
    max_cash: Option<f64>,
    earnings: Option<f64>,
    expenses: Option<f64>,
    healthcare: Option<f64>,
    social_security: Option<f64>,
    stock_ratio: Option<f64>,
    spy_units: Option<f64>,
    ust_units: Option<f64>,

    spy_price: Option<f64>,
    spy_return: Option<f64>,
    spy_volatility: Option<f64>,
    spy_dividend: Option<f64>,
    spy_payments_per_year: Option<u32>,
    bond_face_value: Option<f64>,
    bond_coupon: Option<f64>,
    bond_frequency: Option<u32>,
    bond_duration: Option<f64>,
    inflation_rate: Option<f64>,
    interest_rate: Option<f64>,
    interest_volatility: Option<f64>,
    vasicek_speed: Option<f64>,
    vasicek_rate: Option<f64>,

    trials: Option<u32>,
    step_days: Option<f64>,
    record_days: Option<f64>,
    horizon_years: Option<f64>,
    start_time: Option<f64>,
    seed: Option<u64>,
}

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Monte Carlo investor simulator (cash band rebalancing, stocks + bonds, annual taxes)"
)]
struct Cli {
    #[arg(
        long,
        help = "Load a complete simulation config from a JSON file; market and agent flags are ignored"
    )]
    config: Option<PathBuf>,
    #[arg(
        long = "percentile",
        default_values_t = [10.0, 50.0, 90.0],
        help = "Ranked trial percentile to report, repeatable"
    )]
    percentiles: Vec<f64>,
    #[arg(long, help = "Print the summary as JSON")]
    json: bool,

    #[arg(long, default_value_t = 35.0)]
    start_age: f64,
    #[arg(long, default_value_t = 20_000.0)]
    cash: f64,
    #[arg(long, default_value_t = 10_000.0, help = "Sell holdings when cash drops below this")]
    min_cash: f64,
    #[arg(long, default_value_t = 40_000.0, help = "Invest surplus when cash exceeds this")]
    max_cash: f64,
    #[arg(long, default_value_t = 80_000.0, help = "Annual earnings")]
    earnings: f64,
    #[arg(long, default_value_t = 45_000.0, help = "Annual living expenses")]
    expenses: f64,
    #[arg(long, default_value_t = 5_000.0, help = "Annual healthcare cost until 65")]
    healthcare: f64,
    #[arg(long, default_value_t = 20_000.0, help = "Annual social security from 67")]
    social_security: f64,
    #[arg(
        long,
        default_value_t = 70.0,
        help = "Share of invested surplus going to stocks in percent"
    )]
    stock_ratio: f64,
    #[arg(long, default_value_t = 100.0)]
    spy_units: f64,
    #[arg(long, default_value_t = 10.0)]
    ust_units: f64,

    #[arg(long, default_value_t = 289.0)]
    spy_price: f64,
    #[arg(long, default_value_t = 5.0, help = "Expected annual SPY return in percent")]
    spy_return: f64,
    #[arg(long, default_value_t = 20.0, help = "SPY annual volatility in percent")]
    spy_volatility: f64,
    #[arg(long, default_value_t = 1.43, help = "SPY dividend per unit per payment")]
    spy_dividend: f64,
    #[arg(long, default_value_t = 4)]
    spy_payments_per_year: u32,
    #[arg(long, default_value_t = 1_000.0)]
    bond_face_value: f64,
    #[arg(long, default_value_t = 25.0, help = "UST coupon per unit per payment")]
    bond_coupon: f64,
    #[arg(long, default_value_t = 2, help = "UST coupon payments per year")]
    bond_frequency: u32,
    #[arg(long, default_value_t = 10.0, help = "UST time to maturity in years")]
    bond_duration: f64,
    #[arg(long, default_value_t = 2.0, help = "Annual inflation in percent")]
    inflation_rate: f64,
    #[arg(long, default_value_t = 3.0, help = "Starting short rate in percent")]
    interest_rate: f64,
    #[arg(long, default_value_t = 1.0, help = "Short rate volatility in percent")]
    interest_volatility: f64,
    #[arg(long, default_value_t = 1.75, help = "Vasicek mean reversion speed")]
    vasicek_speed: f64,
    #[arg(long, default_value_t = 7.5, help = "Vasicek long-run short rate in percent")]
    vasicek_rate: f64,

    #[arg(long, default_value_t = 1_000)]
    trials: u32,
    #[arg(long, default_value_t = 7.0, help = "Simulation time step in days")]
    step_days: f64,
    #[arg(long, default_value_t = 365.0, help = "Days between recorded samples")]
    record_days: f64,
    #[arg(long, default_value_t = 40.0)]
    horizon_years: f64,
    #[arg(
        long,
        help = "Start time as a fractional calendar year, defaults to now"
    )]
    start_time: Option<f64>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Debug)]
struct ApiRequest {
    config: SimulationConfig,
    percentiles: Vec<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    start_time: f64,
    horizon_years: f64,
    seed: u64,
    #[serde(flatten)]
    summary: SimulationSummary,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn invalid_flag(msg: &str) -> SimError {
    SimError::InvalidConfig(msg.to_string())
}

fn check_percentiles(percentiles: &[f64]) -> SimResult<()> {
    if percentiles.is_empty() {
        return Err(invalid_flag("at least one --percentile is required"));
    }
    if percentiles.iter().any(|p| !(0.0..=100.0).contains(p)) {
        return Err(invalid_flag("--percentile must be between 0 and 100"));
    }
    Ok(())
}

pub fn current_year_fraction() -> f64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    1970.0 + secs / SECONDS_PER_YEAR
}

fn load_config_file(path: &Path) -> SimResult<SimulationConfig> {
    let raw = fs::read_to_string(path)?;
    let config = serde_json::from_str::<SimulationConfig>(&raw)?;
    config.validate()?;
    Ok(config)
}

fn build_config(cli: Cli) -> SimResult<SimulationConfig> {
    if let Some(path) = &cli.config {
        return load_config_file(path);
    }

    if cli.trials == 0 {
        return Err(invalid_flag("--trials must be > 0"));
    }

    if !cli.step_days.is_finite() || cli.step_days <= 0.0 {
        return Err(invalid_flag("--step-days must be > 0"));
    }

    if !cli.record_days.is_finite() || cli.record_days <= 0.0 {
        return Err(invalid_flag("--record-days must be > 0"));
    }

    if cli.spy_payments_per_year == 0 {
        return Err(invalid_flag("--spy-payments-per-year must be > 0"));
    }

    if cli.bond_frequency == 0 {
        return Err(invalid_flag("--bond-frequency must be > 0"));
    }

    if !(0.0..=100.0).contains(&cli.stock_ratio) {
        return Err(invalid_flag("--stock-ratio must be between 0 and 100"));
    }

    if cli.min_cash > cli.max_cash {
        return Err(invalid_flag("--min-cash cannot exceed --max-cash"));
    }

    if cli.spy_units < 0.0 || cli.ust_units < 0.0 {
        return Err(invalid_flag("--spy-units and --ust-units must be >= 0"));
    }

    let mut securities = BTreeMap::new();
    securities.insert(
        "SPY".to_string(),
        Security::stock(
            "SPY",
            StockTerms {
                price: cli.spy_price,
                expected_return: cli.spy_return / 100.0,
                volatility: cli.spy_volatility / 100.0,
                dividend_per_unit: cli.spy_dividend,
            },
            1.0 / cli.spy_payments_per_year as f64,
        ),
    );
    securities.insert(
        "UST".to_string(),
        Security::bond(
            "UST",
            BondTerms {
                face_value: cli.bond_face_value,
                coupon_per_unit: cli.bond_coupon,
                duration_years: cli.bond_duration,
            },
            1.0 / cli.bond_frequency as f64,
        ),
    );

    let mut lots = Vec::new();
    if cli.spy_units > 0.0 {
        lots.push(SeedLot {
            symbol: "SPY".to_string(),
            units: cli.spy_units,
            cost_basis_per_unit: cli.spy_price,
            purchase_time: None,
        });
    }
    if cli.ust_units > 0.0 {
        lots.push(SeedLot {
            symbol: "UST".to_string(),
            units: cli.ust_units,
            cost_basis_per_unit: cli.bond_face_value,
            purchase_time: None,
        });
    }

    let config = SimulationConfig {
        agent: AgentProfile {
            age: cli.start_age,
            cash: cli.cash,
            min_cash: cli.min_cash,
            max_cash: cli.max_cash,
            earnings: cli.earnings,
            expenses: cli.expenses,
            healthcare: cli.healthcare,
            social_security: cli.social_security,
            stock_ratio: cli.stock_ratio / 100.0,
            lots,
        },
        market: MarketState {
            securities,
            short_rate: cli.interest_rate / 100.0,
            vasicek: VasicekParams {
                speed: cli.vasicek_speed,
                long_run_mean: cli.vasicek_rate / 100.0,
                volatility: cli.interest_volatility / 100.0,
            },
            inflation_rate: cli.inflation_rate / 100.0,
        },
        trials: cli.trials,
        time_step_years: cli.step_days / DAYS_PER_YEAR,
        record_interval_years: cli.record_days / DAYS_PER_YEAR,
        horizon_years: cli.horizon_years,
        start_time: cli.start_time.unwrap_or_else(current_year_fraction),
        seed: cli.seed,
        tax_code: TaxCode::default(),
    };
    config.validate()?;
    Ok(config)
}

fn simulate_summary(config: &SimulationConfig, percentiles: &[f64]) -> SimResult<SimulationSummary> {
    run_simulation(config)?.summarize(percentiles)
}

pub fn run_cli() -> SimResult<()> {
    let cli = Cli::parse();
    let percentiles = cli.percentiles.clone();
    let as_json = cli.json;
    check_percentiles(&percentiles)?;

    let config = build_config(cli)?;
    let summary = simulate_summary(&config, &percentiles)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &SimulationSummary) {
    println!(
        "{} trials, {:.1}% ended bankrupt",
        summary.trials,
        summary.bankruptcy_rate * 100.0
    );
    for picked in &summary.percentiles {
        println!();
        println!(
            "{}th percentile (trial {}, rank {}): average ${:.2}, final ${:.2}",
            picked.percentile,
            picked.trial.trial_index,
            picked.rank,
            picked.average_asset_value,
            picked.final_asset_value
        );
        for sample in &picked.trial.samples {
            println!(
                "  {:>9.3}  age {:>5.1}  total ${:>14.2}  cash ${:>12.2}  stocks ${:>14.2}  bonds ${:>12.2}  taxes ${:>10.2}",
                sample.time,
                sample.age,
                sample.total_asset_value,
                sample.cash,
                sample.stock_value,
                sample.bond_value,
                sample.accrued.taxes
            );
            for line in &sample.narrative {
                println!("      {line}");
            }
        }
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    println!("nestegg HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/api/simulate");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let joined = tokio::task::spawn_blocking(move || {
        simulate_summary(&request.config, &request.percentiles)
            .map(|summary| build_simulate_response(&request.config, summary))
    })
    .await;

    match joined {
        Ok(Ok(response)) => {
            info!(
                "served {} trials, bankruptcy rate {:.3}",
                response.summary.trials, response.summary.bankruptcy_rate
            );
            json_response(StatusCode::OK, response)
        }
        Ok(Err(err)) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Err(err) => {
            error!("simulation task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> SimResult<ApiRequest> {
    let payload = serde_json::from_str::<SimulatePayload>(json)?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> SimResult<ApiRequest> {
    let percentiles = match payload.percentiles {
        Some(list) => list.into_values()?,
        None => vec![10.0, 50.0, 90.0],
    };
    check_percentiles(&percentiles)?;

    if let Some(config) = payload.config {
        config.validate()?;
        return Ok(ApiRequest {
            config,
            percentiles,
        });
    }

    let mut cli = default_cli_for_api();

    if let Some(v) = payload.start_age {
        cli.start_age = v;
    }
    if let Some(v) = payload.cash {
        cli.cash = v;
    }
    if let Some(v) = payload.min_cash {
        cli.min_cash = v;
    }
    if let Some(v) = payload.max_cash {
        cli.max_cash = v;
    }
    if let Some(v) = payload.earnings {
        cli.earnings = v;
    }
    if let Some(v) = payload.expenses {
        cli.expenses = v;
    }
    if let Some(v) = payload.healthcare {
        cli.healthcare = v;
    }
    if let Some(v) = payload.social_security {
        cli.social_security = v;
    }
    if let Some(v) = payload.stock_ratio {
        cli.stock_ratio = v;
    }
    if let Some(v) = payload.spy_units {
        cli.spy_units = v;
    }
    if let Some(v) = payload.ust_units {
        cli.ust_units = v;
    }

    if let Some(v) = payload.spy_price {
        cli.spy_price = v;
    }
    if let Some(v) = payload.spy_return {
        cli.spy_return = v;
    }
    if let Some(v) = payload.spy_volatility {
        cli.spy_volatility = v;
    }
    if let Some(v) = payload.spy_dividend {
        cli.spy_dividend = v;
    }
    if let Some(v) = payload.spy_payments_per_year {
        cli.spy_payments_per_year = v;
    }
    if let Some(v) = payload.bond_face_value {
        cli.bond_face_value = v;
    }
    if let Some(v) = payload.bond_coupon {
        cli.bond_coupon = v;
    }
    if let Some(v) = payload.bond_frequency {
        cli.bond_frequency = v;
    }
    if let Some(v) = payload.bond_duration {
        cli.bond_duration = v;
    }
    if let Some(v) = payload.inflation_rate {
        cli.inflation_rate = v;
    }
    if let Some(v) = payload.interest_rate {
        cli.interest_rate = v;
    }
    if let Some(v) = payload.interest_volatility {
        cli.interest_volatility = v;
    }
    if let Some(v) = payload.vasicek_speed {
        cli.vasicek_speed = v;
    }
    if let Some(v) = payload.vasicek_rate {
        cli.vasicek_rate = v;
    }

    if let Some(v) = payload.trials {
        cli.trials = v;
    }
    if let Some(v) = payload.step_days {
        cli.step_days = v;
    }
    if let Some(v) = payload.record_days {
        cli.record_days = v;
    }
    if let Some(v) = payload.horizon_years {
        cli.horizon_years = v;
    }
    if payload.start_time.is_some() {
        cli.start_time = payload.start_time;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }

    let config = build_config(cli)?;
    Ok(ApiRequest {
        config,
        percentiles,
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        config: None,
        percentiles: vec![10.0, 50.0, 90.0],
        json: true,
        start_age: 35.0,
        cash: 20_000.0,
        min_cash: 10_000.0,
        max_cash: 40_000.0,
        earnings: 80_000.0,
        expenses: 45_000.0,
        healthcare: 5_000.0,
        social_security: 20_000.0,
        stock_ratio: 70.0,
        spy_units: 100.0,
        ust_units: 10.0,
        spy_price: 289.0,
        spy_return: 5.0,
        spy_volatility: 20.0,
        spy_dividend: 1.43,
        spy_payments_per_year: 4,
        bond_face_value: 1_000.0,
        bond_coupon: 25.0,
        bond_frequency: 2,
        bond_duration: 10.0,
        inflation_rate: 2.0,
        interest_rate: 3.0,
        interest_volatility: 1.0,
        vasicek_speed: 1.75,
        vasicek_rate: 7.5,
        trials: 500,
        step_days: 7.0,
        record_days: 365.0,
        horizon_years: 40.0,
        start_time: None,
        seed: 42,
    }
}

fn build_simulate_response(config: &SimulationConfig, summary: SimulationSummary) -> SimulateResponse {
    SimulateResponse {
        start_time: config.start_time,
        horizon_years: config.horizon_years,
        seed: config.seed,
        summary,
    }
}
