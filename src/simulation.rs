use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::{self, PathOutcome, SimulationResult, SummaryStats};
use crate::bootstrap::{ReturnGenerator, calibrate};
use crate::cashflow::{CashflowArrays, build_cashflow_arrays};
use crate::config::{Schedules, SimulationInput};
use crate::error::{SimError, SimResult};
use crate::regime::MarkovChain;
use crate::returns::{clamp_monthly_return, draw_monthly_shaped};
use crate::rng::{RandomSource, entropy_seed};
use crate::types::{Month, PathMatrix, Regime};

/// Random stream reserved for calibration and history synthesis. Paths use
/// streams `0..paths`.
const CALIBRATION_STREAM: u64 = u64::MAX;

/// Share of the progress range spent in the path loop; the rest covers
/// aggregation.
const PATH_LOOP_PROGRESS: f64 = 0.9;

/// Inflation spread is held to this share of the spread that would consume
/// the whole inflation variance.
const INFLATION_SPREAD_CAP: f64 = 0.8;

type ProgressFn = dyn Fn(f64) + Send + Sync;

/// Regime-conditioned monthly inflation. Crisis months run hotter and growth
/// months cooler, weighted so the long-run mean stays at `inflation_mean`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InflationModel {
    pub growth_mean: f64,
    pub crisis_mean: f64,
    pub std: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

impl InflationModel {
    pub fn new(input: &SimulationInput, growth_probability: f64) -> Self {
        let crisis_probability = 1.0 - growth_probability;
        let weight = growth_probability * crisis_probability;
        let max_spread = if weight > 0.0 {
            (input.inflation_variability.powi(2) / weight).sqrt()
        } else {
            0.0
        };
        let spread = input.inflation_crisis_spread.max(0.0).min(max_spread * INFLATION_SPREAD_CAP);

        InflationModel {
            growth_mean: input.inflation_mean - crisis_probability * spread,
            crisis_mean: input.inflation_mean + growth_probability * spread,
            std: input.inflation_variability,
            skewness: input.inflation_skewness,
            kurtosis: input.inflation_kurtosis,
        }
    }

    pub fn mean(&self, regime: Regime) -> f64 {
        regime.select(self.growth_mean, self.crisis_mean)
    }

    pub fn draw(&self, regime: Regime, rng: &mut RandomSource) -> f64 {
        clamp_monthly_return(draw_monthly_shaped(
            self.mean(regime),
            self.std,
            self.skewness,
            self.kurtosis,
            rng,
        ))
    }
}

/// Read-only state shared by every path of one run.
struct PathContext<'a> {
    generator: &'a ReturnGenerator,
    chain: MarkovChain,
    inflation: InflationModel,
    cashflows: &'a CashflowArrays,
    starting_balance: f64,
    tax_rate: f64,
    fee_factor: f64,
    retire_index: usize,
}

impl PathContext<'_> {
    /// Run one path, writing its real balance and real growth factor for every
    /// month into the supplied rows.
    fn simulate_path(
        &self,
        rng: &mut RandomSource,
        balances: &mut [f64],
        growth: &mut [f64],
    ) -> PathOutcome {
        let months = balances.len();
        let mut regime = self.chain.initial_state(rng);
        let mut sampler = self.generator.sampler(regime, rng);

        let mut balance = self.starting_balance;
        let mut depleted = false;
        let mut depleted_months = 0;
        let mut shortfall = 0.0;
        let mut year_return = 0.0;
        let mut year_inflation = 0.0;
        let mut annual_real_returns = Vec::with_capacity(months / 12 + 1);

        for m in 0..months {
            let month = Month(m as u32);
            let regime_changed = if m == 0 {
                true
            } else {
                let next = self.chain.transition(regime, rng);
                let changed = next != regime;
                regime = next;
                changed
            };

            let asset_return = clamp_monthly_return(sampler.next(month, regime, regime_changed, rng));
            let after_tax = if asset_return > 0.0 {
                asset_return * (1.0 - self.tax_rate)
            } else {
                asset_return
            };
            let portfolio_growth = (1.0 + after_tax) * self.fee_factor;
            let inflation = self.inflation.draw(regime, rng);

            year_return = (1.0 + year_return) * portfolio_growth - 1.0;
            year_inflation = (1.0 + year_inflation) * (1.0 + inflation) - 1.0;

            balance += self.cashflows.monthly_net_flow[m] + self.cashflows.lump_sum_by_month[m];
            balance *= portfolio_growth;
            balance /= 1.0 + inflation;
            growth[m] = portfolio_growth / (1.0 + inflation);

            if balance <= 0.0 {
                shortfall += -balance;
                depleted = true;
                balance = 0.0;
            }
            if balance == 0.0 {
                depleted_months += 1;
            }

            if month.closes_year() || m == months - 1 {
                annual_real_returns.push((1.0 + year_return) / (1.0 + year_inflation).max(1e-4) - 1.0);
                year_return = 0.0;
                year_inflation = 0.0;
            }

            balances[m] = balance;
        }

        PathOutcome {
            final_balance: balance,
            retire_balance: balances[self.retire_index],
            depleted,
            depleted_months,
            shortfall,
            annual_real_returns,
        }
    }
}

/// Everything a run returns to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutput {
    pub simulation: SimulationResult,
    pub stats: SummaryStats,
    /// Paths actually simulated (never below the floor).
    pub sim_count: usize,
    /// Seed the run used; re-running with it reproduces the output exactly.
    pub seed: u64,
}

/// A validated Monte Carlo run, ready to execute.
pub struct Simulation {
    input: SimulationInput,
    schedules: Schedules,
    months: u32,
    retire_month: u32,
    progress: Option<Box<ProgressFn>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Simulation {
    /// Validate the request and build a run. Nothing is sampled until
    /// [`Simulation::run`].
    pub fn from_input(
        input: SimulationInput,
        schedules: Schedules,
        months: u32,
        retire_month: u32,
    ) -> SimResult<Self> {
        input.validate(&schedules, months, retire_month)?;
        Ok(Simulation { input, schedules, months, retire_month, progress: None, cancel: None })
    }

    /// Report fraction complete (0.0 to 1.0) during the run. May be called
    /// from several worker threads.
    pub fn with_progress(mut self, callback: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Stop early once `flag` is set. Checked before each path starts.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn report(&self, fraction: f64) {
        if let Some(callback) = &self.progress {
            callback(fraction);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    pub fn run(&self) -> SimResult<SimulationOutput> {
        let seed = self.input.seed.unwrap_or_else(|| {
            let seed = entropy_seed();
            info!("no seed supplied; using {seed}");
            seed
        });
        let paths = self.input.path_count();
        let months = self.months as usize;
        info!("simulating {paths} paths over {months} months (seed {seed})");
        self.report(0.0);

        let mut calibration_rng = RandomSource::for_stream(seed, CALIBRATION_STREAM);
        let calibration = calibrate(&self.input, &mut calibration_rng);
        let cashflows = build_cashflow_arrays(
            &self.input,
            &self.schedules.spending_periods,
            &self.schedules.income_sources,
            &self.schedules.lump_sum_events,
            self.months,
        );
        let inflation =
            InflationModel::new(&self.input, calibration.chain.growth_stationary_probability());
        let regimes = &calibration.params;
        debug!(
            "regimes: growth {:.4}±{:.4} crisis {:.4}±{:.4}; inflation means: growth={:.4} crisis={:.4}",
            regimes.growth_mean,
            regimes.growth_std,
            regimes.crisis_mean,
            regimes.crisis_std,
            inflation.growth_mean,
            inflation.crisis_mean
        );

        let context = PathContext {
            generator: &calibration.generator,
            chain: calibration.chain,
            inflation,
            cashflows: &cashflows,
            starting_balance: self.input.current_savings,
            tax_rate: self.input.tax_on_gains_rate.clamp(0.0, 1.0),
            fee_factor: (1.0 - self.input.annual_fee_rate.clamp(0.0, 1.0) / 12.0).max(0.0),
            retire_index: (self.retire_month as usize).saturating_sub(1).min(months - 1),
        };

        let mut balances = PathMatrix::filled(paths, months, 0.0);
        let mut growth_factors = PathMatrix::filled(paths, months, 1.0);
        let completed = AtomicUsize::new(0);
        let progress_step = (paths / 100).max(1);

        let outcomes: Vec<Option<PathOutcome>> = balances
            .as_mut_slice()
            .par_chunks_mut(months)
            .zip(growth_factors.as_mut_slice().par_chunks_mut(months))
            .enumerate()
            .map(|(path, (balance_row, growth_row))| {
                if self.is_cancelled() {
                    return None;
                }
                let mut rng = RandomSource::for_stream(seed, path as u64);
                let outcome = context.simulate_path(&mut rng, balance_row, growth_row);

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % progress_step == 0 {
                    self.report(PATH_LOOP_PROGRESS * done as f64 / paths as f64);
                }
                Some(outcome)
            })
            .collect();

        let Some(outcomes) = outcomes.into_iter().collect::<Option<Vec<PathOutcome>>>() else {
            let completed = completed.load(Ordering::Relaxed);
            warn!("run cancelled after {completed} of {paths} paths");
            return Err(SimError::Cancelled { completed, requested: paths });
        };
        self.report(PATH_LOOP_PROGRESS);

        let (simulation, stats) = analysis::aggregate(
            &self.input,
            &self.schedules,
            self.retire_month,
            &outcomes,
            &balances,
            &growth_factors,
            calibration.moments,
        );
        info!(
            "success probability {:.1}%, FI target (P95) {:.0}",
            stats.success_probability * 100.0,
            stats.fi_target_p95
        );
        self.report(1.0);

        Ok(SimulationOutput { simulation, stats, sim_count: paths, seed })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{SimulationMode, SpendingPeriod};

    fn small_input() -> SimulationInput {
        let mut input = SimulationInput::canonical();
        input.current_age = 60.0;
        input.retirement_age = 62.0;
        input.simulate_until_age = 70.0;
        input.current_savings = 500_000.0;
        input.simulations = 400;
        input.seed = Some(7);
        input
    }

    fn spending(yearly_amount: f64) -> Schedules {
        Schedules {
            spending_periods: vec![SpendingPeriod {
                id: "sp".to_string(),
                label: "Spending".to_string(),
                from_age: 60.0,
                to_age: 70.0,
                yearly_amount,
                inflation_adjusted: true,
            }],
            ..Schedules::default()
        }
    }

    fn run(input: SimulationInput, schedules: Schedules) -> SimulationOutput {
        let months = input.horizon_months();
        let retire_month = input.retire_month();
        Simulation::from_input(input, schedules, months, retire_month)
            .expect("valid input")
            .run()
            .expect("run completes")
    }

    #[test]
    fn seeded_run_is_reproducible() {
        let a = run(small_input(), spending(20_000.0));
        let b = run(small_input(), spending(20_000.0));
        assert_eq!(a, b, "same seed must produce identical output");
    }

    #[test]
    fn unseeded_run_replays_from_reported_seed() {
        let mut input = small_input();
        input.seed = None;
        input.historical_monthly_returns =
            (0..120).map(|i| 0.005 + 0.04 * ((i as f64) * 0.61).sin()).collect();
        let first = run(input.clone(), spending(20_000.0));

        input.seed = Some(first.seed);
        let replay = run(input, spending(20_000.0));
        assert_eq!(replay.seed, first.seed);
        assert_eq!(replay.simulation, first.simulation);
        assert_eq!(replay.stats, first.stats);
    }

    #[test]
    fn different_seeds_differ() {
        let a = run(small_input(), spending(20_000.0));
        let mut input = small_input();
        input.seed = Some(8);
        let b = run(input, spending(20_000.0));
        assert_ne!(a.simulation.percentiles.p50, b.simulation.percentiles.p50);
    }

    #[test]
    fn output_shape_matches_horizon() {
        let out = run(small_input(), spending(20_000.0));
        assert_eq!(out.sim_count, 400);
        assert_eq!(out.seed, 7);
        assert_eq!(out.simulation.months, 120);
        assert_eq!(out.simulation.retire_month, 24);
        assert_eq!(out.simulation.ages.len(), 120);
        assert_eq!(out.simulation.percentiles.p50.len(), 120);
        assert_eq!(out.simulation.ages[12], 61.0);
        let stats = &out.stats;
        assert!((0.0..=1.0).contains(&stats.success_probability));
        assert!((0.0..=1.0).contains(&stats.fi_probability_p95));
        assert_eq!(stats.sequence_risk.len(), 5);
        assert_eq!(stats.ruin_surface.spending_multipliers.len(), 5);
    }

    #[test]
    fn percentile_bands_are_ordered() {
        let out = run(small_input(), spending(30_000.0));
        let p = &out.simulation.percentiles;
        for m in 0..p.p50.len() {
            assert!(p.p10[m] <= p.p25[m] && p.p25[m] <= p.p50[m]);
            assert!(p.p50[m] <= p.p75[m] && p.p75[m] <= p.p90[m]);
        }
    }

    #[test]
    fn well_funded_scenario_survives() {
        let out = run(small_input(), spending(10_000.0));
        assert!(out.stats.final_median > 0.0);
        assert!(out.stats.success_probability > 0.9);
    }

    #[test]
    fn overspending_scenario_depletes() {
        let out = run(small_input(), spending(400_000.0));
        assert_eq!(out.stats.final_median, 0.0);
        assert!(out.stats.success_probability < 0.05);
        assert!(out.stats.shortfall_median > 0.0);
        assert!(out.stats.depleted_years_median > 0.0);
    }

    #[test]
    fn ruin_rises_with_spending() {
        let out = run(small_input(), spending(45_000.0));
        let surface = &out.stats.ruin_surface;
        for age in 0..surface.retirement_ages.len() {
            let lowest = surface.ruin_probabilities[0][age];
            let highest = surface.ruin_probabilities[surface.spending_multipliers.len() - 1][age];
            assert!(lowest <= highest, "ruin must not fall as spending rises");
        }
    }

    #[test]
    fn targeted_history_run_completes() {
        let mut input = small_input();
        input.mode = SimulationMode::HistoricalTargeted;
        input.historical_monthly_returns =
            (0..240).map(|i| 0.006 + 0.03 * ((i as f64) * 0.9).sin()).collect();
        let out = run(input, spending(20_000.0));
        assert!((out.stats.return_moments.arithmetic_mean - 0.07).abs() < 0.05);
    }

    #[test]
    fn invalid_input_is_rejected_before_running() {
        let mut input = small_input();
        input.retirement_age = 55.0;
        let result = Simulation::from_input(input, spending(20_000.0), 120, 24);
        assert!(matches!(result, Err(SimError::InvalidInput { field: "retirementAge", .. })));
    }

    #[test]
    fn progress_reports_start_and_end() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let input = small_input();
        let months = input.horizon_months();
        let retire_month = input.retire_month();
        Simulation::from_input(input, spending(20_000.0), months, retire_month)
            .expect("valid input")
            .with_progress(move |p| sink.lock().expect("progress lock").push(p))
            .run()
            .expect("run completes");

        let seen = seen.lock().expect("progress lock");
        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen.contains(&PATH_LOOP_PROGRESS));
        assert!(seen.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn cancelled_run_returns_error() {
        let flag = Arc::new(AtomicBool::new(true));
        let input = small_input();
        let result = Simulation::from_input(input, spending(20_000.0), 120, 24)
            .expect("valid input")
            .with_cancel_flag(flag)
            .run();
        assert!(matches!(result, Err(SimError::Cancelled { completed: 0, requested: 400 })));
    }

    #[test]
    fn inflation_means_preserve_long_run_average() {
        let input = SimulationInput::canonical();
        let pi_g = 0.6;
        let model = InflationModel::new(&input, pi_g);
        let long_run = pi_g * model.growth_mean + (1.0 - pi_g) * model.crisis_mean;
        assert!((long_run - input.inflation_mean).abs() < 1e-12);
        assert!(model.crisis_mean > model.growth_mean);
    }

    #[test]
    fn negative_inflation_spread_is_ignored() {
        let mut input = SimulationInput::canonical();
        input.inflation_crisis_spread = -0.02;
        let model = InflationModel::new(&input, 0.7);
        assert_eq!(model.growth_mean, input.inflation_mean);
        assert_eq!(model.crisis_mean, input.inflation_mean);
    }

    #[test]
    fn inflation_spread_is_capped() {
        let mut input = SimulationInput::canonical();
        input.inflation_variability = 0.001;
        input.inflation_crisis_spread = 0.5;
        let model = InflationModel::new(&input, 0.5);
        let max_spread = (0.001_f64.powi(2) / 0.25).sqrt();
        assert!((model.crisis_mean - model.growth_mean - 0.8 * max_spread).abs() < 1e-12);
    }
}
