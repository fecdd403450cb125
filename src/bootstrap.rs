use log::{debug, info, warn};

use crate::config::SimulationInput;
use crate::regime::{
    DetectorParams, MarkovChain, RegimeParams, detect_annual_regimes, detect_monthly_regimes,
};
use crate::returns::{
    MeanStd, ReturnMoments, annual_to_monthly_return, apply_moment_targeting, clamp_annual_return,
    clamp_monthly_return, draw_monthly_shaped, draw_student_t, monthly_to_annual_series,
    student_t_degrees_from_kurtosis,
};
use crate::rng::RandomSource;
use crate::types::{Month, Regime};

/// Length of the synthesized annual series used when no usable history exists.
pub const SYNTHETIC_HISTORY_YEARS: usize = 120;

/// Per-regime resampling pools. Built once per run and shared read-only by
/// every path.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimePools<T> {
    pub growth: Vec<T>,
    pub crisis: Vec<T>,
}

impl<T> RegimePools<T> {
    pub fn for_regime(&self, regime: Regime) -> &[T] {
        regime.select(&self.growth, &self.crisis)
    }

    fn draw(&self, regime: Regime, rng: &mut RandomSource) -> Option<&T> {
        let pool = self.for_regime(regime);
        if pool.is_empty() {
            return None;
        }
        pool.get(rng.index(pool.len()))
    }
}

fn split_by_label<T: Copy>(items: impl Iterator<Item = T>, labels: &[Regime]) -> RegimePools<T> {
    let mut growth = Vec::new();
    let mut crisis = Vec::new();
    for (item, label) in items.zip(labels) {
        match label {
            Regime::Growth => growth.push(item),
            Regime::Crisis => crisis.push(item),
        }
    }
    RegimePools { growth, crisis }
}

/// Partition annual returns by regime label.
///
/// An empty growth pool falls back to the whole series; an empty crisis pool
/// falls back to the worst `max(4, ⌊0.35·n⌋)` years.
pub fn annual_pools(annual_returns: &[f64], labels: &[Regime]) -> RegimePools<f64> {
    let mut pools = split_by_label(annual_returns.iter().copied(), labels);
    if pools.growth.is_empty() {
        pools.growth = annual_returns.to_vec();
    }
    if pools.crisis.is_empty() {
        let mut sorted = annual_returns.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let take = 4.max((annual_returns.len() as f64 * 0.35).floor() as usize);
        sorted.truncate(take);
        pools.crisis = sorted;
    }
    pools
}

/// Partition monthly observation indices by regime label. Indices rather than
/// values so a block can continue sequentially from its start.
///
/// An empty growth pool falls back to every index; an empty crisis pool to the
/// indices of the worst `max(12, ⌊0.30·n⌋)` months.
pub fn monthly_index_pools(monthly_returns: &[f64], labels: &[Regime]) -> RegimePools<usize> {
    let mut pools = split_by_label(0..monthly_returns.len(), labels);
    if pools.growth.is_empty() {
        pools.growth = (0..monthly_returns.len()).collect();
    }
    if pools.crisis.is_empty() {
        let mut indices: Vec<usize> = (0..monthly_returns.len()).collect();
        indices.sort_by(|&a, &b| monthly_returns[a].total_cmp(&monthly_returns[b]));
        let take = 12.max((monthly_returns.len() as f64 * 0.30).floor() as usize);
        indices.truncate(take);
        pools.crisis = indices;
    }
    pools
}

/// Synthesize an annual return series from the regime model: regime-switching
/// Student-t draws (df from kurtosis) plus a skewness shift, clamped to the
/// annual bounds.
pub fn synthesize_annual_history(
    params: &RegimeParams,
    skewness: f64,
    kurtosis: f64,
    years: usize,
    rng: &mut RandomSource,
) -> Vec<f64> {
    let df = student_t_degrees_from_kurtosis(kurtosis);
    let skew_shift = skewness.clamp(-2.0, 2.0) * 0.12;

    let mut series = Vec::with_capacity(years);
    let mut state = params.chain.initial_state(rng);
    for year in 0..years {
        if year > 0 {
            state = params.chain.transition(state, rng);
        }
        let draw = draw_student_t(df, rng) + skew_shift;
        series.push(clamp_annual_return(params.mean(state) + params.std(state) * draw));
    }
    series
}

/// Monthly perturbation added on top of an annual bootstrap draw. Crisis
/// months drift towards the crisis mean and carry wider noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressNoise {
    pub crisis_drift: f64,
    pub growth_noise: f64,
    pub crisis_noise: f64,
    pub skewness: f64,
    pub kurtosis: f64,
}

impl StressNoise {
    pub fn new(params: &RegimeParams, skewness: f64, kurtosis: f64) -> Self {
        StressNoise {
            crisis_drift: (params.crisis_mean - params.growth_mean) * 0.1,
            growth_noise: params.growth_std * 0.04,
            crisis_noise: params.crisis_std * 0.08,
            skewness,
            kurtosis,
        }
    }

    pub fn draw(&self, regime: Regime, rng: &mut RandomSource) -> f64 {
        let drift = regime.select(0.0, self.crisis_drift);
        let noise = regime.select(self.growth_noise, self.crisis_noise);
        draw_monthly_shaped(drift, noise, self.skewness, self.kurtosis, rng)
    }
}

/// Annual regime pools plus the monthly noise applied between draws.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnualBootstrap {
    pub pools: RegimePools<f64>,
    pub noise: StressNoise,
}

/// How monthly asset returns are generated for the whole run. Chosen once
/// during calibration.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnGenerator {
    /// Block bootstrap over at least 120 months of history.
    MonthlyBlock {
        history: Vec<f64>,
        pools: RegimePools<usize>,
        block_length: usize,
    },
    /// Yearly draws from historical annual returns, perturbed monthly.
    AnnualBootstrap(AnnualBootstrap),
    /// Yearly draws from a synthesized annual series, perturbed monthly.
    Parametric(AnnualBootstrap),
}

impl ReturnGenerator {
    pub fn name(&self) -> &'static str {
        match self {
            ReturnGenerator::MonthlyBlock { .. } => "monthly-block-bootstrap",
            ReturnGenerator::AnnualBootstrap(_) => "annual-bootstrap",
            ReturnGenerator::Parametric(_) => "parametric",
        }
    }

    /// Per-path sampler starting in `initial` regime.
    pub fn sampler(&self, initial: Regime, rng: &mut RandomSource) -> ReturnSampler<'_> {
        let active_monthly = match self {
            ReturnGenerator::MonthlyBlock { .. } => 0.0,
            ReturnGenerator::AnnualBootstrap(annual) | ReturnGenerator::Parametric(annual) => {
                draw_annual_as_monthly(&annual.pools, initial, rng)
            }
        };
        ReturnSampler { generator: self, cursor: 0, block_remaining: 0, active_monthly }
    }
}

fn draw_annual_as_monthly(pools: &RegimePools<f64>, regime: Regime, rng: &mut RandomSource) -> f64 {
    pools.draw(regime, rng).map(|&r| annual_to_monthly_return(r)).unwrap_or(0.0)
}

/// Path-private cursor into a [`ReturnGenerator`].
pub struct ReturnSampler<'a> {
    generator: &'a ReturnGenerator,
    cursor: usize,
    block_remaining: usize,
    active_monthly: f64,
}

impl ReturnSampler<'_> {
    /// Monthly asset return for `month`, given the regime after this month's
    /// transition. `regime_changed` is true on month 0 and whenever the chain
    /// switched state.
    pub fn next(
        &mut self,
        month: Month,
        regime: Regime,
        regime_changed: bool,
        rng: &mut RandomSource,
    ) -> f64 {
        let generator = self.generator;
        match generator {
            ReturnGenerator::MonthlyBlock { history, pools, block_length } => {
                if self.block_remaining == 0 || regime_changed {
                    if let Some(&start) = pools.draw(regime, rng) {
                        self.cursor = start;
                    }
                    self.block_remaining = *block_length;
                } else {
                    self.cursor = (self.cursor + 1) % history.len();
                }
                self.block_remaining = self.block_remaining.saturating_sub(1);
                history.get(self.cursor).copied().unwrap_or(0.0)
            }
            ReturnGenerator::AnnualBootstrap(annual) | ReturnGenerator::Parametric(annual) => {
                if month.opens_new_year() {
                    self.active_monthly = draw_annual_as_monthly(&annual.pools, regime, rng);
                }
                self.active_monthly + annual.noise.draw(regime, rng)
            }
        }
    }
}

/// Everything derived from the input before paths run: the return generator,
/// the monthly regime chain, and the calibration series' moments.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub generator: ReturnGenerator,
    pub chain: MarkovChain,
    pub params: RegimeParams,
    pub moments: ReturnMoments,
}

/// Build the return generator and regime chain for a run.
///
/// Monthly history of at least 120 observations selects the block bootstrap
/// and a chain estimated from monthly labels. Otherwise annual history of at
/// least 25 years is bootstrapped, and without that a series is synthesized
/// from the regime model; both use the model's stay probabilities scaled to
/// monthly steps.
pub fn calibrate(input: &SimulationInput, rng: &mut RandomSource) -> Calibration {
    let params = RegimeParams::from_model(&input.regime_model);
    let use_history = input.mode.uses_history();
    let targeting = input.moment_targeting();

    let annual_target = MeanStd { mean: input.mean_return, std: input.return_variability.max(0.0) };
    let monthly_target = MeanStd {
        mean: annual_target.mean / 12.0,
        std: annual_target.std / 12.0_f64.sqrt(),
    };

    let monthly_history: Vec<f64> = if use_history {
        let cleaned: Vec<f64> = input
            .historical_monthly_returns
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .map(clamp_monthly_return)
            .collect();
        rescale(&cleaned, targeting, monthly_target, clamp_monthly_return)
    } else {
        Vec::new()
    };

    if DetectorParams::MONTHLY.is_sufficient(monthly_history.len()) {
        let labels = detect_monthly_regimes(&monthly_history);
        let pools = monthly_index_pools(&monthly_history, &labels);
        let chain = MarkovChain::estimate(&labels);
        debug!(
            "monthly calibration: {} obs, pools growth={} crisis={}, stay growth={:.4} crisis={:.4}",
            monthly_history.len(),
            pools.growth.len(),
            pools.crisis.len(),
            chain.stay_growth,
            chain.stay_crisis
        );
        let moments = ReturnMoments::of(&monthly_to_annual_series(&monthly_history));
        let generator = ReturnGenerator::MonthlyBlock {
            history: monthly_history,
            pools,
            block_length: input.block_length.max(1),
        };
        info!("return generator: {}", generator.name());
        return Calibration { generator, chain, params, moments };
    }

    if use_history && !monthly_history.is_empty() {
        warn!(
            "monthly history has {} observations (< {}); falling back to annual calibration",
            monthly_history.len(),
            DetectorParams::MONTHLY.min_samples
        );
    }

    let annual_history: Vec<f64> = input
        .historical_annual_returns
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    let historical = use_history && DetectorParams::ANNUAL.is_sufficient(annual_history.len());
    if use_history && !historical && !annual_history.is_empty() {
        warn!(
            "annual history has {} observations (< {}); synthesizing from the regime model",
            annual_history.len(),
            DetectorParams::ANNUAL.min_samples
        );
    }

    let base = if historical {
        annual_history
    } else {
        synthesize_annual_history(
            &params,
            input.return_skewness,
            input.return_kurtosis,
            SYNTHETIC_HISTORY_YEARS,
            rng,
        )
    };
    let effective = if use_history {
        rescale(&base, targeting, annual_target, clamp_annual_return)
    } else {
        base
    };

    let labels = detect_annual_regimes(&effective);
    let pools = annual_pools(&effective, &labels);
    debug!(
        "annual calibration: {} years, pools growth={} crisis={}",
        effective.len(),
        pools.growth.len(),
        pools.crisis.len()
    );
    let moments = ReturnMoments::of(&effective);
    let annual = AnnualBootstrap {
        pools,
        noise: StressNoise::new(&params, input.return_skewness, input.return_kurtosis),
    };
    let generator = if historical {
        ReturnGenerator::AnnualBootstrap(annual)
    } else {
        ReturnGenerator::Parametric(annual)
    };
    info!("return generator: {}", generator.name());

    Calibration { generator, chain: params.chain.annual_to_monthly(), params, moments }
}

/// Optionally moment-target a series, then clamp every value.
fn rescale(values: &[f64], targeting: bool, target: MeanStd, clamp: fn(f64) -> f64) -> Vec<f64> {
    if !targeting {
        return values.iter().copied().map(clamp).collect();
    }
    let source = MeanStd::of(values);
    values.iter().map(|&v| clamp(apply_moment_targeting(v, source, target))).collect()
}
