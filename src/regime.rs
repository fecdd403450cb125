use crate::config::RegimeModel;
use crate::rng::RandomSource;
use crate::types::Regime;

/// Lower bound on any transition probability; the upper bound is `1 − MIN`.
pub const MIN_STATE_PROBABILITY: f64 = 0.001;

/// Floor on the growth std, and on the gap between crisis and growth std.
const REGIME_STD_FLOOR: f64 = 0.01;

/// Stay probabilities used when a regime never appears in a label sequence.
const DEFAULT_STAY_GROWTH: f64 = 0.88;
const DEFAULT_STAY_CRISIS: f64 = 0.72;

pub fn clamp_transition_probability(value: f64) -> f64 {
    value.clamp(MIN_STATE_PROBABILITY, 1.0 - MIN_STATE_PROBABILITY)
}

/// Thresholds for labelling a return series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// A period is Crisis when its return is at or below `mean − k·std`.
    pub return_k: f64,
    /// ... or when its trailing-window volatility is at least `m·std`.
    pub volatility_m: f64,
    /// Trailing window length, in periods, including the current one.
    pub window: usize,
    /// Below this many observations the series is too short to calibrate from.
    pub min_samples: usize,
}

impl DetectorParams {
    pub const ANNUAL: DetectorParams =
        DetectorParams { return_k: 0.65, volatility_m: 1.15, window: 3, min_samples: 25 };
    pub const MONTHLY: DetectorParams =
        DetectorParams { return_k: 0.75, volatility_m: 1.2, window: 6, min_samples: 120 };

    pub fn is_sufficient(&self, len: usize) -> bool {
        len >= self.min_samples
    }
}

fn population_std(values: &[f64]) -> f64 {
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).max(0.0).sqrt()
}

/// Label every period of `returns` as Growth or Crisis.
///
/// After thresholding, a single non-crisis period flanked by crisis on both
/// sides is relabelled Crisis. This gap-fill is one left-to-right pass.
pub fn detect_regimes(returns: &[f64], params: &DetectorParams) -> Vec<Regime> {
    let n = returns.len().max(1) as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let std = population_std(returns);
    let crisis_threshold = mean - params.return_k * std;
    let volatility_threshold = std * params.volatility_m;
    let lookback = params.window.saturating_sub(1);

    let mut labels: Vec<Regime> = returns
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            let window = &returns[index.saturating_sub(lookback)..=index];
            let by_return = value <= crisis_threshold;
            let by_volatility = population_std(window) >= volatility_threshold;
            if by_return || by_volatility { Regime::Crisis } else { Regime::Growth }
        })
        .collect();

    if labels.len() > 2 {
        for index in 1..labels.len() - 1 {
            if labels[index] == Regime::Growth
                && labels[index - 1] == Regime::Crisis
                && labels[index + 1] == Regime::Crisis
            {
                labels[index] = Regime::Crisis;
            }
        }
    }

    labels
}

pub fn detect_annual_regimes(annual_returns: &[f64]) -> Vec<Regime> {
    detect_regimes(annual_returns, &DetectorParams::ANNUAL)
}

pub fn detect_monthly_regimes(monthly_returns: &[f64]) -> Vec<Regime> {
    detect_regimes(monthly_returns, &DetectorParams::MONTHLY)
}

/// Two-state Markov chain over [`Regime`]. Probabilities are always clamped
/// to `[MIN_STATE_PROBABILITY, 1 − MIN_STATE_PROBABILITY]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkovChain {
    pub stay_growth: f64,
    pub stay_crisis: f64,
}

impl MarkovChain {
    pub fn new(stay_growth: f64, stay_crisis: f64) -> Self {
        MarkovChain {
            stay_growth: clamp_transition_probability(stay_growth),
            stay_crisis: clamp_transition_probability(stay_crisis),
        }
    }

    /// Empirical fraction of same-label consecutive pairs, per regime.
    pub fn estimate(labels: &[Regime]) -> Self {
        let (mut growth_stay, mut growth_total) = (0u32, 0u32);
        let (mut crisis_stay, mut crisis_total) = (0u32, 0u32);

        for pair in labels.windows(2) {
            match pair[0] {
                Regime::Growth => {
                    growth_total += 1;
                    if pair[1] == Regime::Growth {
                        growth_stay += 1;
                    }
                }
                Regime::Crisis => {
                    crisis_total += 1;
                    if pair[1] == Regime::Crisis {
                        crisis_stay += 1;
                    }
                }
            }
        }

        let ratio = |stay: u32, total: u32, default: f64| {
            if total > 0 { stay as f64 / total as f64 } else { default }
        };
        MarkovChain::new(
            ratio(growth_stay, growth_total, DEFAULT_STAY_GROWTH),
            ratio(crisis_stay, crisis_total, DEFAULT_STAY_CRISIS),
        )
    }

    /// Same persistence expressed per month instead of per year: `p^(1/12)`.
    pub fn annual_to_monthly(self) -> Self {
        MarkovChain::new(self.stay_growth.powf(1.0 / 12.0), self.stay_crisis.powf(1.0 / 12.0))
    }

    /// Long-run probability of Growth:
    /// `(1 − stayCrisis) / ((1 − stayGrowth) + (1 − stayCrisis))`, or 0.5 when
    /// the denominator vanishes.
    pub fn growth_stationary_probability(&self) -> f64 {
        growth_stationary_probability(self.stay_growth, self.stay_crisis)
    }

    /// Draw a starting regime from the stationary distribution.
    pub fn initial_state(&self, rng: &mut RandomSource) -> Regime {
        let growth = clamp_transition_probability(self.growth_stationary_probability());
        if rng.uniform() < growth { Regime::Growth } else { Regime::Crisis }
    }

    pub fn transition(&self, current: Regime, rng: &mut RandomSource) -> Regime {
        let u = rng.uniform();
        match current {
            Regime::Growth if u < self.stay_growth => Regime::Growth,
            Regime::Growth => Regime::Crisis,
            Regime::Crisis if u < self.stay_crisis => Regime::Crisis,
            Regime::Crisis => Regime::Growth,
        }
    }
}

pub fn growth_stationary_probability(stay_growth: f64, stay_crisis: f64) -> f64 {
    let denominator = 2.0 - stay_growth - stay_crisis;
    if denominator <= 1e-9 {
        return 0.5;
    }
    (1.0 - stay_crisis) / denominator
}

/// Regime model with its invariants enforced: clamped stay probabilities,
/// `growth_std ≥ 0.01` and `crisis_std ≥ growth_std + 0.01`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeParams {
    pub chain: MarkovChain,
    pub growth_mean: f64,
    pub growth_std: f64,
    pub crisis_mean: f64,
    pub crisis_std: f64,
}

impl RegimeParams {
    pub fn from_model(model: &RegimeModel) -> Self {
        let growth_std = model.growth_std.max(REGIME_STD_FLOOR);
        let crisis_std = model.crisis_std.max(growth_std + REGIME_STD_FLOOR);
        RegimeParams {
            chain: MarkovChain::new(model.stay_growth, model.stay_crisis),
            growth_mean: model.growth_mean,
            growth_std,
            crisis_mean: model.crisis_mean,
            crisis_std,
        }
    }

    pub fn mean(&self, regime: Regime) -> f64 {
        regime.select(self.growth_mean, self.crisis_mean)
    }

    pub fn std(&self, regime: Regime) -> f64 {
        regime.select(self.growth_std, self.crisis_std)
    }
}
