use rand_distr::{Distribution, StudentT};
use serde::{Deserialize, Serialize};

use crate::rng::RandomSource;

/// Hard bounds on any annual return the engine produces or consumes.
pub const ANNUAL_RETURN_MIN: f64 = -0.95;
pub const ANNUAL_RETURN_MAX: f64 = 1.20;
/// Hard bounds on any monthly return the engine produces or consumes.
pub const MONTHLY_RETURN_MIN: f64 = -0.60;
pub const MONTHLY_RETURN_MAX: f64 = 0.60;

const SKEW_BOUND: f64 = 1.5;
const EXCESS_KURTOSIS_MAX: f64 = 8.0;

pub fn clamp_annual_return(value: f64) -> f64 {
    value.clamp(ANNUAL_RETURN_MIN, ANNUAL_RETURN_MAX)
}

pub fn clamp_monthly_return(value: f64) -> f64 {
    value.clamp(MONTHLY_RETURN_MIN, MONTHLY_RETURN_MAX)
}

/// Geometric monthly rate equivalent to an annual return: `(1+r)^(1/12) − 1`.
pub fn annual_to_monthly_return(annual_return: f64) -> f64 {
    (1.0 + clamp_annual_return(annual_return)).powf(1.0 / 12.0) - 1.0
}

/// Compound a monthly series into calendar-year returns, 12 months at a time.
/// A trailing partial year is dropped.
pub fn monthly_to_annual_series(monthly_returns: &[f64]) -> Vec<f64> {
    monthly_returns
        .chunks_exact(12)
        .map(|year| year.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0)
        .collect()
}

/// Cornish-Fisher adjustment of a standard normal score `z` towards the given
/// skewness and raw kurtosis (normal = 3). Skew is bounded to ±1.5 and excess
/// kurtosis to [0, 8], outside which the expansion stops being monotone.
pub fn cornish_fisher(z: f64, skewness: f64, kurtosis: f64) -> f64 {
    let s = skewness.clamp(-SKEW_BOUND, SKEW_BOUND);
    let k = (kurtosis - 3.0).clamp(0.0, EXCESS_KURTOSIS_MAX);

    let z2 = z * z;
    let z3 = z2 * z;

    z + (s / 6.0) * (z2 - 1.0) + (k / 24.0) * (z3 - 3.0 * z) - (s * s / 36.0) * (2.0 * z3 - 5.0 * z)
}

pub fn draw_cornish_fisher(skewness: f64, kurtosis: f64, rng: &mut RandomSource) -> f64 {
    cornish_fisher(rng.standard_normal(), skewness, kurtosis)
}

/// Monthly draw from an annual mean/std, shaped by skewness and kurtosis.
pub fn draw_monthly_shaped(
    annual_mean: f64,
    annual_std: f64,
    skewness: f64,
    kurtosis: f64,
    rng: &mut RandomSource,
) -> f64 {
    let monthly_mean = annual_mean / 12.0;
    let monthly_std = annual_std / 12.0_f64.sqrt();
    monthly_mean + monthly_std * draw_cornish_fisher(skewness, kurtosis, rng)
}

/// Student-t degrees of freedom implied by a raw kurtosis: `4 + 6/excess`,
/// bounded to [5, 60]. Near-normal inputs (excess < 0.05) get 40.
pub fn student_t_degrees_from_kurtosis(kurtosis: f64) -> f64 {
    let excess = (kurtosis - 3.0).max(0.0);
    if excess < 0.05 {
        return 40.0;
    }
    (4.0 + 6.0 / excess).clamp(5.0, 60.0)
}

pub fn draw_student_t(df: f64, rng: &mut RandomSource) -> f64 {
    match StudentT::new(df) {
        Ok(dist) => dist.sample(rng),
        Err(_) => rng.standard_normal(),
    }
}

/// Population mean and standard deviation of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanStd {
    pub mean: f64,
    pub std: f64,
}

impl MeanStd {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return MeanStd { mean: 0.0, std: 0.0 };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        MeanStd { mean, std: variance.max(0.0).sqrt() }
    }
}

/// Affine rescale of a draw from `source` moments to `target` moments:
/// `target.mean + (value − source.mean) / source.std × target.std`.
///
/// Order within a series is preserved. A degenerate source (zero or
/// non-finite std) collapses to the target mean.
pub fn apply_moment_targeting(value: f64, source: MeanStd, target: MeanStd) -> f64 {
    if !value.is_finite() || !source.mean.is_finite() || !source.std.is_finite() || source.std <= 1e-12
    {
        return target.mean;
    }
    target.mean + (value - source.mean) / source.std * target.std.max(0.0)
}

/// Descriptive moments of the calibration series, reported alongside results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnMoments {
    pub arithmetic_mean: f64,
    pub geometric_mean: f64,
    pub std_dev: f64,
    pub skewness: f64,
    /// Raw kurtosis (normal = 3).
    pub kurtosis: f64,
}

impl ReturnMoments {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return ReturnMoments {
                arithmetic_mean: 0.0,
                geometric_mean: 0.0,
                std_dev: 0.0,
                skewness: 0.0,
                kurtosis: 3.0,
            };
        }

        let n = values.len() as f64;
        let MeanStd { mean, std } = MeanStd::of(values);
        let geometric_mean =
            values.iter().fold(1.0, |prod, v| prod * (1.0 + v).max(0.0001)).powf(1.0 / n) - 1.0;

        if std <= 1e-9 {
            return ReturnMoments {
                arithmetic_mean: mean,
                geometric_mean,
                std_dev: 0.0,
                skewness: 0.0,
                kurtosis: 3.0,
            };
        }

        let m3 = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
        let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / n;

        ReturnMoments {
            arithmetic_mean: mean,
            geometric_mean,
            std_dev: std,
            skewness: m3 / std.powi(3),
            kurtosis: m4 / std.powi(4),
        }
    }
}
