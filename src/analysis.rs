use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::cashflow::{CashflowArrays, amount_at_age, build_cashflow_arrays};
use crate::config::{DEFAULT_INCOME_ID, IncomeSource, Schedules, SimulationInput, SpendingPeriod};
use crate::returns::ReturnMoments;
use crate::types::PathMatrix;

/// Success probability a retirement balance must reach to count as the
/// probability-based FI target.
pub const FI_TARGET_SUCCESS_PROBABILITY: f64 = 0.95;

/// Ruin-surface grid: offsets (years) around the requested retirement age,
/// and multipliers applied to every spending period.
pub const RUIN_SURFACE_AGE_OFFSETS: [f64; 5] = [-6.0, -3.0, 0.0, 3.0, 6.0];
pub const RUIN_SURFACE_SPENDING_MULTIPLIERS: [f64; 5] = [0.8, 0.9, 1.0, 1.1, 1.2];
/// Paths replayed per ruin-surface cell.
pub const RUIN_SURFACE_MAX_PATHS: usize = 800;

const SEQUENCE_RISK_BUCKETS: usize = 5;
const SEQUENCE_RISK_EARLY_YEARS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileSeries<T> {
    pub p10: T,
    pub p25: T,
    pub p50: T,
    pub p75: T,
    pub p90: T,
}

/// Linear-interpolated percentile of an ascending slice: `index = p·(n−1)`,
/// blending the floor and ceiling ranks by the fractional part. `p ≤ 0`
/// gives the minimum, `p ≥ 1` the maximum, an empty slice 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[n - 1];
    }

    let h = p * (n - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    let frac = h - lo as f64;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

fn sort_ascending(values: &mut [f64]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
}

fn bands(sorted: &[f64]) -> PercentileSeries<f64> {
    PercentileSeries {
        p10: percentile(sorted, 0.10),
        p25: percentile(sorted, 0.25),
        p50: percentile(sorted, 0.50),
        p75: percentile(sorted, 0.75),
        p90: percentile(sorted, 0.90),
    }
}

/// P10/P25/P50/P75/P90 of an unsorted sample.
pub fn summarize(values: &[f64]) -> PercentileSeries<f64> {
    let mut sorted = values.to_vec();
    sort_ascending(&mut sorted);
    bands(&sorted)
}

/// Cross-path percentile bands for every month of `balances`.
pub fn percentile_bands(balances: &PathMatrix) -> PercentileSeries<Vec<f64>> {
    let per_month: Vec<PercentileSeries<f64>> = (0..balances.months())
        .into_par_iter()
        .map(|month| {
            let mut column: Vec<f64> = balances.column(month).collect();
            sort_ascending(&mut column);
            bands(&column)
        })
        .collect();

    let pick = |f: fn(&PercentileSeries<f64>) -> f64| per_month.iter().map(f).collect::<Vec<f64>>();
    PercentileSeries {
        p10: pick(|b| b.p10),
        p25: pick(|b| b.p25),
        p50: pick(|b| b.p50),
        p75: pick(|b| b.p75),
        p90: pick(|b| b.p90),
    }
}

/// Smallest retirement-age balance such that the paths retiring with at least
/// that balance succeed (end above zero) with probability ≥ `target`.
///
/// Paths are sorted by retirement balance; a suffix count of successes gives
/// the success rate above each candidate threshold. If no threshold reaches
/// `target`, the largest observed balance is returned.
pub fn find_retirement_balance_target(
    retirement_balances: &[f64],
    ending_balances: &[f64],
    target: f64,
) -> f64 {
    let n = retirement_balances.len().min(ending_balances.len());
    if n == 0 {
        return 0.0;
    }

    let mut outcomes: Vec<(f64, bool)> = (0..n)
        .map(|i| (retirement_balances[i], ending_balances[i] > 0.0))
        .collect();
    outcomes.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut suffix_success = vec![0usize; n + 1];
    for i in (0..n).rev() {
        suffix_success[i] = suffix_success[i + 1] + usize::from(outcomes[i].1);
    }

    let threshold = (0..n)
        .find(|&i| suffix_success[i] as f64 / (n - i) as f64 >= target)
        .map(|i| outcomes[i].0)
        .unwrap_or(outcomes[n - 1].0);
    threshold.max(0.0)
}

/// Outcomes for one quintile of paths ranked by early real returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRiskBucket {
    pub bucket_label: String,
    pub early_years_mean_return: f64,
    pub ruin_probability: f64,
    pub ending_median: f64,
}

/// Rank paths by mean real return over their first `min(10, shortest)` years
/// and split into five equal quintiles, worst first.
pub fn sequence_risk_buckets(
    annual_real_returns: &[Vec<f64>],
    final_balances: &[f64],
    depleted: &[bool],
) -> Vec<SequenceRiskBucket> {
    let n = annual_real_returns.len();
    if n == 0 {
        return Vec::new();
    }

    let shortest = annual_real_returns.iter().map(|s| s.len().max(1)).min().unwrap_or(1);
    let early_years = shortest.min(SEQUENCE_RISK_EARLY_YEARS).max(1);

    let mut ranked: Vec<(usize, f64)> = annual_real_returns
        .iter()
        .enumerate()
        .map(|(i, series)| (i, series.iter().take(early_years).sum::<f64>() / early_years as f64))
        .collect();
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    (0..SEQUENCE_RISK_BUCKETS)
        .filter_map(|bucket| {
            let members = &ranked[bucket * n / SEQUENCE_RISK_BUCKETS..(bucket + 1) * n / SEQUENCE_RISK_BUCKETS];
            if members.is_empty() {
                return None;
            }
            let size = members.len() as f64;
            let ruined = members
                .iter()
                .filter(|(i, _)| depleted[*i] || final_balances[*i] <= 0.0)
                .count();
            let endings: Vec<f64> = members.iter().map(|(i, _)| final_balances[*i]).collect();

            let bucket_label = match bucket {
                0 => format!("Q{} (worst early sequence)", bucket + 1),
                b if b == SEQUENCE_RISK_BUCKETS - 1 => format!("Q{} (best early sequence)", bucket + 1),
                _ => format!("Q{}", bucket + 1),
            };
            Some(SequenceRiskBucket {
                bucket_label,
                early_years_mean_return: members.iter().map(|(_, r)| r).sum::<f64>() / size,
                ruin_probability: ruined as f64 / size,
                ending_median: summarize(&endings).p50,
            })
        })
        .collect()
}

/// Ruin probability over a retirement-age × spending-multiplier grid.
/// `ruin_probabilities[i][j]` is for `spending_multipliers[i]` and
/// `retirement_ages[j]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuinSurface {
    pub retirement_ages: Vec<u32>,
    pub spending_multipliers: Vec<f64>,
    pub ruin_probabilities: Vec<Vec<f64>>,
}

/// Replay recorded real growth factors for the first `sample_count` paths
/// against alternative cashflows. No randomness is drawn.
pub fn replay_ruin_probability(
    growth_factors: &PathMatrix,
    cashflows: &CashflowArrays,
    starting_balance: f64,
    sample_count: usize,
) -> f64 {
    let sample_count = sample_count.min(growth_factors.paths());
    let ruined = (0..sample_count)
        .filter(|&path| {
            let mut balance = starting_balance;
            let mut ruined = false;
            let flows = cashflows.monthly_net_flow.iter().zip(&cashflows.lump_sum_by_month);
            for (growth, (net, lump)) in growth_factors.row(path).iter().zip(flows) {
                balance += net + lump;
                balance *= growth;
                if balance <= 0.0 {
                    balance = 0.0;
                    ruined = true;
                }
            }
            ruined || balance <= 0.0
        })
        .count();
    ruined as f64 / sample_count.max(1) as f64
}

/// Tested retirement ages: requested age plus each offset, held inside
/// `[currentAge + 1, horizon − 1]`, rounded, sorted and deduplicated.
pub fn ruin_surface_ages(input: &SimulationInput) -> Vec<u32> {
    let mut ages: Vec<u32> = RUIN_SURFACE_AGE_OFFSETS
        .iter()
        .map(|offset| {
            (input.retirement_age + offset)
                .max(input.current_age + 1.0)
                .min(input.simulate_until_age - 1.0)
                .round() as u32
        })
        .collect();
    ages.sort_unstable();
    ages.dedup();
    ages
}

/// Estimate ruin probability for each grid cell by replaying growth traces.
///
/// Only the salary-like income source (id `is-default`) is retimed to end at
/// the tested retirement age; every other income source keeps its own ages.
pub fn build_ruin_surface(
    input: &SimulationInput,
    schedules: &Schedules,
    growth_factors: &PathMatrix,
) -> RuinSurface {
    let retirement_ages = ruin_surface_ages(input);
    let months = growth_factors.months() as u32;
    let sample_count = growth_factors.paths().min(RUIN_SURFACE_MAX_PATHS);

    let ruin_probabilities = RUIN_SURFACE_SPENDING_MULTIPLIERS
        .par_iter()
        .map(|&multiplier| {
            let spending: Vec<SpendingPeriod> = schedules
                .spending_periods
                .iter()
                .map(|p| SpendingPeriod { yearly_amount: p.yearly_amount * multiplier, ..p.clone() })
                .collect();

            retirement_ages
                .iter()
                .map(|&age| {
                    let income: Vec<IncomeSource> = schedules
                        .income_sources
                        .iter()
                        .map(|s| {
                            if s.id == DEFAULT_INCOME_ID {
                                IncomeSource { to_age: age as f64, ..s.clone() }
                            } else {
                                s.clone()
                            }
                        })
                        .collect();
                    let cashflows = build_cashflow_arrays(
                        input,
                        &spending,
                        &income,
                        &schedules.lump_sum_events,
                        months,
                    );
                    replay_ruin_probability(growth_factors, &cashflows, input.current_savings, sample_count)
                })
                .collect()
        })
        .collect();

    RuinSurface {
        retirement_ages,
        spending_multipliers: RUIN_SURFACE_SPENDING_MULTIPLIERS.to_vec(),
        ruin_probabilities,
    }
}

/// Month-by-month percentile bands plus final and retirement-age summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub months: u32,
    pub ages: Vec<f64>,
    pub retire_month: u32,
    pub percentiles: PercentileSeries<Vec<f64>>,
    pub final_percentiles: PercentileSeries<f64>,
    pub retire_percentiles: PercentileSeries<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub fi_target: f64,
    pub fi_target_swr: f64,
    pub fi_target_p95: f64,
    pub success_probability: f64,
    pub fi_probability_swr: f64,
    pub fi_probability_p95: f64,
    pub return_moments: ReturnMoments,
    pub sequence_risk: Vec<SequenceRiskBucket>,
    pub ruin_surface: RuinSurface,
    pub shortfall_low: f64,
    pub shortfall_median: f64,
    pub shortfall_high: f64,
    pub depleted_years_low: f64,
    pub depleted_years_median: f64,
    pub depleted_years_high: f64,
    pub retire_low: f64,
    pub retire_median: f64,
    pub retire_high: f64,
    pub final_low: f64,
    pub final_median: f64,
    pub final_high: f64,
}

/// End-of-horizon record for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathOutcome {
    pub final_balance: f64,
    pub retire_balance: f64,
    pub depleted: bool,
    pub depleted_months: u32,
    pub shortfall: f64,
    pub annual_real_returns: Vec<f64>,
}

impl PathOutcome {
    pub fn succeeded(&self) -> bool {
        !self.depleted && self.final_balance > 0.0
    }
}

fn share(count: usize, total: usize) -> f64 {
    count as f64 / total.max(1) as f64
}

/// Reduce per-path outcomes and the balance/growth matrices into the two
/// output records.
pub fn aggregate(
    input: &SimulationInput,
    schedules: &Schedules,
    retire_month: u32,
    outcomes: &[PathOutcome],
    balances: &PathMatrix,
    growth_factors: &PathMatrix,
    return_moments: ReturnMoments,
) -> (SimulationResult, SummaryStats) {
    let n = outcomes.len();
    let months = balances.months() as u32;

    let final_balances: Vec<f64> = outcomes.iter().map(|o| o.final_balance).collect();
    let retire_balances: Vec<f64> = outcomes.iter().map(|o| o.retire_balance).collect();
    let shortfalls: Vec<f64> = outcomes.iter().map(|o| o.shortfall).collect();
    let depleted_years: Vec<f64> = outcomes.iter().map(|o| o.depleted_months as f64 / 12.0).collect();
    let depleted: Vec<bool> = outcomes.iter().map(|o| o.depleted).collect();
    let annual_real_returns: Vec<Vec<f64>> =
        outcomes.iter().map(|o| o.annual_real_returns.clone()).collect();

    let fi_target_p95 =
        find_retirement_balance_target(&retire_balances, &final_balances, FI_TARGET_SUCCESS_PROBABILITY);
    let spending_at_retirement = amount_at_age(input.retirement_age, &schedules.spending_periods, 1.0);
    let fi_target_swr = spending_at_retirement / input.safe_withdrawal_rate.max(0.01);
    let reaching = |target: f64| retire_balances.iter().filter(|&&b| b >= target).count();

    let ages = (0..months)
        .map(|m| ((input.current_age + m as f64 / 12.0) * 100.0).round() / 100.0)
        .collect();

    let final_percentiles = summarize(&final_balances);
    let retire_percentiles = summarize(&retire_balances);
    let shortfall = summarize(&shortfalls);
    let depleted_years = summarize(&depleted_years);

    let simulation = SimulationResult {
        months,
        ages,
        retire_month,
        percentiles: percentile_bands(balances),
        final_percentiles: final_percentiles.clone(),
        retire_percentiles: retire_percentiles.clone(),
    };

    let stats = SummaryStats {
        fi_target: fi_target_p95,
        fi_target_swr,
        fi_target_p95,
        success_probability: share(outcomes.iter().filter(|o| o.succeeded()).count(), n),
        fi_probability_swr: share(reaching(fi_target_swr), n),
        fi_probability_p95: share(reaching(fi_target_p95), n),
        return_moments,
        sequence_risk: sequence_risk_buckets(&annual_real_returns, &final_balances, &depleted),
        ruin_surface: build_ruin_surface(input, schedules, growth_factors),
        shortfall_low: shortfall.p10,
        shortfall_median: shortfall.p50,
        shortfall_high: shortfall.p90,
        depleted_years_low: depleted_years.p10,
        depleted_years_median: depleted_years.p50,
        depleted_years_high: depleted_years.p90,
        retire_low: retire_percentiles.p10,
        retire_median: retire_percentiles.p50,
        retire_high: retire_percentiles.p90,
        final_low: final_percentiles.p10,
        final_median: final_percentiles.p50,
        final_high: final_percentiles.p90,
    };

    (simulation, stats)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.0), 1.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], -1.0), 1.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 1.0), 4.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 7.0), 4.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[5.0], 0.3), 5.0);
    }

    #[test]
    fn summarize_sorts_first() {
        let s = summarize(&[5.0, 1.0, 3.0, 2.0, 4.0]);
        assert_eq!(s.p50, 3.0);
        assert!((s.p10 - 1.4).abs() < 1e-12);
        assert!((s.p90 - 4.6).abs() < 1e-12);
    }

    #[test]
    fn fi_target_finds_95_percent_threshold() {
        let retire = [100.0, 120.0, 140.0, 160.0, 180.0, 200.0];
        let ending = [0.0, 0.0, 50.0, 80.0, 120.0, 160.0];
        assert_eq!(find_retirement_balance_target(&retire, &ending, 0.95), 140.0);
    }

    #[test]
    fn fi_target_unordered_input() {
        let retire = [180.0, 100.0, 200.0, 140.0, 120.0, 160.0];
        let ending = [120.0, 0.0, 160.0, 50.0, 0.0, 80.0];
        assert_eq!(find_retirement_balance_target(&retire, &ending, 0.95), 140.0);
    }

    #[test]
    fn fi_target_unreachable_returns_max() {
        let retire = [100.0, 200.0, 300.0];
        let ending = [0.0, 0.0, 0.0];
        assert_eq!(find_retirement_balance_target(&retire, &ending, 0.95), 300.0);
        assert_eq!(find_retirement_balance_target(&[], &[], 0.95), 0.0);
    }

    #[test]
    fn percentile_bands_per_month() {
        let mut balances = PathMatrix::filled(5, 2, 0.0);
        for (path, row) in balances.rows_mut().enumerate() {
            row[0] = path as f64;
            row[1] = 10.0 * (4 - path) as f64;
        }
        let bands = percentile_bands(&balances);
        assert_eq!(bands.p50, vec![2.0, 20.0]);
        assert_eq!(bands.p10.len(), 2);
        assert!(bands.p10[1] < bands.p90[1]);
    }

    #[test]
    fn sequence_risk_quintiles_rank_by_early_returns() {
        let n = 10;
        let returns: Vec<Vec<f64>> = (0..n).map(|i| vec![i as f64 / 100.0; 12]).collect();
        let finals: Vec<f64> = (0..n).map(|i| if i < 2 { 0.0 } else { i as f64 * 1000.0 }).collect();
        let depleted: Vec<bool> = (0..n).map(|i| i < 2).collect();
        let buckets = sequence_risk_buckets(&returns, &finals, &depleted);

        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets[0].bucket_label, "Q1 (worst early sequence)");
        assert_eq!(buckets[2].bucket_label, "Q3");
        assert_eq!(buckets[4].bucket_label, "Q5 (best early sequence)");
        assert_eq!(buckets[0].ruin_probability, 1.0);
        assert_eq!(buckets[1].ruin_probability, 0.0);
        assert!((buckets[0].early_years_mean_return - 0.005).abs() < 1e-12);
        assert_eq!(buckets[4].ending_median, 8_500.0);
        for pair in buckets.windows(2) {
            assert!(pair[0].early_years_mean_return <= pair[1].early_years_mean_return);
        }
    }

    #[test]
    fn replay_detects_ruin_without_randomness() {
        let mut growth = PathMatrix::filled(2, 3, 1.0);
        growth.as_mut_slice()[3..].copy_from_slice(&[0.5, 0.5, 0.5]);
        let cashflows = CashflowArrays {
            monthly_net_flow: vec![-30.0; 3],
            lump_sum_by_month: vec![0.0; 3],
        };
        // Path 0: 100 → 70 → 40 → 10. Path 1: 100 → 35 → 2.5 → 0 (ruined).
        let p = replay_ruin_probability(&growth, &cashflows, 100.0, 10);
        assert_eq!(p, 0.5);
    }

    #[test]
    fn ruin_surface_ages_clamped_and_deduplicated() {
        let mut input = SimulationInput::canonical();
        input.current_age = 50.0;
        input.retirement_age = 53.0;
        input.simulate_until_age = 58.0;
        assert_eq!(ruin_surface_ages(&input), vec![51, 53, 56, 57]);
    }

    fn salary_scenario(income_id: &str) -> (SimulationInput, Schedules) {
        let mut input = SimulationInput::canonical();
        input.current_age = 40.0;
        input.retirement_age = 50.0;
        input.simulate_until_age = 60.0;
        input.current_savings = 0.0;
        let schedules = Schedules {
            spending_periods: vec![SpendingPeriod {
                id: "sp".to_string(),
                label: "Spending".to_string(),
                from_age: 40.0,
                to_age: 60.0,
                yearly_amount: 30_000.0,
                inflation_adjusted: true,
            }],
            income_sources: vec![IncomeSource {
                id: income_id.to_string(),
                label: "Salary".to_string(),
                from_age: 40.0,
                to_age: 50.0,
                yearly_amount: 70_000.0,
                inflation_adjusted: true,
            }],
            lump_sum_events: Vec::new(),
        };
        (input, schedules)
    }

    #[test]
    fn ruin_surface_retimes_only_default_salary() {
        let growth = PathMatrix::filled(4, 240, 1.0);
        let base = RUIN_SURFACE_SPENDING_MULTIPLIERS
            .iter()
            .position(|&m| m == 1.0)
            .expect("grid has a 1.0 multiplier");

        let (input, schedules) = salary_scenario(DEFAULT_INCOME_ID);
        let retimed = build_ruin_surface(&input, &schedules, &growth);
        assert_eq!(retimed.retirement_ages, vec![44, 47, 50, 53, 56]);
        assert_eq!(retimed.ruin_probabilities[base], vec![1.0, 1.0, 0.0, 0.0, 0.0]);
        for row in &retimed.ruin_probabilities {
            for pair in row.windows(2) {
                assert!(pair[1] <= pair[0], "ruin must not rise with a later retirement");
            }
        }

        let (input, schedules) = salary_scenario("is-other");
        let fixed = build_ruin_surface(&input, &schedules, &growth);
        assert_eq!(fixed.ruin_probabilities[base], vec![0.0; 5]);
        for row in &fixed.ruin_probabilities {
            assert!(row.iter().all(|&p| p == row[0]), "other income keeps its own ages");
        }
    }

    proptest! {
        #[test]
        fn percentile_monotone_in_p(
            mut values in proptest::collection::vec(-1e6f64..1e6, 1..50),
            p in 0.0f64..1.0,
            q in 0.0f64..1.0,
        ) {
            sort_ascending(&mut values);
            let (lo, hi) = if p <= q { (p, q) } else { (q, p) };
            prop_assert!(percentile(&values, lo) <= percentile(&values, hi) + 1e-9);
        }
    }
}
