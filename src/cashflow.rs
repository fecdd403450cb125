use crate::config::{AgeSchedule, LumpSumEvent, SimulationInput};
use crate::types::Month;

/// Per-month cashflows in today's money. `monthly_net_flow[m]` is income minus
/// spending for month `m`; `lump_sum_by_month[m]` holds one-off amounts
/// bucketed to that month.
#[derive(Debug, Clone, PartialEq)]
pub struct CashflowArrays {
    pub monthly_net_flow: Vec<f64>,
    pub lump_sum_by_month: Vec<f64>,
}

/// Expected price level at `age`, relative to `current_age`, at the mean
/// inflation rate. Floored just above zero so it is always a safe divisor.
pub fn expected_inflation_index(inflation_mean: f64, current_age: f64, age: f64) -> f64 {
    let years = (age - current_age).max(0.0);
    (1.0 + inflation_mean).powf(years).max(1e-9)
}

/// Sum of yearly amounts active at `age`. Entries that are not inflation
/// adjusted are nominal, so they are deflated by `inflation_index`.
pub fn amount_at_age<S: AgeSchedule>(age: f64, entries: &[S], inflation_index: f64) -> f64 {
    entries
        .iter()
        .filter(|entry| entry.active_at(age))
        .map(|entry| {
            if entry.inflation_adjusted() {
                entry.yearly_amount()
            } else {
                entry.yearly_amount() / inflation_index
            }
        })
        .sum()
}

/// Build the monthly net-flow and lump-sum arrays for `months` months.
///
/// A schedule entry contributes while `from_age ≤ age < to_age`. Lump sums
/// land in the nearest month; those outside `[0, months)` are dropped.
pub fn build_cashflow_arrays<Sp: AgeSchedule, In: AgeSchedule>(
    input: &SimulationInput,
    spending: &[Sp],
    income: &[In],
    lump_sums: &[LumpSumEvent],
    months: u32,
) -> CashflowArrays {
    let monthly_net_flow = (0..months)
        .map(|m| {
            let age = Month(m).age(input.current_age);
            let index = expected_inflation_index(input.inflation_mean, input.current_age, age);
            (amount_at_age(age, income, index) - amount_at_age(age, spending, index)) / 12.0
        })
        .collect();

    let mut lump_sum_by_month = vec![0.0; months as usize];
    for event in lump_sums {
        let month = Month::nearest(event.age, input.current_age);
        if (0..months as i64).contains(&month) {
            lump_sum_by_month[month as usize] += event.amount;
        }
    }

    CashflowArrays { monthly_net_flow, lump_sum_by_month }
}
