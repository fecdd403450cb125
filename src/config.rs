use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::types::Month;

/// Id of the salary-like income source that the ruin surface retimes to each
/// tested retirement age.
pub const DEFAULT_INCOME_ID: &str = "is-default";

/// Minimum number of paths a run will simulate, whatever was requested.
pub const MIN_PATHS: usize = 400;

/// How the engine sources its return distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SimulationMode {
    /// Bootstrap from historical data when enough of it is supplied.
    #[default]
    Historical,
    /// Bootstrap from historical data, rescaled to the requested mean and std.
    HistoricalTargeted,
    /// Ignore history; synthesize an annual series from the regime model.
    Parametric,
}

impl SimulationMode {
    pub fn uses_history(self) -> bool {
        !matches!(self, SimulationMode::Parametric)
    }
}

impl FromStr for SimulationMode {
    type Err = SimError;

    fn from_str(value: &str) -> SimResult<Self> {
        match value {
            "historical" => Ok(SimulationMode::Historical),
            "historicalTargeted" | "historical-targeted" => Ok(SimulationMode::HistoricalTargeted),
            "parametric" => Ok(SimulationMode::Parametric),
            other => Err(SimError::invalid(
                "simulationMode",
                format!("expected historical, historicalTargeted or parametric, got {other:?}"),
            )),
        }
    }
}

/// Two-state regime model, annual terms. Stay probabilities are per year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeModel {
    pub stay_growth: f64,
    pub stay_crisis: f64,
    pub growth_mean: f64,
    pub growth_std: f64,
    pub crisis_mean: f64,
    pub crisis_std: f64,
}

/// Common view over spending periods and income sources: a yearly amount that
/// applies on the half-open age interval `[from_age, to_age)`.
pub trait AgeSchedule {
    fn from_age(&self) -> f64;
    fn to_age(&self) -> f64;
    fn yearly_amount(&self) -> f64;
    /// Amounts that are not inflation adjusted are nominal and lose real value.
    fn inflation_adjusted(&self) -> bool;

    fn active_at(&self, age: f64) -> bool {
        self.from_age() <= age && age < self.to_age()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingPeriod {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub from_age: f64,
    pub to_age: f64,
    pub yearly_amount: f64,
    #[serde(default = "default_true")]
    pub inflation_adjusted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeSource {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub from_age: f64,
    pub to_age: f64,
    pub yearly_amount: f64,
    #[serde(default = "default_true")]
    pub inflation_adjusted: bool,
}

macro_rules! impl_age_schedule {
    ($ty:ty) => {
        impl AgeSchedule for $ty {
            fn from_age(&self) -> f64 {
                self.from_age
            }
            fn to_age(&self) -> f64 {
                self.to_age
            }
            fn yearly_amount(&self) -> f64 {
                self.yearly_amount
            }
            fn inflation_adjusted(&self) -> bool {
                self.inflation_adjusted
            }
        }
    };
}

impl_age_schedule!(SpendingPeriod);
impl_age_schedule!(IncomeSource);

/// A signed one-off cashflow (positive = inflow) at a specific age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LumpSumEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub age: f64,
    pub amount: f64,
}

/// Caller-owned cashflow schedules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedules {
    #[serde(default)]
    pub spending_periods: Vec<SpendingPeriod>,
    #[serde(default)]
    pub income_sources: Vec<IncomeSource>,
    #[serde(default)]
    pub lump_sum_events: Vec<LumpSumEvent>,
}

fn default_block_length() -> usize {
    6
}

fn default_inflation_crisis_spread() -> f64 {
    0.015
}

/// Everything that parameterises one run. Immutable once the run starts.
///
/// Rates and moments are annual fractions (0.07 = 7%). Kurtosis is raw
/// (normal = 3.0), not excess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationInput {
    #[serde(default, rename = "simulationMode")]
    pub mode: SimulationMode,
    #[serde(default)]
    pub historical_moment_targeting: bool,

    pub current_age: f64,
    pub retirement_age: f64,
    pub simulate_until_age: f64,
    pub current_savings: f64,

    pub mean_return: f64,
    pub return_variability: f64,
    pub return_skewness: f64,
    pub return_kurtosis: f64,
    /// Echoed only; the caller supplies pre-blended single-asset histories.
    #[serde(default)]
    pub equity_bond_correlation: f64,

    pub inflation_mean: f64,
    pub inflation_variability: f64,
    pub inflation_skewness: f64,
    pub inflation_kurtosis: f64,
    #[serde(default = "default_inflation_crisis_spread")]
    pub inflation_crisis_spread: f64,

    #[serde(default = "default_block_length")]
    pub block_length: usize,

    pub annual_fee_rate: f64,
    pub tax_on_gains_rate: f64,
    pub safe_withdrawal_rate: f64,

    pub simulations: usize,
    #[serde(default)]
    pub seed: Option<u64>,

    pub regime_model: RegimeModel,

    #[serde(default)]
    pub historical_annual_returns: Vec<f64>,
    #[serde(default)]
    pub historical_monthly_returns: Vec<f64>,
}

impl SimulationInput {
    /// A ready-to-run scenario: 35-year-old saver retiring at 55, simulated to 95.
    pub fn canonical() -> Self {
        SimulationInput {
            mode: SimulationMode::Historical,
            historical_moment_targeting: false,
            current_age: 35.0,
            retirement_age: 55.0,
            simulate_until_age: 95.0,
            current_savings: 150_000.0,
            mean_return: 0.07,
            return_variability: 0.15,
            return_skewness: -0.4,
            return_kurtosis: 4.5,
            equity_bond_correlation: 0.1,
            inflation_mean: 0.025,
            inflation_variability: 0.012,
            inflation_skewness: 0.3,
            inflation_kurtosis: 3.5,
            inflation_crisis_spread: default_inflation_crisis_spread(),
            block_length: default_block_length(),
            annual_fee_rate: 0.005,
            tax_on_gains_rate: 0.0,
            safe_withdrawal_rate: 0.04,
            simulations: 2_000,
            seed: Some(42),
            regime_model: RegimeModel {
                stay_growth: 0.90,
                stay_crisis: 0.70,
                growth_mean: 0.10,
                growth_std: 0.12,
                crisis_mean: -0.12,
                crisis_std: 0.22,
            },
            historical_annual_returns: Vec::new(),
            historical_monthly_returns: Vec::new(),
        }
    }

    /// Month count implied by the ages, rounded to whole months.
    pub fn horizon_months(&self) -> u32 {
        Month::nearest(self.simulate_until_age, self.current_age).max(0) as u32
    }

    /// Month index (1-based count of months worked) at which retirement starts.
    pub fn retire_month(&self) -> u32 {
        Month::nearest(self.retirement_age, self.current_age).max(0) as u32
    }

    /// Path count actually simulated: the request, floored at [`MIN_PATHS`].
    pub fn path_count(&self) -> usize {
        self.simulations.max(MIN_PATHS)
    }

    /// Whether bootstrap draws are rescaled to the requested moments.
    pub fn moment_targeting(&self) -> bool {
        match self.mode {
            SimulationMode::HistoricalTargeted => true,
            SimulationMode::Historical => self.historical_moment_targeting,
            SimulationMode::Parametric => false,
        }
    }

    /// Reject inputs that cannot describe a meaningful run. Runs before any
    /// simulation work so an invalid request never produces partial output.
    pub fn validate(&self, schedules: &Schedules, months: u32, retire_month: u32) -> SimResult<()> {
        let ages = [
            ("currentAge", self.current_age),
            ("retirementAge", self.retirement_age),
            ("simulateUntilAge", self.simulate_until_age),
            ("currentSavings", self.current_savings),
        ];
        for (field, value) in ages {
            if !value.is_finite() {
                return Err(SimError::invalid(field, format!("must be finite, got {value}")));
            }
        }
        if self.retirement_age <= self.current_age {
            return Err(SimError::invalid(
                "retirementAge",
                format!(
                    "must be greater than currentAge ({} <= {})",
                    self.retirement_age, self.current_age
                ),
            ));
        }
        if self.simulate_until_age < self.current_age + 1.0 {
            return Err(SimError::invalid(
                "simulateUntilAge",
                format!(
                    "must be at least one year past currentAge ({} < {})",
                    self.simulate_until_age,
                    self.current_age + 1.0
                ),
            ));
        }
        if months == 0 {
            return Err(SimError::invalid("months", "horizon must be positive"));
        }
        if retire_month == 0 || retire_month > months {
            return Err(SimError::invalid(
                "retireMonth",
                format!("must lie in 1..={months}, got {retire_month}"),
            ));
        }
        if schedules.spending_periods.is_empty() {
            return Err(SimError::invalid("spendingPeriods", "at least one spending period is required"));
        }
        if self.current_savings < 0.0 {
            return Err(SimError::invalid("currentSavings", "must not be negative"));
        }
        if !(self.safe_withdrawal_rate > 0.0) {
            return Err(SimError::invalid("safeWithdrawalRate", "must be positive"));
        }
        if self.block_length == 0 {
            return Err(SimError::invalid("blockLength", "must be at least one month"));
        }
        Ok(())
    }
}

impl Schedules {
    /// Schedules that go with [`SimulationInput::canonical`].
    pub fn canonical() -> Self {
        Schedules {
            spending_periods: vec![
                SpendingPeriod {
                    id: "sp-working".to_string(),
                    label: "Working years".to_string(),
                    from_age: 35.0,
                    to_age: 55.0,
                    yearly_amount: 40_000.0,
                    inflation_adjusted: true,
                },
                SpendingPeriod {
                    id: "sp-retired".to_string(),
                    label: "Retirement".to_string(),
                    from_age: 55.0,
                    to_age: 95.0,
                    yearly_amount: 45_000.0,
                    inflation_adjusted: true,
                },
            ],
            income_sources: vec![
                IncomeSource {
                    id: DEFAULT_INCOME_ID.to_string(),
                    label: "Salary".to_string(),
                    from_age: 35.0,
                    to_age: 55.0,
                    yearly_amount: 90_000.0,
                    inflation_adjusted: true,
                },
                IncomeSource {
                    id: "is-pension".to_string(),
                    label: "State pension".to_string(),
                    from_age: 67.0,
                    to_age: 95.0,
                    yearly_amount: 12_000.0,
                    inflation_adjusted: true,
                },
            ],
            lump_sum_events: vec![
                LumpSumEvent {
                    id: "ls-renovation".to_string(),
                    label: "Renovation".to_string(),
                    age: 45.0,
                    amount: -30_000.0,
                },
                LumpSumEvent {
                    id: "ls-inheritance".to_string(),
                    label: "Inheritance".to_string(),
                    age: 60.0,
                    amount: 50_000.0,
                },
            ],
        }
    }
}

/// A complete scenario as read from disk by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioFile {
    pub input: SimulationInput,
    #[serde(flatten)]
    pub schedules: Schedules,
    /// Overrides the month count derived from the ages.
    #[serde(default)]
    pub months: Option<u32>,
    /// Overrides the retirement month derived from the ages.
    #[serde(default)]
    pub retire_month: Option<u32>,
}

impl ScenarioFile {
    pub fn canonical() -> Self {
        ScenarioFile {
            input: SimulationInput::canonical(),
            schedules: Schedules::canonical(),
            months: None,
            retire_month: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn months(&self) -> u32 {
        self.months.unwrap_or_else(|| self.input.horizon_months())
    }

    pub fn retire_month(&self) -> u32 {
        self.retire_month.unwrap_or_else(|| self.input.retire_month())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical_validation() -> SimResult<()> {
        let input = SimulationInput::canonical();
        input.validate(&Schedules::canonical(), input.horizon_months(), input.retire_month())
    }

    #[test]
    fn canonical_scenario_is_valid() {
        assert!(canonical_validation().is_ok());
        let input = SimulationInput::canonical();
        assert_eq!(input.horizon_months(), 720);
        assert_eq!(input.retire_month(), 240);
    }

    #[test]
    fn retirement_before_current_age_rejected() {
        let mut input = SimulationInput::canonical();
        input.retirement_age = 30.0;
        let err = input
            .validate(&Schedules::canonical(), 720, 240)
            .expect_err("retirement before current age must fail");
        assert!(matches!(err, SimError::InvalidInput { field: "retirementAge", .. }));
    }

    #[test]
    fn short_horizon_rejected() {
        let mut input = SimulationInput::canonical();
        input.simulate_until_age = 35.5;
        let err = input.validate(&Schedules::canonical(), 6, 1).expect_err("must fail");
        assert!(matches!(err, SimError::InvalidInput { field: "simulateUntilAge", .. }));
    }

    #[test]
    fn zero_months_rejected() {
        let input = SimulationInput::canonical();
        let err = input.validate(&Schedules::canonical(), 0, 0).expect_err("must fail");
        assert!(matches!(err, SimError::InvalidInput { field: "months", .. }));
    }

    #[test]
    fn missing_spending_rejected() {
        let input = SimulationInput::canonical();
        let mut schedules = Schedules::canonical();
        schedules.spending_periods.clear();
        let err = input.validate(&schedules, 720, 240).expect_err("must fail");
        assert!(matches!(err, SimError::InvalidInput { field: "spendingPeriods", .. }));
    }

    #[test]
    fn path_count_has_floor() {
        let mut input = SimulationInput::canonical();
        input.simulations = 10;
        assert_eq!(input.path_count(), MIN_PATHS);
        input.simulations = 5_000;
        assert_eq!(input.path_count(), 5_000);
    }

    #[test]
    fn targeted_mode_forces_moment_targeting() {
        let mut input = SimulationInput::canonical();
        input.mode = SimulationMode::HistoricalTargeted;
        assert!(input.moment_targeting());
        input.mode = SimulationMode::Parametric;
        input.historical_moment_targeting = true;
        assert!(!input.moment_targeting());
    }

    #[test]
    fn scenario_json_applies_defaults() {
        let json = r#"{
            "input": {
                "currentAge": 40, "retirementAge": 60, "simulateUntilAge": 90,
                "currentSavings": 100000,
                "meanReturn": 0.06, "returnVariability": 0.14,
                "returnSkewness": 0, "returnKurtosis": 3,
                "inflationMean": 0.02, "inflationVariability": 0.01,
                "inflationSkewness": 0, "inflationKurtosis": 3,
                "annualFeeRate": 0.004, "taxOnGainsRate": 0.1,
                "safeWithdrawalRate": 0.04, "simulations": 1000,
                "regimeModel": {
                    "stayGrowth": 0.9, "stayCrisis": 0.7,
                    "growthMean": 0.09, "growthStd": 0.12,
                    "crisisMean": -0.1, "crisisStd": 0.2
                }
            },
            "spendingPeriods": [
                { "fromAge": 40, "toAge": 90, "yearlyAmount": 30000 }
            ]
        }"#;
        let scenario: ScenarioFile = serde_json::from_str(json).expect("valid scenario json");
        assert_eq!(scenario.input.mode, SimulationMode::Historical);
        assert_eq!(scenario.input.block_length, 6);
        assert_eq!(scenario.input.inflation_crisis_spread, 0.015);
        assert!(scenario.schedules.spending_periods[0].inflation_adjusted);
        assert!(scenario.schedules.income_sources.is_empty());
        assert_eq!(scenario.months(), 600);
        assert_eq!(scenario.retire_month(), 240);
    }

    #[test]
    fn mode_parses_from_flag_text() {
        assert_eq!("parametric".parse::<SimulationMode>().ok(), Some(SimulationMode::Parametric));
        assert_eq!(
            "historical-targeted".parse::<SimulationMode>().ok(),
            Some(SimulationMode::HistoricalTargeted)
        );
        let err = "bogus".parse::<SimulationMode>().expect_err("unknown mode must fail");
        assert!(matches!(err, SimError::InvalidInput { field: "simulationMode", .. }));
    }

    #[test]
    fn mode_parses_camel_case() {
        let mode: SimulationMode = serde_json::from_str("\"historicalTargeted\"").expect("valid mode");
        assert_eq!(mode, SimulationMode::HistoricalTargeted);
    }
}
