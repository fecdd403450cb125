use std::env;

use fireplan::bootstrap::{SYNTHETIC_HISTORY_YEARS, synthesize_annual_history};
use fireplan::config::SimulationInput;
use fireplan::regime::{MarkovChain, RegimeParams, detect_annual_regimes};
use fireplan::returns::ReturnMoments;
use fireplan::rng::RandomSource;
use fireplan::types::Regime;
use serde::Serialize;

#[derive(Serialize)]
struct HistoryYear {
    year: usize,
    annual_return: f64,
    regime: Regime,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let input = SimulationInput::canonical();

    let n_years: usize = env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(SYNTHETIC_HISTORY_YEARS);
    let seed: u64 = env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .or(input.seed)
        .unwrap_or(42);

    let params = RegimeParams::from_model(&input.regime_model);
    let mut rng = RandomSource::seeded(seed);
    let series = synthesize_annual_history(
        &params,
        input.return_skewness,
        input.return_kurtosis,
        n_years,
        &mut rng,
    );
    let labels = detect_annual_regimes(&series);

    // NDJSON to stdout.
    for (year, (&annual_return, &regime)) in series.iter().zip(&labels).enumerate() {
        let row = HistoryYear { year, annual_return, regime };
        println!("{}", serde_json::to_string(&row).expect("serialisation failed"));
    }

    // Regime summary to stderr.
    let moments = ReturnMoments::of(&series);
    eprintln!(
        "synth_history: {} years (seed {seed}), mean={:.4} geo={:.4} std={:.4} skew={:.3} kurt={:.3}",
        series.len(),
        moments.arithmetic_mean,
        moments.geometric_mean,
        moments.std_dev,
        moments.skewness,
        moments.kurtosis
    );

    for regime in [Regime::Growth, Regime::Crisis] {
        let years: Vec<f64> = series
            .iter()
            .zip(&labels)
            .filter(|(_, label)| **label == regime)
            .map(|(r, _)| *r)
            .collect();
        if years.is_empty() {
            eprintln!("  regime={regime:?}  years=   0");
            continue;
        }
        let mean = years.iter().sum::<f64>() / years.len() as f64;
        let worst = years.iter().copied().fold(f64::INFINITY, f64::min);
        eprintln!(
            "  regime={:<7}  years={:>4}  mean={mean:.4}  worst={worst:.4}",
            format!("{regime:?}"),
            years.len()
        );
    }

    let detected = MarkovChain::estimate(&labels);
    eprintln!(
        "  stay probabilities: model growth={:.3} crisis={:.3}  detected growth={:.3} crisis={:.3}",
        params.chain.stay_growth, params.chain.stay_crisis, detected.stay_growth, detected.stay_crisis
    );
}
