use std::fs::File;
use std::io::BufWriter;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};

use fireplan::analysis::{RuinSurface, SequenceRiskBucket};
use fireplan::config::{ScenarioFile, SimulationMode};
use fireplan::error::{SimError, SimResult};
use fireplan::simulation::{Simulation, SimulationOutput};
use log::error;

struct Args {
    input_path: Option<String>,
    output_path: String,
    seed_override: Option<String>,
    paths_override: Option<String>,
    mode_override: Option<String>,
    quiet: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        input_path: None,
        output_path: "result.json".to_string(),
        seed_override: None,
        paths_override: None,
        mode_override: None,
        quiet: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                i += 1;
                parsed.input_path = Some(args[i].clone());
            }
            "--output" => {
                i += 1;
                parsed.output_path = args[i].clone();
            }
            "--seed" => {
                i += 1;
                parsed.seed_override = Some(args[i].clone());
            }
            "--paths" => {
                i += 1;
                parsed.paths_override = Some(args[i].clone());
            }
            "--mode" => {
                i += 1;
                parsed.mode_override = Some(args[i].clone());
            }
            "--quiet" => parsed.quiet = true,
            _ => {}
        }
        i += 1;
    }
    parsed
}

fn main() -> ExitCode {
    let args = parse_args();
    let default_filter = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> SimResult<()> {
    let mut scenario = match &args.input_path {
        Some(path) => ScenarioFile::load(path)?,
        None => ScenarioFile::canonical(),
    };
    if let Some(seed) = &args.seed_override {
        let seed = seed
            .parse::<u64>()
            .map_err(|e| SimError::InvalidInput { field: "seed", reason: format!("{seed:?}: {e}") })?;
        scenario.input.seed = Some(seed);
    }
    if let Some(paths) = &args.paths_override {
        scenario.input.simulations = paths
            .parse::<usize>()
            .map_err(|e| SimError::InvalidInput { field: "simulations", reason: format!("{paths:?}: {e}") })?;
    }
    if let Some(mode) = &args.mode_override {
        scenario.input.mode = mode.parse::<SimulationMode>()?;
    }

    let months = scenario.months();
    let retire_month = scenario.retire_month();
    let last_decile = AtomicU32::new(0);
    let quiet = args.quiet;
    let output = Simulation::from_input(scenario.input, scenario.schedules, months, retire_month)?
        .with_progress(move |fraction| {
            let decile = (fraction * 10.0).floor() as u32;
            if !quiet && last_decile.fetch_max(decile, Ordering::Relaxed) < decile {
                eprint!("\rprogress: {:>3.0}%", fraction * 100.0);
            }
        })
        .run()?;
    if !quiet {
        eprintln!();
    }

    let file = File::create(&args.output_path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &output)?;

    if !args.quiet {
        println!("Result written to {}", args.output_path);
        print_summary(&output);
        print_balance_bands(&output);
        print_sequence_risk(&output.stats.sequence_risk);
        print_ruin_surface(&output.stats.ruin_surface);
    }
    Ok(())
}

fn print_summary(output: &SimulationOutput) {
    let s = &output.stats;
    println!("\n=== Summary (N={} paths, seed {}) ===", output.sim_count, output.seed);
    println!("  Success probability:        {:>6.1}%", s.success_probability * 100.0);
    println!("  FI target (95% success):    {:>12.0}", s.fi_target_p95);
    println!("  FI target (SWR):            {:>12.0}", s.fi_target_swr);
    println!("  P(reach FI target, 95%):    {:>6.1}%", s.fi_probability_p95 * 100.0);
    println!("  P(reach FI target, SWR):    {:>6.1}%", s.fi_probability_swr * 100.0);
    println!(
        "  Balance at retirement:      {:>12.0} | {:>12.0} | {:>12.0}  (P10 | P50 | P90)",
        s.retire_low, s.retire_median, s.retire_high
    );
    println!(
        "  Final balance:              {:>12.0} | {:>12.0} | {:>12.0}",
        s.final_low, s.final_median, s.final_high
    );
    println!(
        "  Shortfall:                  {:>12.0} | {:>12.0} | {:>12.0}",
        s.shortfall_low, s.shortfall_median, s.shortfall_high
    );
    println!(
        "  Years depleted:             {:>12.1} | {:>12.1} | {:>12.1}",
        s.depleted_years_low, s.depleted_years_median, s.depleted_years_high
    );
    let m = &s.return_moments;
    println!(
        "  Calibration returns:        mean {:.2}%  geo {:.2}%  std {:.2}%  skew {:.2}  kurt {:.2}",
        m.arithmetic_mean * 100.0,
        m.geometric_mean * 100.0,
        m.std_dev * 100.0,
        m.skewness,
        m.kurtosis
    );
}

fn print_balance_bands(output: &SimulationOutput) {
    let sim = &output.simulation;
    let p = &sim.percentiles;
    println!("\n=== Real balance by age ===");
    println!(
        "{:>6} | {:>12} | {:>12} | {:>12} | {:>12} | {:>12}",
        "Age", "P10", "P25", "P50", "P75", "P90"
    );
    println!("{}", "-".repeat(6 + 5 * 15));
    for m in (0..sim.months as usize).step_by(60) {
        println!(
            "{:>6.1} | {:>12.0} | {:>12.0} | {:>12.0} | {:>12.0} | {:>12.0}",
            sim.ages[m], p.p10[m], p.p25[m], p.p50[m], p.p75[m], p.p90[m]
        );
    }
}

fn print_sequence_risk(buckets: &[SequenceRiskBucket]) {
    println!("\n=== Sequence-of-returns risk ===");
    println!("{:<26} | {:>10} | {:>8} | {:>12}", "Bucket", "Early ret%", "Ruin%", "Ending P50");
    for b in buckets {
        println!(
            "{:<26} | {:>9.2}% | {:>7.1}% | {:>12.0}",
            b.bucket_label,
            b.early_years_mean_return * 100.0,
            b.ruin_probability * 100.0,
            b.ending_median
        );
    }
}

fn print_ruin_surface(surface: &RuinSurface) {
    println!("\n=== Ruin probability (spending × retirement age) ===");
    print!("{:>8}", "Spend");
    for age in &surface.retirement_ages {
        print!(" | {:>6}", age);
    }
    println!();
    for (multiplier, row) in surface.spending_multipliers.iter().zip(&surface.ruin_probabilities) {
        print!("{:>7.0}%", multiplier * 100.0);
        for p in row {
            print!(" | {:>5.1}%", p * 100.0);
        }
        println!();
    }
}
