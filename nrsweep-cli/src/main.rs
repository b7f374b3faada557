//! nrsweep CLI: simulator parameter sweeps and result aggregation.
//!
//! Commands:
//! - `random`: run N randomly sampled configurations
//! - `grid`: run the filtered grid, optionally with fixed parameters and repeats
//! - `aggregate`: average the raw store per configuration and relabel codes
//! - `preset`: print a built-in sweep config as TOML

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::{fmt, EnvFilter};

use nrsweep_core::aggregate::Aggregator;
use nrsweep_core::param::ParamValue;
use nrsweep_runner::{ShellExecutor, SweepConfig, SweepDriver, SweepProgress, SweepReport, PRESET_NAMES};

#[derive(Parser)]
#[command(
    name = "nrsweep",
    about = "Parameter sweeps over an ns-3 NR simulation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the sweep config comes from.
#[derive(clap::Args)]
struct Source {
    /// Path to a TOML sweep config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in preset: nr-test01, nr-test02.
    #[arg(long)]
    preset: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run randomly sampled configurations.
    Random {
        #[command(flatten)]
        source: Source,

        /// Number of trials. Defaults to the config's `sweep.trials`.
        #[arg(long)]
        trials: Option<usize>,

        /// RNG seed. Defaults to the config's `sweep.seed`, else random.
        #[arg(long)]
        seed: Option<u64>,

        /// Override the raw result store path.
        #[arg(long)]
        results: Option<PathBuf>,

        /// Print the sweep report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run every configuration of the filtered grid.
    Grid {
        #[command(flatten)]
        source: Source,

        /// Hold a parameter constant (repeatable), e.g. --fix gNbNum=1.
        #[arg(long = "fix", value_parser = parse_fix)]
        fix: Vec<(String, ParamValue)>,

        /// Ignore the config's `sweep.fixed` table.
        #[arg(long, default_value_t = false)]
        clear_fixed: bool,

        /// Runs per configuration. Defaults to the config's `sweep.repeats`.
        #[arg(long)]
        repeats: Option<usize>,

        /// Override the raw result store path.
        #[arg(long)]
        results: Option<PathBuf>,

        /// Print the sweep report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Average the raw store per configuration and write the processed file.
    Aggregate {
        #[command(flatten)]
        source: Source,

        /// Raw store to read. Defaults to the config's `output.results`.
        #[arg(long)]
        input: Option<PathBuf>,

        /// File to write. Defaults to the config's `output.aggregated`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Do not echo the table to stdout.
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
    /// Print a built-in preset as TOML.
    Preset {
        /// Preset name. Omit to list available presets.
        name: Option<String>,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Random {
            source,
            trials,
            seed,
            results,
            json,
        } => run_random_cmd(source, trials, seed, results, json),
        Commands::Grid {
            source,
            fix,
            clear_fixed,
            repeats,
            results,
            json,
        } => run_grid_cmd(source, fix, clear_fixed, repeats, results, json),
        Commands::Aggregate {
            source,
            input,
            output,
            quiet,
        } => run_aggregate_cmd(source, input, output, quiet),
        Commands::Preset { name } => run_preset_cmd(name),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(source: Source) -> Result<SweepConfig> {
    match (source.config, source.preset) {
        (Some(_), Some(_)) => bail!("--config and --preset are mutually exclusive"),
        (None, None) => bail!("one of --config or --preset is required"),
        (Some(path), None) => SweepConfig::from_file(&path)
            .with_context(|| format!("loading sweep config {}", path.display())),
        (None, Some(name)) => SweepConfig::preset(&name).ok_or_else(|| {
            anyhow!(
                "unknown preset '{name}' (available: {})",
                PRESET_NAMES.join(", ")
            )
        }),
    }
}

/// Ctrl-C asks the sweep to stop after the current trial; a second one exits.
fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        if interrupt(&flag) {
            std::process::exit(130);
        }
        eprintln!("Interrupted: finishing the current trial (Ctrl-C again to abort)");
    })
    .context("installing Ctrl-C handler")?;
    Ok(cancel)
}

/// Raise the cancel flag. True when it was already raised.
fn interrupt(flag: &AtomicBool) -> bool {
    flag.swap(true, Ordering::SeqCst)
}

/// Parse `name=value` for `--fix`.
fn parse_fix(s: &str) -> Result<(String, ParamValue), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let name = name.trim().trim_start_matches("--");
    if name.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    let value = ParamValue::parse(value).ok_or_else(|| format!("'{value}' is not a number"))?;
    Ok((name.to_string(), value))
}

fn print_progress(p: &SweepProgress) {
    let total = p.total.map_or_else(|| "?".to_string(), |t| t.to_string());
    eprintln!(
        "[{}/{}] {} (ok {}, failed {})",
        p.trial, total, p.assignment, p.succeeded, p.failed
    );
}

fn print_report(report: &SweepReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Sweep finished{}", if report.cancelled { " (cancelled)" } else { "" });
    println!("  Store:     {}", report.store.display());
    println!("  Attempted: {}", report.attempted);
    println!("  Succeeded: {}", report.succeeded);
    println!("  Failed:    {}", report.failed_count());
    for f in &report.failed {
        println!("    #{} {}: {}", f.trial, f.assignment, f.error);
    }
    println!("  Elapsed:   {:.1}s", report.elapsed_secs);
    Ok(())
}

fn run_random_cmd(
    source: Source,
    trials: Option<usize>,
    seed: Option<u64>,
    results: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut config = load_config(source)?;
    if let Some(path) = results {
        config.output.results = path;
    }
    let trials = trials.unwrap_or(config.sweep.trials);
    let seed = seed.or(config.sweep.seed).unwrap_or_else(rand::random);
    tracing::info!(seed, "random sweep seed");

    let executor = ShellExecutor::from_config(&config.simulator);
    let mut driver = SweepDriver::from_config(&config, executor)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let cancel = install_interrupt_handler()?;
    let report = driver.run_random(trials, &mut rng, Some(&print_progress), Some(&*cancel))?;
    print_report(&report, json)
}

fn run_grid_cmd(
    source: Source,
    fix: Vec<(String, ParamValue)>,
    clear_fixed: bool,
    repeats: Option<usize>,
    results: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut config = load_config(source)?;
    if let Some(path) = results {
        config.output.results = path;
    }

    let mut fixed: BTreeMap<String, ParamValue> = if clear_fixed {
        BTreeMap::new()
    } else {
        config.sweep.fixed.clone()
    };
    fixed.extend(fix);
    let repeats = repeats.unwrap_or(config.sweep.repeats);

    let executor = ShellExecutor::from_config(&config.simulator);
    let mut driver = SweepDriver::from_config(&config, executor)?;
    let cancel = install_interrupt_handler()?;
    let report = driver
        .run_grid(&fixed, repeats, Some(&print_progress), Some(&*cancel))
        .context("grid sweep aborted")?;
    print_report(&report, json)
}

fn run_aggregate_cmd(
    source: Source,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let config = load_config(source)?;
    let input = input.unwrap_or_else(|| config.output.results.clone());
    let output = output.unwrap_or_else(|| config.output.aggregated.clone());

    let aggregator = Aggregator::new(config.layout(), config.aggregate.clone());
    let table = aggregator
        .run(&input, &output)
        .with_context(|| format!("aggregating {}", input.display()))?;

    if !quiet {
        print!("{}", table.to_csv_string()?);
    }
    eprintln!(
        "Wrote {} configurations to {}",
        table.rows.len(),
        output.display()
    );
    Ok(())
}

fn run_preset_cmd(name: Option<String>) -> Result<()> {
    let Some(name) = name else {
        for name in PRESET_NAMES {
            println!("{name}");
        }
        return Ok(());
    };
    let config = SweepConfig::preset(&name).ok_or_else(|| {
        anyhow!(
            "unknown preset '{name}' (available: {})",
            PRESET_NAMES.join(", ")
        )
    })?;
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_parses_ints_and_floats() {
        assert_eq!(
            parse_fix("gNbNum=1").unwrap(),
            ("gNbNum".to_string(), ParamValue::Int(1))
        );
        assert_eq!(
            parse_fix("--gnbPower=42.5").unwrap(),
            ("gnbPower".to_string(), ParamValue::Float(42.5))
        );
        assert!(parse_fix("gNbNum").is_err());
        assert!(parse_fix("=1").is_err());
        assert!(parse_fix("gNbNum=DL").is_err());
    }

    #[test]
    fn second_interrupt_requests_exit() {
        let flag = AtomicBool::new(false);
        assert!(!interrupt(&flag));
        assert!(flag.load(Ordering::SeqCst));
        assert!(interrupt(&flag));
    }

    #[test]
    fn config_and_preset_are_mutually_exclusive() {
        let both = Source {
            config: Some(PathBuf::from("sweep.toml")),
            preset: Some("nr-test01".into()),
        };
        assert!(load_config(both).is_err());
        let neither = Source {
            config: None,
            preset: None,
        };
        assert!(load_config(neither).is_err());
    }

    #[test]
    fn unknown_preset_lists_available_ones() {
        let err = load_config(Source {
            config: None,
            preset: Some("nope".into()),
        })
        .unwrap_err();
        assert!(err.to_string().contains("nr-test01, nr-test02"));
    }

    #[test]
    fn cli_parses_repeated_fix() {
        let cli = Cli::try_parse_from([
            "nrsweep", "grid", "--preset", "nr-test01", "--fix", "gNbNum=7", "--fix", "ueNum=4",
            "--repeats", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Grid { fix, repeats, .. } => {
                assert_eq!(fix.len(), 2);
                assert_eq!(repeats, Some(2));
            }
            _ => panic!("expected grid command"),
        }
    }
}
