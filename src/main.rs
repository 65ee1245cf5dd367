/*!
 * Ward CLI - inspect and exercise resilience policies
 */

use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use ward::{
    config::{LogLevel, WardConfig},
    error::{Result, WardError, EXIT_SUCCESS},
    logging,
    resilience::{Context, ResilienceError},
    Guard, GuardSnapshot,
};

#[derive(Parser)]
#[command(name = "ward")]
#[command(version, about = "Circuit breakers, rate limits and retries from a policy file", long_about = None)]
struct Cli {
    /// Log level (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stderr
    #[arg(long = "log", value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a policy file
    Validate {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Print the resolved policy, defaults filled in, as TOML
    Show {
        /// Policy file; a preset or the defaults when omitted
        #[arg(value_name = "CONFIG")]
        config: Option<PathBuf>,

        #[arg(long, value_enum, conflicts_with = "config")]
        preset: Option<PresetArg>,
    },

    /// Drive a simulated flaky dependency through a guard and print the outcome as JSON
    Simulate {
        #[arg(short, long, value_name = "CONFIG")]
        config: Option<PathBuf>,

        /// Dependency name, selects the breaker and its override
        #[arg(short, long, default_value = "simulated")]
        dependency: String,

        /// Number of calls to make
        #[arg(short = 'n', long, default_value = "100")]
        calls: u32,

        /// Probability that a single attempt fails
        #[arg(short, long, default_value = "0.3", value_parser = parse_probability)]
        fail_rate: f64,

        /// Client key charged against the per-client limit
        #[arg(long)]
        client: Option<String>,

        /// Pause between calls in milliseconds
        #[arg(long, default_value = "10")]
        interval_ms: u64,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PresetArg {
    Strict,
    Lenient,
}

fn parse_probability(value: &str) -> std::result::Result<f64, String> {
    let p: f64 = value
        .parse()
        .map_err(|e| format!("`{}` is not a number: {}", value, e))?;
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(format!("{} is outside 0.0..=1.0", p))
    }
}

#[derive(Debug, Error)]
#[error("simulated failure")]
struct SimulatedFailure;

#[derive(Debug, Default, Serialize)]
struct Outcomes {
    succeeded: u32,
    failed: u32,
    circuit_open: u32,
    too_many_requests: u32,
    rate_limited: u32,
    interrupted: u32,
}

impl Outcomes {
    fn record<T>(&mut self, result: &std::result::Result<T, ResilienceError<SimulatedFailure>>) {
        match result {
            Ok(_) => self.succeeded += 1,
            Err(ResilienceError::Inner(_)) => self.failed += 1,
            Err(ResilienceError::CircuitOpen) => self.circuit_open += 1,
            Err(ResilienceError::TooManyRequests) => self.too_many_requests += 1,
            Err(ResilienceError::RateLimited) => self.rate_limited += 1,
            Err(ResilienceError::Timeout | ResilienceError::Cancelled) => self.interrupted += 1,
        }
    }
}

#[derive(Serialize)]
struct SimulationReport {
    dependency: String,
    calls: u32,
    outcomes: Outcomes,
    snapshot: GuardSnapshot,
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { ref config } => {
            let loaded = load(Some(config.as_path()))?;
            loaded.validate()?;
            println!("{}: ok", config.display());
            Ok(())
        }
        Commands::Show {
            ref config,
            preset,
        } => {
            let loaded = match preset {
                Some(PresetArg::Strict) => WardConfig::strict_preset(),
                Some(PresetArg::Lenient) => WardConfig::lenient_preset(),
                None => load(config.as_deref())?,
            };
            print!("{}", loaded.to_toml()?);
            Ok(())
        }
        Commands::Simulate {
            ref config,
            ref dependency,
            calls,
            fail_rate,
            ref client,
            interval_ms,
        } => {
            let loaded = load(config.as_deref())?;
            init_logging(&cli, &loaded);

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(WardError::Runtime)?;

            let report = runtime.block_on(simulate(
                &loaded,
                dependency,
                client.as_deref(),
                calls,
                fail_rate,
                Duration::from_millis(interval_ms),
            ))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn load(path: Option<&Path>) -> Result<WardConfig> {
    match path {
        Some(path) => WardConfig::from_file(path),
        None => Ok(WardConfig::default()),
    }
}

fn init_logging(cli: &Cli, config: &WardConfig) {
    let mut log_config = config.logging.clone();
    if let Some(level) = cli.log_level {
        log_config.level = level.into();
    }
    if cli.log_file.is_some() {
        log_config.file = cli.log_file.clone();
    }
    log_config.verbose |= cli.verbose;

    if let Err(e) = logging::init_logging(&log_config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }
}

async fn simulate(
    config: &WardConfig,
    dependency: &str,
    client: Option<&str>,
    calls: u32,
    fail_rate: f64,
    interval: Duration,
) -> Result<SimulationReport> {
    let guard = Guard::from_config(config)?;
    let observer = guard.spawn_observer();
    let ctx = Context::background();
    let mut outcomes = Outcomes::default();

    info!(dependency, calls, fail_rate, "Starting simulation");

    for _ in 0..calls {
        let result = guard
            .call(&ctx, dependency, client, |_| async move {
                if rand::rng().random_bool(fail_rate) {
                    Err(SimulatedFailure)
                } else {
                    Ok(())
                }
            })
            .await;
        outcomes.record(&result);

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    // Let the observer drain pending transitions before the snapshot
    tokio::task::yield_now().await;
    let snapshot = guard.snapshot();
    info!(
        succeeded = outcomes.succeeded,
        failed = outcomes.failed,
        trips = snapshot.trips,
        "Simulation finished"
    );

    guard.shutdown();
    drop(guard);
    let _ = observer.await;

    Ok(SimulationReport {
        dependency: dependency.to_string(),
        calls,
        outcomes,
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["ward", "validate", "policy.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Validate { .. }));

        let cli = Cli::try_parse_from([
            "ward",
            "simulate",
            "--dependency",
            "db",
            "--calls",
            "5",
            "--fail-rate",
            "1.0",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Simulate {
                dependency, calls, ..
            } => {
                assert_eq!(dependency, "db");
                assert_eq!(calls, 5);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_fail_rate_must_be_probability() {
        assert!(Cli::try_parse_from(["ward", "simulate", "--fail-rate", "1.5"]).is_err());
        assert!(parse_probability("0.25").is_ok());
        assert!(parse_probability("abc").is_err());
    }

    #[test]
    fn test_show_preset_conflicts_with_config() {
        assert!(
            Cli::try_parse_from(["ward", "show", "policy.toml", "--preset", "strict"]).is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_all_failures_trips_breaker() {
        let report = simulate(
            &WardConfig::default(),
            "db",
            None,
            10,
            1.0,
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(report.outcomes.succeeded, 0);
        assert!(report.outcomes.circuit_open > 0);
        assert_eq!(report.snapshot.trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_no_failures() {
        let report = simulate(
            &WardConfig::default(),
            "db",
            Some("tester"),
            5,
            0.0,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(report.outcomes.succeeded, 5);
        assert_eq!(report.snapshot.tracked_clients, 1);
    }
}
