/*!
 * Busguard CLI - Command Line Interface
 */

use anyhow::{Context, Result};
use busguard::{
    commands::{
        simulate::{run_simulation, SimulateOptions},
        validate::run_validate,
    },
    config::{BusguardConfig, LogLevel},
    error::{BusguardError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "busguard")]
#[command(version, long_about = None)]
#[command(about = "Resilient message-bus publishing with pooling, retry and failover")]
struct Cli {
    /// Log level (overrides the config file)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a configuration, apply BUSGUARD_* overrides and validate it
    Validate {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Publish synthetic messages through the pipeline against an in-memory broker
    Simulate {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Number of messages to publish
        #[arg(short = 'n', long, default_value = "100")]
        messages: usize,

        /// Topic or queue name
        #[arg(short, long, default_value = "simulated")]
        topic: String,

        /// Concurrent publishes
        #[arg(long, default_value = "8")]
        concurrency: usize,

        /// Take the primary namespace down
        #[arg(long)]
        primary_down: bool,

        /// Take the secondary namespace down
        #[arg(long)]
        secondary_down: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<BusguardError>()
                .map_or(EXIT_FATAL, BusguardError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let level = cli.log_level.map(LogLevel::from);

    match cli.command {
        Commands::Validate { config } => {
            logging::init_logging(&logging::settings_for(&config, level), cli.verbose)?;

            let rendered = run_validate(&config)?;
            println!("{}", rendered);
            Ok(EXIT_SUCCESS)
        }

        Commands::Simulate {
            config,
            messages,
            topic,
            concurrency,
            primary_down,
            secondary_down,
            json,
        } => {
            logging::init_logging(&logging::settings_for(&config, level), cli.verbose)?;
            let config = BusguardConfig::load(&config)?;

            let options = SimulateOptions {
                messages,
                topic,
                concurrency,
                primary_down,
                secondary_down,
            };

            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

            let report = runtime.block_on(async {
                let cancel = CancellationToken::new();
                let on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("Interrupted, cancelling in-flight publishes");
                        on_signal.cancel();
                    }
                });

                run_simulation(&config, &options, cancel).await
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }

            Ok(report.exit_code())
        }
    }
}
