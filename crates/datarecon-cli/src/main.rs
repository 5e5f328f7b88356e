//! datarecon CLI - row-level reconciliation between MSSQL and PostgreSQL.

use clap::{Parser, Subcommand, ValueEnum};
use datarecon::core::TypeClass;
use datarecon::{Config, OutputMode, ReconcileError, RunResult, TypeCompatibilityResolver};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "datarecon")]
#[command(about = "Row-level data reconciliation between MSSQL and PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the configured tables
    Run {
        /// Only reconcile these source tables (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Override rows fetched per page
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override where reports are written
        #[arg(long, value_enum)]
        output_mode: Option<OutputModeArg>,

        /// Override the report directory
        #[arg(long)]
        output_path: Option<PathBuf>,

        /// Compare text values case-insensitively
        #[arg(long)]
        case_insensitive: bool,
    },

    /// Show how declared column types are classified and which pairs compare
    CheckTypes {
        /// Declared type names, e.g. "varchar(10)" int4
        #[arg(required = true)]
        types: Vec<String>,
    },

    /// Test database connections
    HealthCheck,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputModeArg {
    File,
    Table,
    Both,
}

impl From<OutputModeArg> for OutputMode {
    fn from(arg: OutputModeArg) -> Self {
        match arg {
            OutputModeArg::File => OutputMode::File,
            OutputModeArg::Table => OutputMode::Table,
            OutputModeArg::Both => OutputMode::Both,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, ReconcileError> {
    let cli = Cli::parse();

    // Type checks never connect, so they work without a config file
    if let Commands::CheckTypes { types } = &cli.command {
        let resolver = load_resolver(&cli.config)?;
        check_types(&resolver, types, cli.output_json)?;
        return Ok(0);
    }

    setup_logging(&cli.verbosity, &cli.log_format).map_err(ReconcileError::Config)?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler(cli.shutdown_timeout);

    match cli.command {
        Commands::CheckTypes { .. } => unreachable!(), // Handled above
        Commands::Run {
            tables,
            batch_size,
            output_mode,
            output_path,
            case_insensitive,
        } => {
            if !tables.is_empty() {
                filter_tables(&mut config, &tables)?;
            }
            if let Some(size) = batch_size {
                config.reconcile.batch_size = Some(size);
            }
            if let Some(mode) = output_mode {
                config.output.mode = mode.into();
            }
            if let Some(path) = output_path {
                config.output.path = path;
            }
            if case_insensitive {
                config.reconcile.case_insensitive = true;
            }
            config.validate()?;

            let orchestrator = datarecon::Orchestrator::new(config).with_progress(cli.progress);
            let result = orchestrator.run(cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_result(&result);
            }
            Ok(result.exit_code())
        }

        Commands::HealthCheck => {
            let orchestrator = datarecon::Orchestrator::new(config);
            let result = orchestrator.health_check().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                let config = orchestrator.config();
                println!("Health Check Results:");
                println!(
                    "  Source ({}): {} ({}ms)",
                    config.source.r#type,
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target ({}): {} ({}ms)",
                    config.target.r#type,
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(ReconcileError::fatal("health-check", "a database is unreachable"));
            }
            Ok(0)
        }
    }
}

/// Keep only the table entries named on the command line.
fn filter_tables(config: &mut Config, wanted: &[String]) -> Result<(), ReconcileError> {
    let matches = |source: &str| {
        wanted.iter().any(|w| {
            source.eq_ignore_ascii_case(w)
                || source
                    .rsplit('.')
                    .next()
                    .is_some_and(|name| name.eq_ignore_ascii_case(w))
        })
    };
    config.tables.retain(|t| matches(&t.source));
    if config.tables.is_empty() {
        return Err(ReconcileError::Config(format!(
            "no configured table matches --table {}",
            wanted.join(", ")
        )));
    }
    Ok(())
}

/// Resolver with the config's type rules, or the built-in tables when the
/// config file does not exist.
fn load_resolver(path: &Path) -> Result<TypeCompatibilityResolver, ReconcileError> {
    if !path.exists() {
        return Ok(TypeCompatibilityResolver::new());
    }
    let config = Config::load(path)?;
    TypeCompatibilityResolver::with_rules(&config.reconcile.type_rules)
}

fn check_types(
    resolver: &TypeCompatibilityResolver,
    types: &[String],
    as_json: bool,
) -> Result<(), ReconcileError> {
    let classes: Vec<(&str, TypeClass)> = types
        .iter()
        .map(|t| (t.as_str(), resolver.resolve(t)))
        .collect();

    let mut pairs = Vec::new();
    for (i, (a, class_a)) in classes.iter().enumerate() {
        for (b, class_b) in &classes[i + 1..] {
            pairs.push((*a, *b, resolver.comparison_class(*class_a, *class_b)));
        }
    }

    if as_json {
        let value = json!({
            "types": classes
                .iter()
                .map(|(t, c)| json!({ "type": t, "class": c }))
                .collect::<Vec<_>>(),
            "pairs": pairs
                .iter()
                .map(|(a, b, cmp)| json!({
                    "a": a,
                    "b": b,
                    "compatible": cmp.is_some(),
                    "compare_as": cmp,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let width = types.iter().map(|t| t.len()).max().unwrap_or(0);
    println!("Type classes:");
    for (t, class) in &classes {
        println!("  {:<width$}  {}", t, class, width = width);
    }
    if !pairs.is_empty() {
        println!("\nCompatibility:");
        for (a, b, cmp) in &pairs {
            match cmp {
                Some(class) => println!("  {} vs {}: compatible (compared as {})", a, b, class),
                None => println!("  {} vs {}: incompatible", a, b),
            }
        }
    }
    Ok(())
}

fn print_result(result: &RunResult) {
    println!("\nReconciliation {}!", result.status);
    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Tables: {}/{} clean, {} with differences, {} failed",
        result.tables_clean,
        result.tables_total,
        result.tables_with_differences,
        result.tables_failed
    );
    println!("  Rows compared: {}", result.rows_compared);
    println!("  Matched: {}", result.rows_matched);
    println!("  Mismatched: {}", result.rows_mismatched);
    println!("  Missing: {}", result.rows_missing);
    if result.data_errors > 0 {
        println!("  Data errors: {}", result.data_errors);
    }
    if !result.failed_tables.is_empty() {
        println!("  Failed tables: {:?}", result.failed_tables);
    }
    if !result.failed_sinks.is_empty() {
        println!("  Failed sinks: {:?}", result.failed_sinks);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// The reconciler finishes the row in hand, flushes the reporter and
/// writes a Cancelled summary before exiting.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("could not install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
            tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
            eprintln!("Shutdown timeout elapsed, exiting");
            std::process::exit(i32::from(datarecon::error::EXIT_CANCELLED));
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
        std::process::exit(i32::from(datarecon::error::EXIT_CANCELLED));
    });

    cancel_token
}
