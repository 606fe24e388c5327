//! rangeguard CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use rangeguard::instrument::{FactCollector, InstrumentStats};
use rangeguard::mir::{Analyses, Interpreter, MirProgram, Outcome, Pipeline, format_mir};
use rangeguard::oracle::{FactTable, OracleProvider, ValueAnalysis};
use rangeguard::{InstrumentConfig, InstrumentError};

#[derive(Parser)]
#[command(name = "rangeguard")]
#[command(version, about = "Runtime checks for value-range facts", long_about = None)]
struct Cli {
    /// Log every instrumentation site
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Instrument every function of a MIR program
    Instrument {
        /// MIR program (JSON)
        file: PathBuf,
        /// Fact table taking precedence over the built-in analysis
        #[arg(long)]
        facts: Option<PathBuf>,
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output format
        #[arg(long, value_enum, default_value_t = Emit::Mir)]
        emit: Emit,
        /// Print statistics to stderr
        #[arg(long)]
        stats: bool,
    },
    /// List the facts that would be checked
    Facts {
        /// MIR program (JSON)
        file: PathBuf,
        /// Fact table taking precedence over the built-in analysis
        #[arg(long)]
        facts: Option<PathBuf>,
    },
    /// Run one function in the interpreter
    Run {
        /// MIR program (JSON)
        file: PathBuf,
        /// Function to run
        #[arg(long)]
        function: String,
        /// Instrument before running
        #[arg(long)]
        instrument: bool,
        /// Fact table taking precedence over the built-in analysis
        #[arg(long)]
        facts: Option<PathBuf>,
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Arguments (decimal, negative, or 0x-prefixed hex)
        #[arg(last = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Emit {
    Mir,
    Json,
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Instrument {
            file,
            facts,
            config,
            emit,
            stats,
        } => instrument_file(&file, facts.as_deref(), config.as_deref(), emit, stats),
        Command::Facts { file, facts } => list_facts(&file, facts.as_deref()),
        Command::Run {
            file,
            function,
            instrument,
            facts,
            config,
            args,
        } => run_function(&file, &function, instrument, facts.as_deref(), config.as_deref(), &args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// The fact table when given, backed by the built-in analysis
fn load_provider(facts: Option<&Path>) -> rangeguard::Result<Box<dyn OracleProvider>> {
    match facts {
        Some(path) => Ok(Box::new(FactTable::load(path)?.with_fallback(ValueAnalysis::new()))),
        None => Ok(Box::new(ValueAnalysis::new())),
    }
}

fn load_config(path: Option<&Path>) -> rangeguard::Result<InstrumentConfig> {
    match path {
        Some(path) => InstrumentConfig::load(path),
        None => Ok(InstrumentConfig::new()),
    }
}

fn run_pipeline(
    program: &mut MirProgram,
    provider: &dyn OracleProvider,
    config: &InstrumentConfig,
    stats: &Arc<InstrumentStats>,
) -> rangeguard::Result<()> {
    let pipeline = Pipeline::standard(config, stats);
    let analyses = Analyses::new().with_value_ranges(provider);
    let result = pipeline.run(program, &analyses)?;
    tracing::info!(functions = result.functions, passes = ?result.pass_counts, "pipeline finished");
    Ok(())
}

fn instrument_file(file: &Path, facts: Option<&Path>, config: Option<&Path>, emit: Emit, show_stats: bool) -> CliResult {
    let mut program = MirProgram::load(file)?;
    let config = load_config(config)?;
    let provider = load_provider(facts)?;
    let stats = Arc::new(InstrumentStats::new());

    run_pipeline(&mut program, provider.as_ref(), &config, &stats)?;

    match emit {
        Emit::Mir => print!("{}", format_mir(&program)),
        Emit::Json => println!("{}", serde_json::to_string_pretty(&program)?),
    }
    if show_stats {
        eprint!("{}", stats.report());
    }
    Ok(())
}

fn list_facts(file: &Path, facts: Option<&Path>) -> CliResult {
    let program = MirProgram::load(file)?;
    let provider = load_provider(facts)?;
    let stats = InstrumentStats::new();
    let collector = FactCollector::new(&stats);

    for func in &program.functions {
        let oracle = provider.oracle_for(func)?;
        for fact in collector.collect(func, oracle.as_ref())? {
            println!(
                "{} {}: {} {} {}",
                func.name, fact.location, fact.range, fact.known, fact.text
            );
        }
    }
    Ok(())
}

fn run_function(
    file: &Path,
    function: &str,
    instrument: bool,
    facts: Option<&Path>,
    config: Option<&Path>,
    args: &[String],
) -> CliResult {
    let mut program = MirProgram::load(file)?;
    let config = load_config(config)?;
    if instrument {
        let provider = load_provider(facts)?;
        run_pipeline(&mut program, provider.as_ref(), &config, &Arc::new(InstrumentStats::new()))?;
    }

    let func = program.function(function).ok_or_else(|| InstrumentError::UnknownFunction {
        name: function.to_string(),
    })?;
    let args = args.iter().map(|a| parse_arg(a)).collect::<Result<Vec<_>, _>>()?;

    let interp = Interpreter::for_program(&program).with_step_limit(config.step_limit);
    match interp.run(func, &args)? {
        Outcome::Returned(Some(value)) => println!("returned {value}"),
        Outcome::Returned(None) => println!("returned"),
        Outcome::Trapped { block, from: Some(from) } => println!("trapped in {block} (from {from})"),
        Outcome::Trapped { block, from: None } => println!("trapped in {block}"),
    }
    Ok(())
}

/// Parse an argument into a bit pattern
fn parse_arg(arg: &str) -> Result<u64, String> {
    let parsed = if let Some(hex) = arg.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if arg.starts_with('-') {
        arg.parse::<i64>().ok().map(|v| v as u64)
    } else {
        arg.parse::<u64>().ok()
    };
    parsed.ok_or_else(|| format!("invalid argument `{arg}`"))
}
