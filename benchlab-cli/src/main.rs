mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::plan::PlanArgs;
use commands::run::RunArgs;

/// Log filter variable, e.g. `BENCHLAB_LOG=experiment_service=debug`
const LOG_ENV: &str = "BENCHLAB_LOG";

/// Benchmark LLMs across models, retrieval contexts and iterations
#[derive(Parser, Debug)]
#[command(name = "benchlab", version, about)]
struct Cli {
    /// Show debug logs
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate an experiment file and print its run matrix
    Plan(PlanArgs),

    /// Execute an experiment
    Run(RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Plan(args) => commands::plan::execute(args),
        Commands::Run(args) => commands::run::execute(args).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
