use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use experiment_service::{EngineConfig, ExperimentFile, RunMatrixPlanner};

/// Validate an experiment file and print its run matrix
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the experiment YAML file
    pub experiment: PathBuf,

    /// Engine configuration (default: ~/.benchlab/engine.yaml)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let path = &args.experiment;

    if !path.exists() {
        color_eyre::eyre::bail!("Experiment file not found: {}", path.display());
    }

    output::status("Planning", &format!("{}", path.display()));

    let engine = EngineConfig::load(args.config.as_deref())?;
    let parts = ExperimentFile::load(path)?;
    output::check("Experiment file valid");

    let plan = match RunMatrixPlanner::plan(&parts.config, &engine.hyperparameters) {
        Ok(plan) => plan,
        Err(err) => {
            output::error(&format!("{} validation error(s):", err.errors.len()));
            for error in &err.errors {
                output::error(&format!("  - [{}] {}", error.path, error.message));
            }
            std::process::exit(1);
        }
    };

    output::check(&format!(
        "{}: {} model(s), {} run(s)",
        parts.name,
        parts.config.models.len(),
        plan.total_runs()
    ));
    println!();

    for spec in plan.runs() {
        println!(
            "  {:>4}  {:<24} {:<24} #{}",
            spec.index + 1,
            spec.model,
            spec.embedding_model.as_deref().unwrap_or("-"),
            spec.iteration
        );
    }

    if let Some(first) = plan.get(0) {
        println!();
        output::dim(&format!(
            "  temperature={} top_p={} top_k={} context_window={} max_tokens={}",
            first.hyperparameters.temperature.unwrap_or_default(),
            first.hyperparameters.top_p.unwrap_or_default(),
            first.hyperparameters.top_k.unwrap_or_default(),
            first.hyperparameters.context_window.unwrap_or_default(),
            first.hyperparameters.max_tokens.unwrap_or_default(),
        ));
    }

    Ok(())
}
