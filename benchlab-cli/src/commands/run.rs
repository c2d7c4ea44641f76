use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;
use tokio_stream::StreamExt;
use tracing::debug;

use experiment_service::store::jsonl::DEFAULT_RESULTS_FILE;
use experiment_service::{
    DocumentLibrary, EngineConfig, ExperimentFile, ExperimentService, ExperimentStatus,
    InferenceClient, JsonlRunStore, MockInferenceClient, OllamaClient, ProgressEvent, ServiceError,
};

/// Execute an experiment against the inference service
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the experiment YAML file
    pub experiment: PathBuf,

    /// Engine configuration (default: ~/.benchlab/engine.yaml)
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Results file, appended as JSON Lines
    #[arg(long, short = 'o', value_name = "FILE", default_value = DEFAULT_RESULTS_FILE)]
    pub output: PathBuf,

    /// Use the built-in mock client instead of Ollama
    #[arg(long)]
    pub mock: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let path = &args.experiment;

    if !path.exists() {
        color_eyre::eyre::bail!("Experiment file not found: {}", path.display());
    }

    output::status("Loading", &format!("{}", path.display()));
    let engine = EngineConfig::load(args.config.as_deref())?;
    let parts = ExperimentFile::load(path)?;
    debug!(
        workers = engine.pool.workers,
        queue_capacity = engine.pool.queue_capacity,
        max_attempts = engine.retry.max_attempts,
        base_url = %engine.inference.base_url,
        "engine configuration loaded"
    );

    let library = Arc::new(DocumentLibrary::new());
    if let Some((id, text)) = &parts.document {
        library.insert(id.clone(), text.clone());
        output::info(&format!("Document '{}' ({} chars)", id, text.chars().count()));
    }

    let client: Arc<dyn InferenceClient> = if args.mock {
        output::warning("Using mock inference client");
        Arc::new(MockInferenceClient::new())
    } else {
        output::info(&format!("Inference service at {}", engine.inference.base_url));
        Arc::new(OllamaClient::from_config(&engine.inference)?)
    };

    let store = Arc::new(JsonlRunStore::open(&args.output)?);
    let service = ExperimentService::new(&engine, client, store, library)?;

    let name = parts.name.clone();
    let experiment = service.create_experiment(&name, parts.config).await?;
    let id = experiment.id;
    let mut events = service.subscribe(id).into_stream();

    let plan = match service.start(id).await {
        Ok(plan) => plan,
        Err(ServiceError::Plan(err)) => {
            output::error(&format!("{} validation error(s):", err.errors.len()));
            for error in &err.errors {
                output::error(&format!("  - [{}] {}", error.path, error.message));
            }
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    output::header(&format!("{} ({} runs)", name, plan.total_runs()));

    let mut interrupts = 0;
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(envelope) => print_event(&envelope.event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts > 1 {
                    output::error("Interrupted");
                    std::process::exit(130);
                }
                output::warning("Cancelling after the current run (Ctrl-C again to exit)");
                if let Err(err) = service.cancel(id).await {
                    output::warning(&format!("Cancel failed: {}", err));
                }
            }
        }
    }

    let report = service.status(id).await?;
    output::inference_stats(&service.gateway().metrics());
    service.shutdown().await;

    output::dim(&format!("  Results written to {}", args.output.display()));
    if report.status == ExperimentStatus::Failed {
        output::failure(&format!("Experiment {} ended {}", name, report.status));
        std::process::exit(1);
    }
    output::success(&format!("Experiment {} {}", name, report.status));

    Ok(())
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::RunStarted(run) => output::run_started(run),
        ProgressEvent::RunCompleted(run) => output::run_completed(run),
        ProgressEvent::Progress(progress) => output::progress(progress),
        ProgressEvent::ExperimentPaused(paused) => output::warning(&format!(
            "Paused with {} run(s) remaining",
            paused.remaining_runs
        )),
        ProgressEvent::ExperimentCompleted(done) => output::summary(done),
        ProgressEvent::Error(report) => output::error(&report.message),
    }
}
