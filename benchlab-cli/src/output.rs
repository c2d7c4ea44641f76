// Output formatting helpers for CLI commands

use experiment_service::execution::events::{
    ExperimentCompleted, Progress, RunCompleted, RunStarted,
};
use experiment_service::inference::gateway::GatewayMetrics;
use experiment_service::RunStatus;

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// "[3/12] llama3 + nomic-embed-text #1"
pub fn run_started(run: &RunStarted) {
    let label = match &run.embedding_model {
        Some(embedding) => format!("{} + {}", run.model, embedding),
        None => run.model.clone(),
    };
    status(
        "Running",
        &format!(
            "[{}/{}] {} #{}",
            run.run_index + 1,
            run.total_runs,
            label,
            run.iteration
        ),
    );
}

pub fn run_completed(run: &RunCompleted) {
    if run.status == RunStatus::Success {
        let tps = run
            .tokens_per_second
            .map(|tps| format!(", {:.1} tok/s", tps))
            .unwrap_or_default();
        let ttft = run
            .time_to_first_token_ms
            .map(|ms| format!(", first token {}ms", ms))
            .unwrap_or_default();
        check(&format!(
            "{} #{} in {}ms{}{}",
            run.model,
            run.iteration,
            run.duration_ms.unwrap_or(0),
            tps,
            ttft
        ));
    } else {
        failure(&format!("{} #{}", run.model, run.iteration));
        if let Some(message) = &run.error_message {
            eprintln!("\x1b[31m      {}\x1b[0m", message);
        }
    }
}

pub fn progress(progress: &Progress) {
    let eta = progress
        .estimated_time_remaining_ms
        .map(|ms| format!(", ~{}s remaining", ms.div_ceil(1000)))
        .unwrap_or_default();
    dim(&format!(
        "      {:.0}% ({}/{}, {} failed){}",
        progress.percent_complete,
        progress.completed_runs,
        progress.total_runs,
        progress.failed_runs,
        eta
    ));
}

/// Final counts of an experiment
pub fn summary(done: &ExperimentCompleted) {
    eprintln!();
    header(&format!("Experiment {}", done.final_status));
    eprintln!("\x1b[32m  Successful runs: {}\x1b[0m", done.successful_runs);
    if done.failed_runs > 0 {
        eprintln!("\x1b[31m  Failed runs:     {}\x1b[0m", done.failed_runs);
    }
    dim(&format!(
        "  Total: {} run(s) in {:.1}s",
        done.total_runs,
        done.total_duration_ms as f64 / 1000.0
    ));
}

pub fn inference_stats(metrics: &GatewayMetrics) {
    dim(&format!(
        "  Inference: {} call(s), {} retried, {} failed",
        metrics.attempts, metrics.retries, metrics.failures
    ));
}
