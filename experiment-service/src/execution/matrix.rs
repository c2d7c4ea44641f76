// Run Matrix Planning
// Expands an experiment configuration into the ordered list of runs to execute

use crate::models::{ContextMode, ExperimentConfig, Hyperparameters, RunSpec};

use thiserror::Error;

/// A single configuration problem, addressed by field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.path, self.message)
    }
}

/// Configuration rejected before any run was planned
#[derive(Debug, Clone, Error)]
#[error("invalid experiment configuration: {}", summarize(.errors))]
pub struct PlanError {
    pub errors: Vec<ValidationError>,
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The ordered run matrix for one experiment
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    runs: Vec<RunSpec>,
}

impl RunPlan {
    /// Number of planned runs. Fixed for the lifetime of the experiment.
    pub fn total_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn runs(&self) -> &[RunSpec] {
        &self.runs
    }

    pub fn get(&self, index: usize) -> Option<&RunSpec> {
        self.runs.get(index)
    }
}

/// Planner for experiment run matrices
pub struct RunMatrixPlanner;

impl RunMatrixPlanner {
    /// Validate and expand a configuration.
    ///
    /// Order is models (outer), embedding models (middle), iterations (inner).
    /// Unset hyperparameters are filled from `defaults`.
    pub fn plan(config: &ExperimentConfig, defaults: &Hyperparameters) -> Result<RunPlan, PlanError> {
        Self::validate(config)?;

        let hyperparameters = config.hyperparameters.resolve(defaults);
        let embeddings = Self::embedding_axis(config);
        let mut runs = Vec::with_capacity(Self::total_runs(config));

        for model in &config.models {
            for embedding_model in &embeddings {
                for iteration in 1..=config.iterations {
                    runs.push(RunSpec {
                        index: runs.len(),
                        model: model.clone(),
                        embedding_model: embedding_model.clone(),
                        iteration,
                        hyperparameters: hyperparameters.clone(),
                    });
                }
            }
        }

        Ok(RunPlan { runs })
    }

    /// `|models| * max(|embedding models|, 1) * iterations`
    pub fn total_runs(config: &ExperimentConfig) -> usize {
        config.models.len() * Self::embedding_axis(config).len() * config.iterations as usize
    }

    /// Check a configuration, collecting every problem found
    pub fn validate(config: &ExperimentConfig) -> Result<(), PlanError> {
        let mut errors = Vec::new();

        if config.models.is_empty() {
            errors.push(ValidationError::new("models", "at least one model is required"));
        }
        for (i, model) in config.models.iter().enumerate() {
            if model.trim().is_empty() {
                errors.push(ValidationError::new(format!("models[{}]", i), "model name is blank"));
            }
        }

        if config.iterations < 1 {
            errors.push(ValidationError::new("iterations", "must be at least 1"));
        }

        match config.context_mode {
            ContextMode::Rag => {
                if config.embedding_models.is_empty() {
                    errors.push(ValidationError::new(
                        "embedding_models",
                        "rag context mode requires at least one embedding model",
                    ));
                }
                if config.document_id.is_none() {
                    errors.push(ValidationError::new(
                        "document_id",
                        "rag context mode requires a document",
                    ));
                }
                for (i, model) in config.embedding_models.iter().enumerate() {
                    if model.trim().is_empty() {
                        errors.push(ValidationError::new(
                            format!("embedding_models[{}]", i),
                            "embedding model name is blank",
                        ));
                    }
                }
                let retrieval = &config.retrieval;
                if retrieval.top_k == 0 {
                    errors.push(ValidationError::new("retrieval.top_k", "must be at least 1"));
                }
                if retrieval.chunk_size == 0 {
                    errors.push(ValidationError::new("retrieval.chunk_size", "must be at least 1"));
                } else if retrieval.chunk_overlap >= retrieval.chunk_size {
                    errors.push(ValidationError::new(
                        "retrieval.chunk_overlap",
                        "must be smaller than chunk_size",
                    ));
                }
            }
            ContextMode::FullContext => {
                if config.document_id.is_none() {
                    errors.push(ValidationError::new(
                        "document_id",
                        "full_context mode requires a document",
                    ));
                }
            }
            ContextMode::None => {}
        }

        Self::validate_hyperparameters(&config.hyperparameters, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PlanError { errors })
        }
    }

    fn validate_hyperparameters(params: &Hyperparameters, errors: &mut Vec<ValidationError>) {
        if let Some(t) = params.temperature {
            if !(0.0..=2.0).contains(&t) {
                errors.push(ValidationError::new(
                    "hyperparameters.temperature",
                    "must be between 0.0 and 2.0",
                ));
            }
        }
        if let Some(p) = params.top_p {
            if !(p > 0.0 && p <= 1.0) {
                errors.push(ValidationError::new(
                    "hyperparameters.top_p",
                    "must be in (0.0, 1.0]",
                ));
            }
        }
        if params.top_k == Some(0) {
            errors.push(ValidationError::new("hyperparameters.top_k", "must be at least 1"));
        }
        if params.context_window == Some(0) {
            errors.push(ValidationError::new(
                "hyperparameters.context_window",
                "must be at least 1",
            ));
        }
        if params.max_tokens == Some(0) {
            errors.push(ValidationError::new("hyperparameters.max_tokens", "must be at least 1"));
        }
    }

    /// Embedding entries for the middle loop: one implicit `None` unless retrieval is used
    fn embedding_axis(config: &ExperimentConfig) -> Vec<Option<String>> {
        if config.context_mode.uses_retrieval() && !config.embedding_models.is_empty() {
            config.embedding_models.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(models: &[&str], iterations: u32) -> ExperimentConfig {
        ExperimentConfig {
            prompt: "Summarize the report".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            iterations,
            ..Default::default()
        }
    }

    fn labels(plan: &RunPlan) -> Vec<String> {
        plan.runs().iter().map(RunSpec::label).collect()
    }

    #[test]
    fn test_plan_models_by_iterations() {
        let plan = RunMatrixPlanner::plan(&config(&["A", "B"], 3), &Hyperparameters::default())
            .unwrap();

        assert_eq!(plan.total_runs(), 6);
        assert_eq!(labels(&plan), vec!["A/1", "A/2", "A/3", "B/1", "B/2", "B/3"]);
        for (i, run) in plan.runs().iter().enumerate() {
            assert_eq!(run.index, i);
        }
    }

    #[test]
    fn test_plan_with_embedding_models() {
        let mut cfg = config(&["A", "B"], 2);
        cfg.context_mode = ContextMode::Rag;
        cfg.embedding_models = vec!["e1".to_string(), "e2".to_string()];
        cfg.document_id = Some("doc".to_string());

        let plan = RunMatrixPlanner::plan(&cfg, &Hyperparameters::default()).unwrap();

        assert_eq!(plan.total_runs(), 8);
        assert_eq!(RunMatrixPlanner::total_runs(&cfg), 8);
        assert_eq!(
            labels(&plan),
            vec![
                "A/e1/1", "A/e1/2", "A/e2/1", "A/e2/2", "B/e1/1", "B/e1/2", "B/e2/1", "B/e2/2"
            ]
        );
    }

    #[test]
    fn test_embedding_models_ignored_without_retrieval() {
        let mut cfg = config(&["A"], 2);
        cfg.embedding_models = vec!["e1".to_string(), "e2".to_string()];

        let plan = RunMatrixPlanner::plan(&cfg, &Hyperparameters::default()).unwrap();
        assert_eq!(plan.total_runs(), 2);
        assert!(plan.runs().iter().all(|r| r.embedding_model.is_none()));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let cfg = config(&["x", "y", "z"], 4);
        let first = RunMatrixPlanner::plan(&cfg, &Hyperparameters::default()).unwrap();
        let second = RunMatrixPlanner::plan(&cfg, &Hyperparameters::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_total_runs_formula() {
        for models in 1..4usize {
            for embeddings in 0..3usize {
                for iterations in 1..4u32 {
                    let mut cfg = config(&vec!["m"; models], iterations);
                    if embeddings > 0 {
                        cfg.context_mode = ContextMode::Rag;
                        cfg.document_id = Some("doc".to_string());
                        cfg.embedding_models = vec!["e".to_string(); embeddings];
                    }
                    let plan = RunMatrixPlanner::plan(&cfg, &Hyperparameters::default()).unwrap();
                    assert_eq!(
                        plan.total_runs(),
                        models * embeddings.max(1) * iterations as usize
                    );
                }
            }
        }
    }

    #[test]
    fn test_rag_requires_embeddings_and_document() {
        let mut cfg = config(&["A"], 1);
        cfg.context_mode = ContextMode::Rag;

        let err = RunMatrixPlanner::plan(&cfg, &Hyperparameters::default()).unwrap_err();
        let paths: Vec<_> = err.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"embedding_models"));
        assert!(paths.contains(&"document_id"));
    }

    #[test]
    fn test_rejects_empty_models_and_zero_iterations() {
        let err = RunMatrixPlanner::plan(&config(&[], 0), &Hyperparameters::default()).unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert!(err.to_string().contains("models"));
        assert!(err.to_string().contains("iterations"));
    }

    #[test]
    fn test_rejects_out_of_range_hyperparameters() {
        let mut cfg = config(&["A"], 1);
        cfg.hyperparameters.temperature = Some(3.5);
        cfg.hyperparameters.top_p = Some(0.0);

        let err = RunMatrixPlanner::validate(&cfg).unwrap_err();
        assert_eq!(err.errors.len(), 2);
    }

    #[test]
    fn test_defaults_are_resolved_into_specs() {
        let mut cfg = config(&["A"], 1);
        cfg.hyperparameters.temperature = Some(0.2);
        let defaults = Hyperparameters {
            temperature: Some(0.7),
            max_tokens: Some(256),
            ..Default::default()
        };

        let plan = RunMatrixPlanner::plan(&cfg, &defaults).unwrap();
        let params = &plan.runs()[0].hyperparameters;
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.max_tokens, Some(256));
    }
}
