// JSONL Run Store
// Appends every saved run and status change to a JSON Lines file

use crate::models::{Experiment, ExperimentConfig, ExperimentId, ExperimentRun, ExperimentStatus};
use crate::store::{InMemoryRunStore, RunStore, StoreResult};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_RESULTS_FILE: &str = "benchlab-results.jsonl";

/// One line of the results file
#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record<'a> {
    Experiment {
        experiment: &'a Experiment,
    },
    Status {
        #[serde(rename = "experimentId")]
        experiment_id: ExperimentId,
        status: ExperimentStatus,
        timestamp: DateTime<Utc>,
    },
    Run {
        run: &'a ExperimentRun,
    },
}

/// In-memory store that also writes an append-only results log
pub struct JsonlRunStore {
    inner: InMemoryRunStore,
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlRunStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: InMemoryRunStore::new(),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &Record<'_>) -> StoreResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RunStore for JsonlRunStore {
    async fn create_experiment(
        &self,
        name: &str,
        config: ExperimentConfig,
    ) -> StoreResult<Experiment> {
        let experiment = self.inner.create_experiment(name, config).await?;
        self.append(&Record::Experiment {
            experiment: &experiment,
        })?;
        Ok(experiment)
    }

    async fn experiment(&self, id: ExperimentId) -> StoreResult<Experiment> {
        self.inner.experiment(id).await
    }

    async fn update_config(
        &self,
        id: ExperimentId,
        config: ExperimentConfig,
    ) -> StoreResult<Experiment> {
        let experiment = self.inner.update_config(id, config).await?;
        self.append(&Record::Experiment {
            experiment: &experiment,
        })?;
        Ok(experiment)
    }

    async fn update_status(&self, id: ExperimentId, status: ExperimentStatus) -> StoreResult<()> {
        self.inner.update_status(id, status).await?;
        self.append(&Record::Status {
            experiment_id: id,
            status,
            timestamp: Utc::now(),
        })
    }

    async fn save_run(&self, run: &ExperimentRun) -> StoreResult<()> {
        self.inner.save_run(run).await?;
        self.append(&Record::Run { run })
    }

    async fn runs(&self, id: ExperimentId) -> StoreResult<Vec<ExperimentRun>> {
        self.inner.runs(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Hyperparameters, RunSpec};

    #[tokio::test]
    async fn test_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_RESULTS_FILE);
        let store = JsonlRunStore::open(&path).unwrap();

        let exp = store
            .create_experiment("capitals", ExperimentConfig::default())
            .await
            .unwrap();
        store
            .update_status(exp.id, ExperimentStatus::Running)
            .await
            .unwrap();
        let spec = RunSpec {
            index: 0,
            model: "llama3".to_string(),
            embedding_model: None,
            iteration: 1,
            hyperparameters: Hyperparameters::default(),
        };
        store
            .save_run(&ExperimentRun::begin(exp.id, &spec).fail("timeout", None))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["record"], "experiment");
        assert_eq!(lines[0]["experiment"]["name"], "capitals");
        assert_eq!(lines[1]["record"], "status");
        assert_eq!(lines[1]["status"], "RUNNING");
        assert_eq!(lines[2]["record"], "run");
        assert_eq!(lines[2]["run"]["status"], "FAILED");
        assert_eq!(lines[2]["run"]["errorMessage"], "timeout");
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        std::fs::write(&path, "{\"record\":\"status\"}\n").unwrap();

        let store = JsonlRunStore::open(&path).unwrap();
        store
            .create_experiment("x", ExperimentConfig::default())
            .await
            .unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_failed_lookup_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let store = JsonlRunStore::open(&path).unwrap();

        assert!(store
            .update_status(7, ExperimentStatus::Failed)
            .await
            .is_err());
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
    }
}
