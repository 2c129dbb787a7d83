//! Experiment run sessions.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use forneus_core::{ArtifactAddress, ArtifactType, Error, Result, RunId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactVersion};
use crate::registry::ArtifactRegistry;
use crate::table::Table;

const HISTORY_FILE: &str = "history.jsonl";
const MEDIA_DIR: &str = "media";

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// The run is active.
    Running,
    /// [`Run::finish`] was called.
    Finished,
}

/// Persisted description of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub id: RunId,
    /// Project the run belongs to.
    pub project: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Flat run configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Lifecycle state.
    pub state: RunState,
    /// Start time.
    pub created_at: DateTime<Utc>,
    /// Finish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Artifact versions consumed, as `name:vN`.
    #[serde(default)]
    pub used: Vec<String>,
    /// Artifact versions produced, as `name:vN`.
    #[serde(default)]
    pub produced: Vec<String>,
}

/// Settings for starting a run.
#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    /// Project name.
    pub project: String,
    /// Optional display name.
    pub name: Option<String>,
    /// Initial configuration.
    pub config: Map<String, Value>,
}

impl RunSettings {
    /// Settings for a run in `project`.
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Self::default()
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the initial configuration.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }
}

/// An active experiment run.
///
/// Every function that logs or consumes artifacts takes the run explicitly.
pub struct Run {
    registry: Arc<dyn ArtifactRegistry>,
    record: RunRecord,
    dir: PathBuf,
    step: u64,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.record.id)
            .field("project", &self.record.project)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl Run {
    /// Starts a new run with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns an error if the run directory or record cannot be written.
    pub fn init(registry: Arc<dyn ArtifactRegistry>, settings: RunSettings) -> Result<Self> {
        let id = RunId::generate();
        let dir = registry.run_dir(&id);
        std::fs::create_dir_all(dir.join(MEDIA_DIR))?;

        let record = RunRecord {
            id,
            project: settings.project,
            name: settings.name,
            config: settings.config,
            state: RunState::Running,
            created_at: Utc::now(),
            finished_at: None,
            used: Vec::new(),
            produced: Vec::new(),
        };
        registry.save_run_record(&record)?;
        info!(run_id = %record.id, project = %record.project, dir = %dir.display(), "Run started");

        Ok(Self {
            registry,
            record,
            dir,
            step: 0,
        })
    }

    /// Run id.
    #[must_use]
    pub fn id(&self) -> &RunId {
        &self.record.id
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &Map<String, Value> {
        &self.record.config
    }

    /// The persisted record as currently known.
    #[must_use]
    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Directory holding the run's history and media.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of rows logged so far.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// The registry this run talks to.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ArtifactRegistry> {
        &self.registry
    }

    /// Merges keys into the run configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn update_config(&mut self, config: Map<String, Value>) -> Result<()> {
        self.record.config.extend(config);
        self.registry.save_run_record(&self.record)
    }

    /// Appends one row to the history, stamped with `_step` and `_timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the history file cannot be written.
    #[allow(clippy::cast_precision_loss)]
    pub fn log(&mut self, mut row: Map<String, Value>) -> Result<()> {
        row.insert("_step".to_string(), json!(self.step));
        row.insert(
            "_timestamp".to_string(),
            json!(Utc::now().timestamp_millis() as f64 / 1000.0),
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(HISTORY_FILE))?;
        writeln!(file, "{}", serde_json::to_string(&row)?)?;

        debug!(run_id = %self.record.id, step = self.step, "Logged row");
        self.step += 1;
        Ok(())
    }

    /// Writes a table under `media/` and logs a reference to it under `key`.
    ///
    /// Returns the table file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the table or history cannot be written.
    pub fn log_table(&mut self, key: &str, table: &Table) -> Result<PathBuf> {
        let file_name = format!("{}_{}.table.json", key.replace('/', "_"), self.step);
        let path = self.dir.join(MEDIA_DIR).join(&file_name);
        table.save(&path)?;

        let mut row = Map::new();
        row.insert(
            key.to_string(),
            json!({
                "_type": "table-file",
                "path": format!("{MEDIA_DIR}/{file_name}"),
                "nrows": table.len(),
                "ncols": table.columns().len(),
            }),
        );
        self.log(row)?;
        info!(run_id = %self.record.id, key, rows = table.len(), "Logged table");
        Ok(path)
    }

    /// Reads back every logged row.
    ///
    /// # Errors
    ///
    /// Returns an error if the history file cannot be parsed.
    pub fn history(&self) -> Result<Vec<Map<String, Value>>> {
        let path = self.dir.join(HISTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        std::fs::read_to_string(path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Error::from))
            .collect()
    }

    /// Resolves an artifact and records it as an input of this run.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is malformed or cannot be resolved.
    pub fn use_artifact(
        &mut self,
        address: &str,
        artifact_type: impl Into<ArtifactType>,
    ) -> Result<ArtifactVersion> {
        let address: ArtifactAddress = address.parse()?;
        let version = self.registry.resolve(&address, &artifact_type.into())?;
        self.record.used.push(version.qualified_name());
        self.registry.save_run_record(&self.record)?;
        info!(run_id = %self.record.id, artifact = %version.qualified_name(), "Using artifact");
        Ok(version)
    }

    /// Publishes a draft with this run as its producer.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails.
    pub fn log_artifact(&mut self, artifact: &Artifact) -> Result<ArtifactVersion> {
        let version = self.registry.publish(artifact, Some(&self.record.id))?;
        self.record.produced.push(version.qualified_name());
        self.registry.save_run_record(&self.record)?;
        Ok(version)
    }

    /// Marks the run finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn finish(mut self) -> Result<()> {
        self.record.state = RunState::Finished;
        self.record.finished_at = Some(Utc::now());
        self.registry.save_run_record(&self.record)?;
        info!(run_id = %self.record.id, steps = self.step, "Run finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;

    fn run(root: &Path) -> Run {
        let registry = Arc::new(LocalRegistry::new(root).unwrap());
        let mut config = Map::new();
        config.insert("model_id".into(), json!("tiny"));
        Run::init(registry, RunSettings::new("alpaca_ft").with_config(config)).unwrap()
    }

    #[test]
    fn test_init_writes_record() {
        let root = tempfile::tempdir().unwrap();
        let run = run(root.path());
        assert_eq!(run.id().as_str().len(), RunId::LEN);

        let record = run.registry().run_record(run.id()).unwrap();
        assert_eq!(record.state, RunState::Running);
        assert_eq!(record.config["model_id"], json!("tiny"));

        let id = run.id().clone();
        let registry = Arc::clone(run.registry());
        run.finish().unwrap();
        assert_eq!(registry.run_record(&id).unwrap().state, RunState::Finished);
    }

    #[test]
    fn test_history_rows_are_stamped() {
        let root = tempfile::tempdir().unwrap();
        let mut run = run(root.path());
        let mut row = Map::new();
        row.insert("eval/loss".into(), json!(1.25));
        run.log(row.clone()).unwrap();
        run.log(row).unwrap();

        let history = run.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["_step"], json!(1));
        assert_eq!(history[0]["eval/loss"], json!(1.25));
        assert!(history[0]["_timestamp"].is_f64());
    }

    #[test]
    fn test_log_table_writes_media() {
        let root = tempfile::tempdir().unwrap();
        let mut run = run(root.path());
        let mut table = Table::new(["prompt", "generation"]);
        table.add_data(vec![json!("p"), json!("g")]).unwrap();

        let path = run.log_table("sample_predictions", &table).unwrap();
        assert!(path.ends_with("media/sample_predictions_0.table.json"));
        assert_eq!(Table::from_file(&path).unwrap(), table);
        assert_eq!(run.history().unwrap()[0]["sample_predictions"]["nrows"], json!(1));
    }

    #[test]
    fn test_artifact_lineage() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("weights.bin"), b"0").unwrap();

        let mut run = run(root.path());
        let mut artifact = Artifact::new("ckpt", ArtifactType::Model).unwrap();
        artifact.add_dir(src.path()).unwrap();
        let published = run.log_artifact(&artifact).unwrap();
        assert_eq!(published.producer.as_ref(), Some(run.id()));

        let used = run.use_artifact("ckpt:latest", ArtifactType::Model).unwrap();
        assert_eq!(used.id, published.id);
        let record = run.registry().run_record(run.id()).unwrap();
        assert_eq!(record.produced, vec!["ckpt:v0".to_string()]);
        assert_eq!(record.used, vec!["ckpt:v0".to_string()]);
    }
}
