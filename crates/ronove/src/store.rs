//! Datasets and checkpoints exchanged through the artifact registry.
//!
//! Loading goes through the active [`Run`] when one is given, so the consumed
//! version is recorded in the run's lineage. Without a run the registry is
//! queried directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use forneus_core::artifact::validate_name;
use forneus_core::{ArtifactAddress, ArtifactType, Error, ModelOptions, Result};
use marbas::{CausalLm, CheckpointKind, ModelLoader, Tokenizer};
use seere::{Artifact, ArtifactRegistry, ArtifactVersion, Run};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::dataset::{load_from_disk, LoadedDataset};

/// Metadata key naming the pretrained model a checkpoint derives from.
pub const MODEL_ID_KEY: &str = "model_id";

/// Optional fields attached to a published model artifact.
#[derive(Debug, Clone, Default)]
pub struct ArtifactOptions {
    /// Free-form description.
    pub description: Option<String>,
    /// Metadata stored with the version.
    pub metadata: Map<String, Value>,
    /// Aliases set on the version in addition to `latest`.
    pub aliases: Vec<String>,
}

impl ArtifactOptions {
    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Adds an alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

/// A checkpoint loaded from an artifact.
#[derive(Debug)]
pub struct LoadedModel {
    /// The model, on the requested device.
    pub model: CausalLm,
    /// Tokenizer with its padding token set to end-of-sequence.
    pub tokenizer: Tokenizer,
    /// Local directory the artifact was downloaded to.
    pub dir: PathBuf,
}

/// A checkpoint written by [`ArtifactStore::save_model`].
#[derive(Debug, Clone)]
pub struct SavedModel {
    /// Directory holding the checkpoint.
    pub dir: PathBuf,
    /// Published version, when the checkpoint was logged.
    pub artifact: Option<ArtifactVersion>,
}

/// Loads and saves datasets and models as registry artifacts.
pub struct ArtifactStore {
    registry: Arc<dyn ArtifactRegistry>,
    loader: ModelLoader,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Creates a store over a registry, using `loader` for checkpoints and
    /// pretrained tokenizers.
    #[must_use]
    pub fn new(registry: Arc<dyn ArtifactRegistry>, loader: ModelLoader) -> Self {
        Self { registry, loader }
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn ArtifactRegistry> {
        &self.registry
    }

    /// The model loader.
    #[must_use]
    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    fn resolve(
        &self,
        run: Option<&mut Run>,
        address: &str,
        artifact_type: ArtifactType,
    ) -> Result<ArtifactVersion> {
        match run {
            Some(run) => run.use_artifact(address, artifact_type),
            None => {
                let address: ArtifactAddress = address.parse()?;
                self.registry.resolve(&address, &artifact_type)
            }
        }
    }

    /// Downloads a dataset artifact and loads it from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactNotFound`] for an unknown address and
    /// [`Error::DatasetLoad`] if the files are not a dataset.
    pub fn load_dataset(&self, run: Option<&mut Run>, address: &str) -> Result<LoadedDataset> {
        self.load_dataset_as(run, address, ArtifactType::Dataset)
    }

    /// Like [`load_dataset`](Self::load_dataset) for an artifact of another type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactNotFound`] for an unknown address and
    /// [`Error::DatasetLoad`] if the files are not a dataset.
    pub fn load_dataset_as(
        &self,
        run: Option<&mut Run>,
        address: &str,
        artifact_type: impl Into<ArtifactType>,
    ) -> Result<LoadedDataset> {
        let version = self.resolve(run, address, artifact_type.into())?;
        let dir = self.registry.download(&version)?;
        info!(artifact = %version.qualified_name(), dir = %dir.display(), "Loading dataset");
        load_from_disk(dir)
    }

    /// Downloads a model artifact and loads the checkpoint and its tokenizer.
    ///
    /// Adapter checkpoints are loaded on top of the base model they name. When
    /// the artifact carries no tokenizer, the one of the pretrained model named
    /// by the artifact's `model_id` metadata, or by the producing run's
    /// `model_id` config entry, is used instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactNotFound`] for an unknown address, a model
    /// loading error for a broken checkpoint and [`Error::Tokenization`] if no
    /// tokenizer can be found.
    pub fn load_model(
        &self,
        run: Option<&mut Run>,
        address: &str,
        options: &ModelOptions,
    ) -> Result<LoadedModel> {
        let version = self.resolve(run, address, ArtifactType::Model)?;
        let dir = self.registry.download(&version)?;
        let kind = CheckpointKind::detect(&dir)?;
        info!(artifact = %version.qualified_name(), ?kind, "Loading model");

        let model = self.loader.load_model(&dir, kind, options)?;

        let mut tokenizer = if dir.join(Tokenizer::FILE_NAME).exists() {
            Tokenizer::from_dir(&dir)?
        } else {
            let model_id = self.fallback_model_id(&version, &dir)?;
            warn!(model_id = %model_id, "No tokenizer in artifact, loading the pretrained one");
            self.loader.load_tokenizer(&model_id)?
        };
        tokenizer.set_pad_to_eos()?;

        Ok(LoadedModel {
            model,
            tokenizer,
            dir,
        })
    }

    fn fallback_model_id(&self, version: &ArtifactVersion, dir: &Path) -> Result<String> {
        if let Some(model_id) = version.metadata_str(MODEL_ID_KEY) {
            return Ok(model_id.to_string());
        }
        if let Some(producer) = &version.producer {
            let record = self.registry.run_record(producer)?;
            if let Some(model_id) = record.config.get(MODEL_ID_KEY).and_then(Value::as_str) {
                return Ok(model_id.to_string());
            }
        }
        Err(Error::tokenization(format!(
            "no {} in {} and no `{MODEL_ID_KEY}` in the artifact metadata or producer run config",
            Tokenizer::FILE_NAME,
            dir.display()
        )))
    }

    /// Saves a model and the tokenizer of its pretrained source to
    /// `folder/<run id>_<name>`, optionally publishing the directory as a model
    /// artifact of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not a valid artifact name or the
    /// tokenizer cannot be loaded, before anything is written. Otherwise
    /// returns an error if writing the checkpoint or publishing fails.
    pub fn save_model(
        &self,
        run: &mut Run,
        model: &CausalLm,
        name: &str,
        folder: &Path,
        log: bool,
        options: ArtifactOptions,
    ) -> Result<SavedModel> {
        let model_name = format!("{}_{name}", run.id());
        validate_name(&model_name)?;
        let tokenizer = self.loader.load_tokenizer(model.name_or_path())?;

        let dir = folder.join(&model_name);
        std::fs::create_dir_all(&dir)?;
        model.save_pretrained(&dir)?;
        tokenizer.save_pretrained(&dir)?;
        info!(dir = %dir.display(), "Saved model");

        if !log {
            return Ok(SavedModel {
                dir,
                artifact: None,
            });
        }

        let mut artifact = Artifact::new(&model_name, ArtifactType::Model)?
            .with_metadata(options.metadata)
            .with_aliases(options.aliases);
        if let Some(description) = options.description {
            artifact = artifact.with_description(description);
        }
        artifact.add_dir(&dir)?;
        let version = run.log_artifact(&artifact)?;
        info!(artifact = %version.qualified_name(), "Logged model artifact");

        Ok(SavedModel {
            dir,
            artifact: Some(version),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marbas::test_utils::{write_tiny_checkpoint, write_tiny_tokenizer};
    use seere::{LocalRegistry, RunSettings};
    use serde_json::json;

    fn store(root: &Path) -> ArtifactStore {
        let registry = Arc::new(LocalRegistry::new(root.join("registry")).unwrap());
        let loader = ModelLoader::new(root.join("hub")).unwrap();
        ArtifactStore::new(registry, loader)
    }

    fn publish_weights_only(store: &ArtifactStore, src: &Path, metadata: Map<String, Value>) {
        let ckpt = src.join("ckpt");
        write_tiny_checkpoint(&ckpt).unwrap();
        std::fs::remove_file(ckpt.join(Tokenizer::FILE_NAME)).unwrap();
        std::fs::remove_file(ckpt.join(Tokenizer::CONFIG_FILE)).unwrap();

        let mut artifact = Artifact::new("bare", ArtifactType::Model)
            .unwrap()
            .with_metadata(metadata);
        artifact.add_dir(&ckpt).unwrap();
        store.registry().publish(&artifact, None).unwrap();
    }

    #[test]
    fn test_invalid_name_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        let pretrained = root.path().join("pretrained");
        let model = write_tiny_checkpoint(&pretrained).unwrap();
        let mut run = Run::init(
            Arc::clone(store.registry()),
            RunSettings::new("alpaca_ft"),
        )
        .unwrap();

        let folder = root.path().join("models");
        for log in [false, true] {
            let err = store
                .save_model(
                    &mut run,
                    &model,
                    "bad name",
                    &folder,
                    log,
                    ArtifactOptions::default(),
                )
                .unwrap_err();
            assert!(matches!(err, Error::Registry { .. }), "{err}");
        }
        assert!(!folder.exists());
        assert!(run.record().produced.is_empty());
    }

    #[test]
    fn test_missing_dataset_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let err = store(root.path())
            .load_dataset(None, "alpaca_gpt4_splitted:latest")
            .unwrap_err();
        assert!(err.is_not_found(), "{err}");
    }

    #[test]
    fn test_tokenizer_falls_back_to_metadata_model_id() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        let pretrained = root.path().join("pretrained");
        write_tiny_tokenizer(&pretrained).unwrap();

        let mut metadata = Map::new();
        metadata.insert(MODEL_ID_KEY.into(), json!(pretrained.to_string_lossy()));
        publish_weights_only(&store, root.path(), metadata);

        let loaded = store
            .load_model(None, "bare:latest", &ModelOptions::default())
            .unwrap();
        assert_eq!(loaded.tokenizer.pad_token(), loaded.tokenizer.eos_token());
        assert_eq!(loaded.tokenizer.eos_token(), Some("</s>"));
    }

    #[test]
    fn test_tokenizer_falls_back_to_producer_config() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        let pretrained = root.path().join("pretrained");
        write_tiny_tokenizer(&pretrained).unwrap();

        let mut config = Map::new();
        config.insert(MODEL_ID_KEY.into(), json!(pretrained.to_string_lossy()));
        let mut run = Run::init(
            Arc::clone(store.registry()),
            RunSettings::new("alpaca_ft").with_config(config),
        )
        .unwrap();

        let ckpt = root.path().join("ckpt");
        write_tiny_checkpoint(&ckpt).unwrap();
        std::fs::remove_file(ckpt.join(Tokenizer::FILE_NAME)).unwrap();
        let mut artifact = Artifact::new("bare", ArtifactType::Model).unwrap();
        artifact.add_dir(&ckpt).unwrap();
        run.log_artifact(&artifact).unwrap();

        let loaded = store
            .load_model(None, "bare:v0", &ModelOptions::default())
            .unwrap();
        assert_eq!(loaded.tokenizer.pad_token(), Some("</s>"));
    }

    #[test]
    fn test_no_tokenizer_anywhere_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path());
        publish_weights_only(&store, root.path(), Map::new());

        let err = store
            .load_model(None, "bare:latest", &ModelOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Tokenization { .. }), "{err}");
    }
}
