//! Model loading utilities with HuggingFace Hub integration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use forneus_core::{Error, GenerationConfig, ModelOptions, ModelSource, Result};
use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};

use crate::config::LlamaConfig;
use crate::device::select_device;
use crate::lora::LoraConfig;
use crate::models::CausalLm;
use crate::tokenizer::Tokenizer;

/// How a checkpoint directory stores its weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Full model weights.
    Plain,
    /// Adapter weights on top of a base model named in the adapter config.
    Adapter,
}

impl CheckpointKind {
    /// Inspects a checkpoint directory once: any file whose name contains
    /// `adapter` marks an adapter checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn detect(dir: &Path) -> Result<Self> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().contains("adapter") {
                return Ok(Self::Adapter);
            }
        }
        Ok(Self::Plain)
    }
}

/// Model loader for local directories and the HuggingFace Hub.
pub struct ModelLoader {
    cache_dir: PathBuf,
    api: Api,
}

impl std::fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoader")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl ModelLoader {
    /// Creates a new model loader that caches Hub downloads in `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HuggingFace API cannot be initialized.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.clone())
            .build()
            .map_err(|e| {
                Error::model_load(format!("Failed to initialize HuggingFace API: {e}"))
            })?;

        Ok(Self { cache_dir, api })
    }

    /// Creates a model loader with the default cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the API cannot be initialized.
    pub fn default_cache() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("forneus")
            .join("hub");
        Self::new(cache_dir)
    }

    /// Resolves a model source to local paths for all required files.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be resolved or downloaded.
    pub fn resolve(&self, source: &ModelSource) -> Result<ModelFiles> {
        match source {
            ModelSource::HuggingFace { repo_id, revision } => {
                self.resolve_huggingface(repo_id, revision.as_deref())
            }
            ModelSource::LocalPath { path } => Self::resolve_local(path),
        }
    }

    fn hub_repo(&self, repo_id: &str, revision: Option<&str>) -> ApiRepo {
        self.api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.unwrap_or("main").to_string(),
        ))
    }

    /// Resolves a HuggingFace model, downloading if necessary.
    fn resolve_huggingface(&self, repo_id: &str, revision: Option<&str>) -> Result<ModelFiles> {
        info!(repo_id, revision, "Resolving HuggingFace model");

        let repo = self.hub_repo(repo_id, revision);

        let config_path = repo
            .get(LlamaConfig::FILE_NAME)
            .map_err(|e| Error::model_load(format!("Failed to download config.json: {e}")))?;

        debug!(?config_path, "Downloaded config.json");

        let generation_config = repo.get(GenerationConfig::FILE_NAME).ok();

        let weights = Self::resolve_weights(&repo, repo_id)?;

        Ok(ModelFiles {
            config: config_path,
            weights,
            generation_config,
        })
    }

    /// Resolves weight files, single or sharded safetensors.
    fn resolve_weights(repo: &ApiRepo, repo_id: &str) -> Result<WeightFiles> {
        if let Ok(path) = repo.get("model.safetensors") {
            info!("Found single safetensors file");
            return Ok(WeightFiles::SingleSafetensors(path));
        }

        if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Found sharded safetensors");
            let shard_names = read_shard_names(&index_path)?;
            info!(num_shards = shard_names.len(), "Downloading model shards");

            let mut shards = Vec::with_capacity(shard_names.len());
            for (i, shard_name) in shard_names.iter().enumerate() {
                debug!(shard = %shard_name, index = i + 1, total = shard_names.len(), "Downloading shard");
                let path = repo.get(shard_name).map_err(|e| {
                    Error::model_load(format!("Failed to download shard {shard_name}: {e}"))
                })?;
                shards.push(path);
            }
            return Ok(WeightFiles::ShardedSafetensors {
                index: index_path,
                shards,
            });
        }

        if repo.get("pytorch_model.bin").is_ok() {
            return Err(Error::model_load(format!(
                "{repo_id} only ships PyTorch weights; safetensors are required"
            )));
        }

        Err(Error::model_load(format!(
            "No supported weight files found in {repo_id}"
        )))
    }

    /// Resolves a local checkpoint directory.
    fn resolve_local(path: &Path) -> Result<ModelFiles> {
        debug!(?path, "Resolving local model");

        if !path.is_dir() {
            return Err(Error::model_load(format!(
                "{} is not a model directory",
                path.display()
            )));
        }

        let config = path.join(LlamaConfig::FILE_NAME);
        if !config.exists() {
            return Err(Error::model_load(format!(
                "config.json not found in {}",
                path.display()
            )));
        }

        let weights = if path.join("model.safetensors").exists() {
            WeightFiles::SingleSafetensors(path.join("model.safetensors"))
        } else if path.join("model.safetensors.index.json").exists() {
            let index = path.join("model.safetensors.index.json");
            let shards = read_shard_names(&index)?
                .into_iter()
                .map(|n| path.join(n))
                .collect();
            WeightFiles::ShardedSafetensors { index, shards }
        } else {
            return Err(Error::model_load(format!(
                "No safetensors weights found in {}",
                path.display()
            )));
        };

        let generation_config =
            Some(path.join(GenerationConfig::FILE_NAME)).filter(|p| p.exists());
        Ok(ModelFiles {
            config,
            weights,
            generation_config,
        })
    }

    /// Loads a checkpoint directory whose kind has already been detected.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration or weights cannot be read.
    pub fn load_model(
        &self,
        dir: &Path,
        kind: CheckpointKind,
        options: &ModelOptions,
    ) -> Result<CausalLm> {
        match kind {
            CheckpointKind::Plain => {
                let files = Self::resolve_local(dir)?;
                Self::load_plain(&files, &dir.to_string_lossy(), None, options)
            }
            CheckpointKind::Adapter => self.load_adapter(dir, options),
        }
    }

    /// Loads a model from a local directory or a Hub repository id.
    ///
    /// Local directories go through [`CheckpointKind::detect`]; Hub repositories
    /// are loaded as plain checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be resolved or loaded.
    pub fn load_pretrained(&self, name_or_path: &str, options: &ModelOptions) -> Result<CausalLm> {
        match ModelSource::from_name_or_path(name_or_path) {
            ModelSource::LocalPath { path } => {
                let kind = CheckpointKind::detect(&path)?;
                self.load_model(&path, kind, options)
            }
            source => {
                let files = self.resolve(&source)?;
                Self::load_plain(&files, name_or_path, None, options)
            }
        }
    }

    fn load_plain(
        files: &ModelFiles,
        name_or_path: &str,
        lora: Option<LoraConfig>,
        options: &ModelOptions,
    ) -> Result<CausalLm> {
        let config = LlamaConfig::from_file(&files.config)?;
        let device = select_device(&options.device)?;
        let mut model = CausalLm::new(config, lora, name_or_path, options.dtype.into(), &device)?;

        let tensors = files.weights.load(&device)?;
        let assigned = model
            .params()
            .assign(&tensors, |name| !LoraConfig::is_adapter_param(name))?;

        if let Some(path) = &files.generation_config {
            model.set_generation_config(GenerationConfig::from_file(path)?);
        }

        info!(name_or_path, tensors = assigned, "Loaded model weights");
        Ok(model)
    }

    fn load_adapter(&self, dir: &Path, options: &ModelOptions) -> Result<CausalLm> {
        let lora = LoraConfig::from_file(&dir.join(LoraConfig::CONFIG_FILE))?;
        let base = lora.base_model_name_or_path.clone().ok_or_else(|| {
            Error::model_load(format!(
                "{} in {} names no base model",
                LoraConfig::CONFIG_FILE,
                dir.display()
            ))
        })?;
        info!(adapter = %dir.display(), base = %base, "Loading adapter checkpoint");

        let base_files = self.resolve(&ModelSource::from_name_or_path(&base))?;
        let mut model = Self::load_plain(&base_files, &base, Some(lora), options)?;

        let weights_path = dir.join(LoraConfig::WEIGHTS_FILE);
        let adapter: HashMap<String, Tensor> =
            candle_core::safetensors::load(&weights_path, model.device())?
                .into_iter()
                .map(|(name, t)| {
                    let name = name
                        .strip_prefix(LoraConfig::PEFT_PREFIX)
                        .map(str::to_string)
                        .unwrap_or(name);
                    (name, t)
                })
                .collect();
        model
            .params()
            .assign(&adapter, LoraConfig::is_adapter_param)?;

        let params = model.params_mut();
        params.set_all_trainable(false);
        let adapter_names: Vec<String> = params
            .names()
            .filter(|n| LoraConfig::is_adapter_param(n))
            .map(str::to_string)
            .collect();
        for name in &adapter_names {
            params.set_trainable(name, true)?;
        }

        Ok(model)
    }

    /// Loads a tokenizer from a local directory or a Hub repository id.
    ///
    /// # Errors
    ///
    /// Returns an error if no `tokenizer.json` can be found.
    pub fn load_tokenizer(&self, name_or_path: &str) -> Result<Tokenizer> {
        match ModelSource::from_name_or_path(name_or_path) {
            ModelSource::LocalPath { path } => Tokenizer::from_dir(&path),
            ModelSource::HuggingFace { repo_id, revision } => {
                let repo = self.hub_repo(&repo_id, revision.as_deref());
                let path = repo.get(Tokenizer::FILE_NAME).map_err(|e| {
                    Error::tokenization(format!("Failed to download tokenizer for {repo_id}: {e}"))
                })?;
                // tokenizer_config.json lands in the same snapshot directory
                let _ = repo.get(Tokenizer::CONFIG_FILE);
                let dir = path
                    .parent()
                    .ok_or_else(|| Error::internal("tokenizer path has no parent"))?;
                Tokenizer::from_dir(dir)
            }
        }
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Collection of files needed to load a model.
///
/// Tokenizer files are fetched separately by [`ModelLoader::load_tokenizer`].
#[derive(Debug)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Weight files.
    pub weights: WeightFiles,
    /// Optional generation_config.json.
    pub generation_config: Option<PathBuf>,
}

/// Weight file layouts.
#[derive(Debug)]
pub enum WeightFiles {
    /// Single safetensors file.
    SingleSafetensors(PathBuf),
    /// Sharded safetensors files.
    ShardedSafetensors {
        /// Index file.
        index: PathBuf,
        /// Shard files.
        shards: Vec<PathBuf>,
    },
}

impl WeightFiles {
    /// Returns all weight file paths.
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::SingleSafetensors(p) => vec![p.as_path()],
            Self::ShardedSafetensors { shards, .. } => {
                shards.iter().map(PathBuf::as_path).collect()
            }
        }
    }

    /// Reads every tensor from every file onto `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read.
    pub fn load(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for path in self.paths() {
            debug!(path = %path.display(), "Reading safetensors");
            tensors.extend(candle_core::safetensors::load(path, device)?);
        }
        Ok(tensors)
    }
}

/// Unique shard file names listed in a `*.safetensors.index.json` weight map.
fn read_shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index_content = std::fs::read_to_string(index_path)
        .map_err(|e| Error::model_load(format!("Failed to read index file: {e}")))?;

    let index: serde_json::Value = serde_json::from_str(&index_content)
        .map_err(|e| Error::model_load(format!("Failed to parse index file: {e}")))?;

    let weight_map = index
        .get("weight_map")
        .and_then(|w| w.as_object())
        .ok_or_else(|| Error::model_load("Invalid index file: missing weight_map"))?;

    let mut shard_names: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(String::from)
        .collect();
    shard_names.sort();
    shard_names.dedup();
    Ok(shard_names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{write_tiny_adapter, write_tiny_checkpoint};

    fn loader() -> (tempfile::TempDir, ModelLoader) {
        let cache = tempfile::tempdir().unwrap();
        let loader = ModelLoader::new(cache.path()).unwrap();
        (cache, loader)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_detect_checkpoint_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        assert_eq!(CheckpointKind::detect(dir.path()).unwrap(), CheckpointKind::Plain);

        std::fs::write(dir.path().join("adapter_model.safetensors"), b"").unwrap();
        assert_eq!(CheckpointKind::detect(dir.path()).unwrap(), CheckpointKind::Adapter);
    }

    #[test]
    fn test_plain_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let original = write_tiny_checkpoint(dir.path()).unwrap();
        let (_cache, loader) = loader();

        let kind = CheckpointKind::detect(dir.path()).unwrap();
        assert_eq!(kind, CheckpointKind::Plain);
        let loaded = loader
            .load_model(dir.path(), kind, &ModelOptions::default())
            .unwrap();

        assert_eq!(loaded.name_or_path(), dir.path().to_string_lossy());
        assert_eq!(loaded.generation_config(), original.generation_config());
        for name in original.params().names() {
            let a = original.params().get(name).unwrap().unwrap();
            let b = loaded.params().get(name).unwrap().unwrap();
            assert!(max_abs_diff(a.as_tensor(), b.as_tensor()) < 1e-7, "{name}");
        }
    }

    #[test]
    fn test_adapter_round_trip_freezes_base() {
        let base_dir = tempfile::tempdir().unwrap();
        let base = write_tiny_checkpoint(base_dir.path()).unwrap();
        let adapter_dir = tempfile::tempdir().unwrap();
        let adapter = write_tiny_adapter(adapter_dir.path(), base_dir.path()).unwrap();
        let (_cache, loader) = loader();

        let kind = CheckpointKind::detect(adapter_dir.path()).unwrap();
        assert_eq!(kind, CheckpointKind::Adapter);
        let loaded = loader
            .load_model(adapter_dir.path(), kind, &ModelOptions::default())
            .unwrap();

        assert_eq!(loaded.name_or_path(), base_dir.path().to_string_lossy());
        let q = "model.layers.0.self_attn.q_proj.weight";
        let lora_a = "model.layers.0.self_attn.q_proj.lora_A.weight";
        assert!(
            max_abs_diff(
                base.params().get(q).unwrap().unwrap().as_tensor(),
                loaded.params().get(q).unwrap().unwrap().as_tensor()
            ) < 1e-7
        );
        assert!(
            max_abs_diff(
                adapter.params().get(lora_a).unwrap().unwrap().as_tensor(),
                loaded.params().get(lora_a).unwrap().unwrap().as_tensor()
            ) < 1e-7
        );
        assert_eq!(loaded.params().is_trainable(q), Some(false));
        assert_eq!(loaded.params().is_trainable(lora_a), Some(true));
    }

    #[test]
    fn test_resolve_local_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(dir.path()).unwrap();
        let (_cache, loader) = loader();

        let files = loader
            .resolve(&ModelSource::LocalPath {
                path: dir.path().to_path_buf(),
            })
            .unwrap();
        assert_eq!(files.config, dir.path().join(LlamaConfig::FILE_NAME));
        assert!(matches!(
            &files.weights,
            WeightFiles::SingleSafetensors(p) if p == &dir.path().join("model.safetensors")
        ));
        assert_eq!(
            files.generation_config,
            Some(dir.path().join(GenerationConfig::FILE_NAME))
        );

        std::fs::remove_file(dir.path().join(GenerationConfig::FILE_NAME)).unwrap();
        let files = loader
            .resolve(&ModelSource::LocalPath {
                path: dir.path().to_path_buf(),
            })
            .unwrap();
        assert!(files.generation_config.is_none());
    }

    #[test]
    fn test_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let (_cache, loader) = loader();
        let err = loader
            .load_model(dir.path(), CheckpointKind::Plain, &ModelOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }

    #[test]
    fn test_local_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(dir.path()).unwrap();
        let (_cache, loader) = loader();
        let tokenizer = loader.load_tokenizer(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(tokenizer.eos_token(), Some("</s>"));
    }
}
