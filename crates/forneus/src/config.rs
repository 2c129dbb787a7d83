//! Configuration of the baseline run.
//!
//! Values are layered, later sources winning:
//! 1. Built-in defaults
//! 2. Config file (`forneus.toml`, or the path in `FORNEUS_CONFIG`)
//! 3. Environment variables (`FORNEUS_*`)
//! 4. Command-line flags, one per field

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use forneus_core::{ConfigMap, DType, DeviceType, ModelOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "FORNEUS_CONFIG";

/// Config file read from the working directory by default.
pub const CONFIG_FILE: &str = "forneus.toml";

/// Baseline run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftConfig {
    /// Project the run is filed under.
    pub project: String,
    /// Root of the local tracking registry.
    pub run_dir: PathBuf,
    /// Dataset artifact holding the evaluation prompts.
    pub dataset_at: String,
    /// Split of the dataset to sample prompts from.
    pub eval_split: String,
    /// Model artifact to evaluate; `model_id` is loaded when unset.
    pub model_at: Option<String>,
    /// Pretrained model id or path.
    pub model_id: String,
    /// Number of leading layers to freeze, `-1` to train everything.
    pub n_freeze: i64,
    /// Also freeze the token embeddings.
    pub freeze_embed: bool,
    /// Number of evaluation prompts to generate for.
    pub num_samples: usize,
    /// Generation length cap.
    pub max_new_tokens: u32,
    /// `cpu`, `cuda[:N]` or `metal[:N]`.
    pub device: String,
    /// `f32`, `f16` or `bf16`.
    pub dtype: String,
    /// Save the model after evaluation.
    pub save_model: bool,
    /// `false`, `end` or `checkpoint`.
    pub log_model: String,
    /// Directory saved models are written under.
    pub models_folder: PathBuf,
    /// Suffix of the saved model name.
    pub model_name: String,
    /// Log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON logs.
    pub json_logs: bool,
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            project: "alpaca_ft".to_string(),
            run_dir: PathBuf::from("tracking"),
            dataset_at: "alpaca_gpt4_splitted:latest".to_string(),
            eval_split: "test".to_string(),
            model_at: None,
            model_id: "meta-llama/Llama-2-7b-hf".to_string(),
            n_freeze: 24,
            freeze_embed: true,
            num_samples: 10,
            max_new_tokens: 256,
            device: "cpu".to_string(),
            dtype: "f32".to_string(),
            save_model: false,
            log_model: "false".to_string(),
            models_folder: PathBuf::from("models"),
            model_name: "baseline".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl SftConfig {
    /// Loads defaults, the config file and the environment.
    ///
    /// A missing config file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a source holds a value of the wrong type.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Self::config_path()).extract()
    }

    /// The layered sources, reading the config file at `path`.
    #[must_use]
    pub fn figment(path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FORNEUS_"))
    }

    /// Path of the config file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from)
    }

    /// Device and dtype for model loading.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown device or dtype.
    pub fn model_options(&self) -> forneus_core::Result<ModelOptions> {
        Ok(ModelOptions::default()
            .with_device(self.device.parse::<DeviceType>()?)
            .with_dtype(self.dtype.parse::<DType>()?))
    }

    /// The configuration as a flat JSON map, for the run record.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn to_run_config(&self) -> forneus_core::Result<Map<String, Value>> {
        Ok(ConfigMap::from_serialize(self)?.to_json_map())
    }
}
