//! Model configuration loaded from and saved to `config.json`.

use std::path::Path;

use forneus_core::{Error, GenerationConfig, Result, TokenIds};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Llama-family model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaConfig {
    /// Architecture list.
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,
    /// Model architecture type.
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Hidden size (embedding dimension).
    pub hidden_size: usize,
    /// Intermediate size for MLP.
    pub intermediate_size: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Number of hidden layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Tie word embeddings.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// BOS token ID.
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    /// EOS token ID(s).
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    /// Padding token ID.
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    /// Keys this crate does not interpret, kept so saving does not drop them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_architectures() -> Vec<String> {
    vec!["LlamaForCausalLM".to_string()]
}

fn default_model_type() -> String {
    "llama".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    /// File name of the configuration inside a checkpoint directory.
    pub const FILE_NAME: &'static str = "config.json";

    /// Loads configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::model_load(format!("Failed to read config: {e}")))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::model_load(format!("Failed to parse config: {e}")))?;

        if config.model_type != "llama" && config.model_type != "mistral" {
            return Err(Error::model_load(format!(
                "Unsupported model type `{}`",
                config.model_type
            )));
        }
        if config.num_attention_heads == 0 || config.hidden_size % config.num_attention_heads != 0
        {
            return Err(Error::model_load(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                config.hidden_size, config.num_attention_heads
            )));
        }
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Returns the number of key-value heads.
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Returns the head dimension.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Generation defaults derived from the special token ids of this config.
    ///
    /// Used when a checkpoint ships without `generation_config.json`.
    #[must_use]
    pub fn generation_defaults(&self) -> GenerationConfig {
        GenerationConfig {
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id.clone(),
            pad_token_id: self.pad_token_id,
            ..GenerationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLAMA2_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "bos_token_id": 1,
        "eos_token_id": 2,
        "hidden_act": "silu",
        "hidden_size": 4096,
        "intermediate_size": 11008,
        "max_position_embeddings": 4096,
        "model_type": "llama",
        "num_attention_heads": 32,
        "num_hidden_layers": 32,
        "num_key_value_heads": 32,
        "rms_norm_eps": 1e-05,
        "tie_word_embeddings": false,
        "torch_dtype": "float16",
        "vocab_size": 32000
    }"#;

    #[test]
    fn test_parse_llama2_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LlamaConfig::FILE_NAME);
        std::fs::write(&path, LLAMA2_CONFIG).unwrap();

        let config = LlamaConfig::from_file(&path).unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.num_kv_heads(), 32);
        assert_eq!(config.extra["torch_dtype"], "float16");

        let generation = config.generation_defaults();
        assert_eq!(generation.eos_token_ids(), vec![2]);
        assert_eq!(generation.bos_token_id, Some(1));
    }

    #[test]
    fn test_save_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LlamaConfig::FILE_NAME);
        std::fs::write(&path, LLAMA2_CONFIG).unwrap();
        let config = LlamaConfig::from_file(&path).unwrap();

        let out = dir.path().join("saved.json");
        config.save(&out).unwrap();
        assert_eq!(LlamaConfig::from_file(&out).unwrap(), config);
    }

    #[test]
    fn test_rejects_other_architectures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LlamaConfig::FILE_NAME);
        std::fs::write(&path, LLAMA2_CONFIG.replace("\"llama\"", "\"gpt2\"")).unwrap();
        assert!(LlamaConfig::from_file(&path).is_err());
    }
}
