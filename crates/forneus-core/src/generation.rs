//! Generation settings for sampling text from a causal language model.
//!
//! The field set mirrors `generation_config.json` as written next to pretrained
//! checkpoints, so a config saved by another toolkit loads unchanged.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// One or more token ids, as found in `eos_token_id` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    /// A single id.
    Single(u32),
    /// Several ids, any of which matches.
    Multiple(Vec<u32>),
}

impl TokenIds {
    /// Returns the ids as a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            Self::Single(id) => vec![*id],
            Self::Multiple(ids) => ids.clone(),
        }
    }

    /// Returns `true` if `id` is one of the ids.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        match self {
            Self::Single(x) => *x == id,
            Self::Multiple(ids) => ids.contains(&id),
        }
    }
}

/// Parameters controlling text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate, ignoring the prompt.
    /// Default: 20
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    /// Sample from the distribution instead of greedy decoding.
    #[serde(default)]
    pub do_sample: bool,

    /// Temperature applied to logits when sampling.
    /// Default: 1.0
    #[serde(default = "default_one")]
    pub temperature: f32,

    /// Top-k filtering when sampling (0 = disabled).
    /// Default: 50
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Top-p (nucleus) filtering when sampling.
    /// Default: 1.0
    #[serde(default = "default_one")]
    pub top_p: f32,

    /// Repetition penalty (1.0 = no penalty).
    /// Default: 1.0
    #[serde(default = "default_one")]
    pub repetition_penalty: f32,

    /// Beginning of sequence token id.
    #[serde(default)]
    pub bos_token_id: Option<u32>,

    /// End of sequence token id(s).
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,

    /// Padding token id.
    #[serde(default)]
    pub pad_token_id: Option<u32>,

    /// Random seed for sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_max_new_tokens() -> u32 {
    20
}

fn default_one() -> f32 {
    1.0
}

fn default_top_k() -> u32 {
    50
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            do_sample: false,
            temperature: 1.0,
            top_k: default_top_k(),
            top_p: 1.0,
            repetition_penalty: 1.0,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// File name used for generation settings inside a checkpoint directory.
    pub const FILE_NAME: &'static str = "generation_config.json";

    /// Loads settings from a `generation_config.json` file.
    ///
    /// Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::model_load(format!(
                "Failed to read generation config {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::model_load(format!(
                "Failed to parse generation config {}: {e}",
                path.display()
            ))
        })
    }

    /// Writes the settings as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Returns the settings as an ordered key/value mapping.
    ///
    /// Keys come out in declaration order, which is the column order used when
    /// the settings are logged next to generated samples.
    #[must_use]
    pub fn to_dict(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Returns the end-of-sequence ids, if any.
    #[must_use]
    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(TokenIds::to_vec)
            .unwrap_or_default()
    }

    /// Sets the maximum number of new tokens.
    #[must_use]
    pub fn with_max_new_tokens(mut self, max_new_tokens: u32) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Enables or disables sampling.
    #[must_use]
    pub fn with_do_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = do_sample;
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the top-k value.
    #[must_use]
    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sets the top-p value.
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Sets the end-of-sequence id(s).
    #[must_use]
    pub fn with_eos_token_id(mut self, eos: TokenIds) -> Self {
        self.eos_token_id = Some(eos);
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_pretrained_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GenerationConfig::FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "_from_model_config": true,
                "bos_token_id": 1,
                "eos_token_id": [2, 32000],
                "pad_token_id": 0,
                "temperature": 0.6,
                "top_p": 0.9,
                "do_sample": true,
                "transformers_version": "4.31.0"
            }"#,
        )
        .unwrap();

        let cfg = GenerationConfig::from_file(&path).unwrap();
        assert!(cfg.do_sample);
        assert_eq!(cfg.eos_token_ids(), vec![2, 32000]);
        assert_eq!(cfg.max_new_tokens, 20);
        assert_eq!(cfg.top_k, 50);
    }

    #[test]
    fn test_to_dict_order() {
        let cfg = GenerationConfig::default()
            .with_max_new_tokens(256)
            .with_eos_token_id(TokenIds::Single(2));
        let keys: Vec<_> = cfg.to_dict().keys().cloned().collect();
        assert_eq!(
            keys,
            [
                "max_new_tokens",
                "do_sample",
                "temperature",
                "top_k",
                "top_p",
                "repetition_penalty",
                "bos_token_id",
                "eos_token_id",
                "pad_token_id",
            ]
        );
        assert_eq!(cfg.to_dict()["max_new_tokens"], 256);
        assert_eq!(cfg.to_dict()["eos_token_id"], 2);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GenerationConfig::FILE_NAME);
        let cfg = GenerationConfig::default().with_do_sample(true).with_top_k(5);
        cfg.save(&path).unwrap();
        assert_eq!(GenerationConfig::from_file(&path).unwrap(), cfg);
    }
}
