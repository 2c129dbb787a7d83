//! LoRA adapters for linear projections.
//!
//! Adapter checkpoints follow the PEFT layout: `adapter_config.json` next to
//! `adapter_model.safetensors`, with tensor names prefixed by
//! [`LoraConfig::PEFT_PREFIX`].

use std::path::Path;

use candle_core::{Module, Result as CandleResult, Tensor};
use candle_nn::{linear_no_bias, Init, Linear, VarBuilder};
use forneus_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration for LoRA adaptation, as stored in `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of adaptation matrices.
    pub r: usize,
    /// Scaling factor (alpha).
    #[serde(rename = "lora_alpha")]
    pub alpha: f64,
    /// Dropout probability. Only meaningful while training.
    #[serde(rename = "lora_dropout", default)]
    pub dropout: f64,
    /// Target modules to adapt.
    pub target_modules: Vec<String>,
    /// Base model the adapter was trained on.
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    /// Adapter type; always `LORA`.
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    /// Task type the adapter was trained for.
    #[serde(default = "default_task_type")]
    pub task_type: String,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            base_model_name_or_path: None,
            peft_type: default_peft_type(),
            task_type: default_task_type(),
        }
    }
}

impl LoraConfig {
    /// File name of the adapter configuration.
    pub const CONFIG_FILE: &'static str = "adapter_config.json";
    /// File name of the adapter weights.
    pub const WEIGHTS_FILE: &'static str = "adapter_model.safetensors";
    /// Prefix PEFT puts in front of every adapter tensor name.
    pub const PEFT_PREFIX: &'static str = "base_model.model.";

    /// Loads an adapter configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it describes
    /// an adapter type other than LoRA.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::model_load(format!("Failed to read adapter config: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::model_load(format!("Failed to parse adapter config: {e}")))?;
        if config.peft_type != "LORA" {
            return Err(Error::model_load(format!(
                "Unsupported adapter type `{}`",
                config.peft_type
            )));
        }
        if config.r == 0 {
            return Err(Error::model_load("LoRA rank must be positive"));
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

    /// Output scaling applied to the low-rank update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scale(&self) -> f64 {
        self.alpha / self.r as f64
    }

    /// Returns `true` if the projection named `module` gets an adapter.
    #[must_use]
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|t| t == module)
    }

    /// Returns `true` if a parameter name belongs to an adapter.
    #[must_use]
    pub fn is_adapter_param(name: &str) -> bool {
        name.contains(".lora_A.") || name.contains(".lora_B.")
    }
}

/// Low-rank update `B · A` added on top of a frozen projection.
#[derive(Debug, Clone)]
struct LoraAdapter {
    lora_a: Linear,
    lora_b: Linear,
    scale: f64,
}

/// Linear projection with an optional LoRA adapter.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    adapter: Option<LoraAdapter>,
}

impl LoraLinear {
    /// Creates the projection `name` under `vb`, adding an adapter when `lora`
    /// targets it.
    ///
    /// Adapter weights live at `<name>.lora_A.weight` (`r × in`, uniform init)
    /// and `<name>.lora_B.weight` (`out × r`, zeros), so a fresh adapter leaves
    /// the output unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be created or loaded.
    #[allow(clippy::cast_precision_loss)]
    pub fn load(
        in_dim: usize,
        out_dim: usize,
        name: &str,
        lora: Option<&LoraConfig>,
        vb: &VarBuilder,
    ) -> CandleResult<Self> {
        let vb = vb.pp(name);
        let base = linear_no_bias(in_dim, out_dim, vb.clone())?;
        let adapter = match lora {
            Some(cfg) if cfg.targets(name) => {
                let bound = 1.0 / (in_dim as f64).sqrt();
                let a = vb.pp("lora_A").get_with_hints(
                    (cfg.r, in_dim),
                    "weight",
                    Init::Uniform {
                        lo: -bound,
                        up: bound,
                    },
                )?;
                let b = vb
                    .pp("lora_B")
                    .get_with_hints((out_dim, cfg.r), "weight", Init::Const(0.0))?;
                Some(LoraAdapter {
                    lora_a: Linear::new(a, None),
                    lora_b: Linear::new(b, None),
                    scale: cfg.scale(),
                })
            }
            _ => None,
        };
        Ok(Self { base, adapter })
    }

    /// Returns `true` if this projection carries an adapter.
    #[must_use]
    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }
}

impl Module for LoraLinear {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let out = self.base.forward(x)?;
        match &self.adapter {
            Some(adapter) => {
                let update = adapter.lora_b.forward(&adapter.lora_a.forward(x)?)?;
                out + (update * adapter.scale)?
            }
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_parse_peft_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LoraConfig::CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{
                "base_model_name_or_path": "meta-llama/Llama-2-7b-hf",
                "bias": "none",
                "lora_alpha": 32,
                "lora_dropout": 0.1,
                "peft_type": "LORA",
                "r": 16,
                "target_modules": ["q_proj", "k_proj", "v_proj", "o_proj"],
                "task_type": "CAUSAL_LM"
            }"#,
        )
        .unwrap();

        let config = LoraConfig::from_file(&path).unwrap();
        assert_eq!(config.r, 16);
        assert!((config.scale() - 2.0).abs() < f64::EPSILON);
        assert!(config.targets("o_proj"));
        assert!(!config.targets("up_proj"));
        assert_eq!(
            config.base_model_name_or_path.as_deref(),
            Some("meta-llama/Llama-2-7b-hf")
        );
    }

    #[test]
    fn test_fresh_adapter_is_identity() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = LoraConfig::default();
        let with = LoraLinear::load(4, 6, "q_proj", Some(&cfg), &vb.pp("a")).unwrap();
        assert!(with.has_adapter());
        let untargeted = LoraLinear::load(4, 6, "up_proj", Some(&cfg), &vb.pp("b")).unwrap();
        assert!(!untargeted.has_adapter());

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"a.q_proj.lora_A.weight".to_string()));
        assert!(names.contains(&"a.q_proj.lora_B.weight".to_string()));
        assert!(names.iter().all(|n| !n.starts_with("b.up_proj.lora")));

        let x = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let y = with.forward(&x).unwrap();
        let base = with.base.forward(&x).unwrap();
        let diff = (y - base)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
