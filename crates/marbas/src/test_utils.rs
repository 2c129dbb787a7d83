//! Tiny offline fixtures for tests: a four-layer Llama config, a word-level
//! tokenizer and a complete checkpoint directory.

use std::path::Path;

use candle_core::{DType, Device};
use forneus_core::{Result, TokenIds};
use serde_json::{json, Map, Value};

use crate::config::LlamaConfig;
use crate::lora::LoraConfig;
use crate::models::CausalLm;

/// Words of the tiny vocabulary, in id order.
pub const VOCAB: [&str; 16] = [
    "<unk>", "<s>", "</s>", "hello", "world", "the", "quick", "brown", "fox", "jumps", "over",
    "lazy", "dog", "instruction", "response", "###",
];

/// Number of decoder layers in [`tiny_config`].
pub const TINY_LAYERS: usize = 4;

/// A four-layer Llama configuration small enough for unit tests.
#[must_use]
pub fn tiny_config() -> LlamaConfig {
    LlamaConfig {
        architectures: vec!["LlamaForCausalLM".to_string()],
        model_type: "llama".to_string(),
        hidden_size: 16,
        intermediate_size: 32,
        vocab_size: VOCAB.len(),
        num_hidden_layers: TINY_LAYERS,
        num_attention_heads: 2,
        num_key_value_heads: Some(1),
        rms_norm_eps: 1e-5,
        rope_theta: 10000.0,
        max_position_embeddings: 64,
        tie_word_embeddings: false,
        bos_token_id: Some(1),
        eos_token_id: Some(TokenIds::Single(2)),
        pad_token_id: None,
        extra: Map::new(),
    }
}

/// Writes `tokenizer.json` and `tokenizer_config.json` for the tiny vocabulary.
///
/// # Errors
///
/// Returns an error if the files cannot be written.
pub fn write_tiny_tokenizer(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let vocab: Map<String, Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, w)| ((*w).to_string(), json!(i)))
        .collect();
    let added: Vec<Value> = VOCAB[..3]
        .iter()
        .enumerate()
        .map(|(i, w)| {
            json!({
                "id": i,
                "content": w,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    std::fs::write(
        dir.join("tokenizer.json"),
        serde_json::to_string_pretty(&tokenizer)?,
    )?;
    std::fs::write(
        dir.join("tokenizer_config.json"),
        serde_json::to_string_pretty(&json!({
            "bos_token": "<s>",
            "eos_token": { "content": "</s>", "special": true },
            "model_max_length": 64
        }))?,
    )?;
    Ok(())
}

/// Builds a randomly initialised tiny model.
///
/// # Errors
///
/// Returns an error if tensors cannot be allocated.
pub fn tiny_model(name_or_path: &str) -> Result<CausalLm> {
    CausalLm::new(tiny_config(), None, name_or_path, DType::F32, &Device::Cpu)
}

/// Writes a complete plain checkpoint (weights, configs and tokenizer) to `dir`.
///
/// Returns the model whose weights were written.
///
/// # Errors
///
/// Returns an error if any file cannot be written.
pub fn write_tiny_checkpoint(dir: &Path) -> Result<CausalLm> {
    let model = tiny_model(&dir.to_string_lossy())?;
    model.save_pretrained(dir)?;
    write_tiny_tokenizer(dir)?;
    Ok(model)
}

/// Writes an adapter checkpoint for a tiny base model stored at `base_dir`.
///
/// # Errors
///
/// Returns an error if any file cannot be written.
pub fn write_tiny_adapter(dir: &Path, base_dir: &Path) -> Result<CausalLm> {
    let lora = LoraConfig {
        r: 2,
        base_model_name_or_path: Some(base_dir.to_string_lossy().into_owned()),
        ..LoraConfig::default()
    };
    let model = CausalLm::new(
        tiny_config(),
        Some(lora),
        base_dir.to_string_lossy(),
        DType::F32,
        &Device::Cpu,
    )?;
    model.save_pretrained(dir)?;
    Ok(model)
}
