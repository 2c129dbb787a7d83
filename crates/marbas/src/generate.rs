//! Autoregressive decoding.

use candle_core::{IndexOp, Tensor};
use forneus_core::{Error, GenerationConfig, Result};
use tracing::trace;

use crate::models::CausalLm;
use crate::sampler::Sampler;
use crate::tokenizer::Tokenizer;

/// Generates up to `config.max_new_tokens` tokens after `prompt`.
///
/// Returns only the new tokens. Generation stops after the first token that is
/// one of the end-of-sequence ids, which is included in the output. Logits are
/// detached before sampling so no backward graph is retained.
///
/// # Errors
///
/// Returns an error if the prompt is empty or a forward pass fails.
pub fn generate(model: &mut CausalLm, prompt: &[u32], config: &GenerationConfig) -> Result<Vec<u32>> {
    if prompt.is_empty() {
        return Err(Error::tokenization("cannot generate from an empty prompt"));
    }

    let eos_ids = config.eos_token_ids();
    let mut sampler = Sampler::new(config.clone());
    let mut tokens = prompt.to_vec();
    let mut generated = Vec::new();

    model.clear_cache();
    let device = model.device().clone();

    let input = Tensor::new(prompt, &device)?.unsqueeze(0)?;
    let mut logits = model.forward(&input, 0)?.detach();
    let mut pos = prompt.len();

    for _ in 0..config.max_new_tokens {
        let seq_len = logits.dim(1)?;
        let last: Vec<f32> = logits
            .i((0, seq_len - 1))?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;
        let next = sampler.sample(&last, &tokens);
        trace!(token = next, "Sampled token");

        tokens.push(next);
        generated.push(next);
        if eos_ids.contains(&next) {
            break;
        }

        let input = Tensor::new(&[next], &device)?.unsqueeze(0)?;
        logits = model.forward(&input, pos)?.detach();
        pos += 1;
    }

    model.clear_cache();
    Ok(generated)
}

/// Tokenizes `prompt`, generates, and decodes only the new tokens with special
/// tokens skipped.
///
/// When `config` names no end-of-sequence id, the tokenizer's is used.
///
/// # Errors
///
/// Returns an error if tokenization or generation fails.
pub fn generate_text(
    model: &mut CausalLm,
    tokenizer: &Tokenizer,
    prompt: &str,
    config: &GenerationConfig,
) -> Result<String> {
    let prompt_ids = tokenizer.encode(prompt, true)?;
    let new_ids = match (&config.eos_token_id, tokenizer.eos_token_id()) {
        (None, Some(eos)) => {
            let config = config
                .clone()
                .with_eos_token_id(forneus_core::TokenIds::Single(eos));
            generate(model, &prompt_ids, &config)?
        }
        _ => generate(model, &prompt_ids, config)?,
    };
    tokenizer.decode(&new_ids, true)
}
