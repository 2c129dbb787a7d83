//! Layer freezing for partial fine-tuning.

use forneus_core::{Error, Result};
use marbas::CausalLm;
use tracing::{debug, info};

/// Suffix of the module holding the numbered transformer layers.
pub const LAYERS: &str = "layers";
/// Suffix of the token embedding module.
pub const EMBED_TOKENS: &str = "embed_tokens";

fn find(model: &CausalLm, suffix: &str) -> Result<String> {
    model
        .params()
        .find_module(suffix)
        .ok_or_else(|| Error::ModuleNotFound {
            name: suffix.to_string(),
        })
}

/// Freezes every parameter except the output head and the transformer layers
/// from index `n_freeze` on.
///
/// `n_freeze == -1` leaves the model untouched. Other negative values count
/// from the end, like a slice start. With `freeze_embed`, the token embedding
/// weight is frozen as well, which also freezes a head tied to it.
///
/// # Errors
///
/// Returns [`Error::ModuleNotFound`] if the model has no `layers` module, or no
/// `embed_tokens` module when `freeze_embed` is set.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
pub fn freeze(model: &mut CausalLm, n_freeze: i64, freeze_embed: bool) -> Result<()> {
    if n_freeze == -1 {
        debug!("n_freeze is -1, leaving every parameter as it is");
        return Ok(());
    }

    let layers = find(model, LAYERS)?;
    let embed = if freeze_embed {
        Some(find(model, EMBED_TOKENS)?)
    } else {
        None
    };
    let head = model.head_module();

    let params = model.params_mut();
    params.set_all_trainable(false);
    params.set_module_trainable(head, true);

    let indices = params.child_indices(&layers);
    let len = indices.len() as i64;
    let start = if n_freeze < 0 {
        (len + n_freeze).max(0)
    } else {
        n_freeze.min(len)
    };
    let start = start as usize;
    for idx in &indices[start..] {
        params.set_module_trainable(&format!("{layers}.{idx}"), true);
    }

    if let Some(embed) = embed {
        params.set_trainable(&format!("{embed}.weight"), false)?;
    }

    info!(
        n_freeze,
        freeze_embed,
        trainable_layers = indices.len() - start,
        "Froze model layers"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use marbas::test_utils::{tiny_config, tiny_model, TINY_LAYERS};

    fn trainable_layers(model: &CausalLm) -> Vec<usize> {
        (0..TINY_LAYERS)
            .filter(|i| {
                model
                    .params()
                    .names()
                    .filter(|n| n.starts_with(&format!("model.layers.{i}.")))
                    .all(|n| model.params().is_trainable(n) == Some(true))
            })
            .collect()
    }

    #[test]
    fn test_minus_one_is_a_no_op() {
        let mut model = tiny_model("tiny").unwrap();
        model
            .params_mut()
            .set_trainable("model.norm.weight", false)
            .unwrap();
        let before: Vec<_> = model
            .params()
            .names()
            .map(|n| (n.to_string(), model.params().is_trainable(n)))
            .collect();

        freeze(&mut model, -1, true).unwrap();

        let after: Vec<_> = model
            .params()
            .names()
            .map(|n| (n.to_string(), model.params().is_trainable(n)))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_freeze_first_two_layers_and_embeddings() {
        let mut model = tiny_model("tiny").unwrap();
        freeze(&mut model, 2, true).unwrap();

        assert_eq!(trainable_layers(&model), vec![2, 3]);
        let params = model.params();
        assert_eq!(params.is_trainable("lm_head.weight"), Some(true));
        assert_eq!(params.is_trainable("model.embed_tokens.weight"), Some(false));
        assert_eq!(params.is_trainable("model.norm.weight"), Some(false));
        assert!(params
            .names()
            .filter(|n| n.starts_with("model.layers.0.") || n.starts_with("model.layers.1."))
            .all(|n| params.is_trainable(n) == Some(false)));
    }

    #[test]
    fn test_negative_start_counts_from_end() {
        let mut model = tiny_model("tiny").unwrap();
        freeze(&mut model, -3, false).unwrap();
        assert_eq!(trainable_layers(&model), vec![1, 2, 3]);
        assert_eq!(
            model.params().is_trainable("model.embed_tokens.weight"),
            Some(false)
        );
    }

    #[test]
    fn test_start_past_end_leaves_only_head() {
        let mut model = tiny_model("tiny").unwrap();
        freeze(&mut model, 10, false).unwrap();
        assert!(trainable_layers(&model).is_empty());
        assert_eq!(model.params().is_trainable("lm_head.weight"), Some(true));
    }

    #[test]
    fn test_tied_head_unfreezes_embeddings() {
        let mut config = tiny_config();
        config.tie_word_embeddings = true;
        let mut model = CausalLm::new(config, None, "tied", DType::F32, &Device::Cpu).unwrap();

        freeze(&mut model, 2, false).unwrap();
        assert_eq!(
            model.params().is_trainable("model.embed_tokens.weight"),
            Some(true)
        );

        freeze(&mut model, 2, true).unwrap();
        assert_eq!(
            model.params().is_trainable("model.embed_tokens.weight"),
            Some(false)
        );
    }
}
